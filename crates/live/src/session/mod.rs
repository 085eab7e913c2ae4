//! Per-process registry of live document sessions.
//!
//! Each document with at least one local participant has exactly one session
//! task owning its replica. Connections, the realtime broadcast endpoint and
//! server-side agents reach it only through [`SessionRegistry`].

mod awareness;
mod document;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use quire_common::protocol::envelope::{Envelope, EnvelopeBody};
use quire_common::protocol::events::{RealtimeEvent, ServerEvent};
use quire_common::types::DocumentKey;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;
use yrs::sync::awareness::AwarenessUpdate;
use yrs::{StateVector, TransactionMut};

use crate::backplane::Backplane;
use crate::config::SessionConfig;
use crate::crdt::Replica;
use crate::persistence::{DocumentStore, LoadError, SaveFailure};

use document::DocumentSession;

pub type ConnectionId = Uuid;

/// Frames a session pushes to one connection.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Binary(Vec<u8>),
    Event(ServerEvent),
}

/// A participant as seen by a session.
#[derive(Debug, Clone)]
pub struct ClientHandle {
    pub id: ConnectionId,
    pub user_id: Uuid,
    outbound: mpsc::UnboundedSender<Outbound>,
}

impl ClientHandle {
    pub fn new(user_id: Uuid) -> (Self, mpsc::UnboundedReceiver<Outbound>) {
        let (outbound, receiver) = mpsc::unbounded_channel();
        (Self { id: Uuid::new_v4(), user_id, outbound }, receiver)
    }

    fn send(&self, frame: Outbound) -> bool {
        self.outbound.send(frame).is_ok()
    }
}

type TransactJob = Box<dyn FnOnce(&Replica) -> Vec<u8> + Send>;

enum Command {
    Join { client: ClientHandle },
    Leave { id: ConnectionId },
    SyncStep1 { id: ConnectionId, state_vector: StateVector },
    Update { id: ConnectionId, update: Vec<u8> },
    Awareness { id: ConnectionId, update: AwarenessUpdate },
    AwarenessQuery { id: ConnectionId },
    Transact { job: TransactJob },
    Deliver { event: RealtimeEvent, reply: oneshot::Sender<usize> },
    Snapshot { reply: oneshot::Sender<Vec<u8>> },
    Status { reply: oneshot::Sender<SessionStatus> },
    Flush { reply: oneshot::Sender<Result<(), SaveFailure>> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionStatus {
    pub clients: usize,
    pub dirty: bool,
    pub saving: bool,
    pub last_persisted_at: Option<DateTime<Utc>>,
}

#[derive(Clone)]
struct SessionHandle {
    generation: u64,
    commands: mpsc::UnboundedSender<Command>,
}

impl SessionHandle {
    fn send(&self, command: Command) -> bool {
        self.commands.send(command).is_ok()
    }

    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> Command) -> Option<T> {
        let (reply, response) = oneshot::channel();
        if !self.send(build(reply)) {
            return None;
        }
        response.await.ok()
    }
}

type LoadOutcome = Option<Result<(), LoadError>>;

enum Slot {
    Loading(watch::Receiver<LoadOutcome>),
    Active(SessionHandle),
}

struct RegistryInner {
    process_id: Uuid,
    store: DocumentStore,
    backplane: Backplane,
    config: SessionConfig,
    slots: Mutex<HashMap<DocumentKey, Slot>>,
    next_generation: AtomicU64,
}

#[derive(Debug, Error)]
pub enum AgentError {
    #[error(transparent)]
    Load(#[from] LoadError),
    #[error("document session closed before the transaction ran")]
    Closed,
}

/// A connection's membership in a session. Dropping it leaves the session.
pub struct SessionMembership {
    key: DocumentKey,
    id: ConnectionId,
    handle: SessionHandle,
}

impl SessionMembership {
    pub fn key(&self) -> DocumentKey {
        self.key
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.id
    }

    pub fn sync_step1(&self, state_vector: StateVector) {
        self.handle.send(Command::SyncStep1 { id: self.id, state_vector });
    }

    pub fn update(&self, update: Vec<u8>) {
        self.handle.send(Command::Update { id: self.id, update });
    }

    pub fn awareness(&self, update: AwarenessUpdate) {
        self.handle.send(Command::Awareness { id: self.id, update });
    }

    pub fn awareness_query(&self) {
        self.handle.send(Command::AwarenessQuery { id: self.id });
    }

    /// Current full state of the document.
    pub async fn snapshot(&self) -> Option<Vec<u8>> {
        self.handle.request(|reply| Command::Snapshot { reply }).await
    }
}

impl Drop for SessionMembership {
    fn drop(&mut self) {
        self.handle.send(Command::Leave { id: self.id });
    }
}

#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<RegistryInner>,
}

impl SessionRegistry {
    pub fn new(store: DocumentStore, backplane: Backplane, config: SessionConfig) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                process_id: Uuid::new_v4(),
                store,
                backplane,
                config,
                slots: Mutex::new(HashMap::new()),
                next_generation: AtomicU64::new(1),
            }),
        }
    }

    /// Identifies this process on the backplane.
    pub fn process_id(&self) -> Uuid {
        self.inner.process_id
    }

    pub fn store(&self) -> &DocumentStore {
        &self.inner.store
    }

    pub fn backplane(&self) -> &Backplane {
        &self.inner.backplane
    }

    /// Join `client` to the document's session, creating and loading it if
    /// needed. Concurrent callers for one document share a single load.
    pub async fn acquire(
        &self,
        key: DocumentKey,
        client: ClientHandle,
    ) -> Result<SessionMembership, LoadError> {
        let id = client.id;
        loop {
            let mut pending = {
                let mut slots = self.inner.slots.lock().await;
                let existing = slots.get(&key).map(|slot| match slot {
                    Slot::Active(handle) => Ok(handle.clone()),
                    Slot::Loading(pending) => Err(pending.clone()),
                });

                match existing {
                    Some(Ok(handle)) => {
                        // Joining under the registry lock keeps a draining
                        // session from retiring between lookup and join.
                        if handle.send(Command::Join { client: client.clone() }) {
                            return Ok(SessionMembership { key, id, handle });
                        }
                        slots.remove(&key);
                        continue;
                    }
                    Some(Err(pending)) => pending,
                    None => {
                        let (done, pending) = watch::channel(None);
                        slots.insert(key, Slot::Loading(pending.clone()));
                        tokio::spawn(load_session(Arc::clone(&self.inner), key, done));
                        pending
                    }
                }
            };

            let outcome = pending.wait_for(Option::is_some).await.map(|outcome| outcome.clone());
            match outcome {
                Ok(Some(Err(error))) => return Err(error),
                Ok(_) => continue,
                Err(_) => return Err(LoadError::Unavailable("document load was aborted".into())),
            }
        }
    }

    /// Run `f` against the document as a server-side participant. The
    /// resulting delta is merged, relayed, published and persisted like any
    /// client edit.
    pub async fn transact<F, R>(&self, key: DocumentKey, f: F) -> Result<R, AgentError>
    where
        F: FnOnce(&mut TransactionMut) -> R + Send + 'static,
        R: Send + 'static,
    {
        let (client, _outbound) = ClientHandle::new(Uuid::nil());
        let membership = self.acquire(key, client).await?;

        let (reply, response) = oneshot::channel();
        let job: TransactJob = Box::new(move |replica: &Replica| {
            let (output, update) = replica.transact(f);
            let _ = reply.send(output);
            update
        });
        if !membership.handle.send(Command::Transact { job }) {
            return Err(AgentError::Closed);
        }
        response.await.map_err(|_| AgentError::Closed)
    }

    /// Deliver a realtime event to every connection on the document, here and
    /// on sibling processes. Returns the number of local deliveries.
    pub async fn broadcast_event(&self, key: DocumentKey, event: RealtimeEvent) -> usize {
        let envelope =
            Envelope::fanout(key, self.inner.process_id, EnvelopeBody::Event(event.clone()));
        if !self.inner.backplane.publish(&envelope).await {
            debug!(document_id = %key.document_id, "backplane unavailable, realtime event delivered locally only");
        }

        match self.active_handle(key).await {
            Some(handle) => handle.request(|reply| Command::Deliver { event, reply }).await.unwrap_or(0),
            None => 0,
        }
    }

    pub async fn status(&self, key: DocumentKey) -> Option<SessionStatus> {
        self.active_handle(key).await?.request(|reply| Command::Status { reply }).await
    }

    pub async fn is_active(&self, key: DocumentKey) -> bool {
        self.active_handle(key).await.is_some()
    }

    pub async fn session_count(&self) -> usize {
        self.inner.slots.lock().await.values().filter(|slot| matches!(slot, Slot::Active(_))).count()
    }

    /// Persist every dirty session. Used on shutdown.
    pub async fn flush_all(&self) -> usize {
        let handles = {
            let slots = self.inner.slots.lock().await;
            slots
                .iter()
                .filter_map(|(key, slot)| match slot {
                    Slot::Active(handle) => Some((*key, handle.clone())),
                    Slot::Loading(_) => None,
                })
                .collect::<Vec<_>>()
        };

        let mut failures = 0;
        for (key, handle) in handles {
            match handle.request(|reply| Command::Flush { reply }).await {
                Some(Ok(())) | None => {}
                Some(Err(failure)) => {
                    failures += 1;
                    warn!(
                        workspace_id = %key.workspace_id,
                        document_id = %key.document_id,
                        error = %failure,
                        "failed to flush document on shutdown"
                    );
                }
            }
        }
        failures
    }

    async fn active_handle(&self, key: DocumentKey) -> Option<SessionHandle> {
        match self.inner.slots.lock().await.get(&key) {
            Some(Slot::Active(handle)) => Some(handle.clone()),
            _ => None,
        }
    }
}

async fn load_session(
    inner: Arc<RegistryInner>,
    key: DocumentKey,
    done: watch::Sender<LoadOutcome>,
) {
    let loaded = inner.store.load(key).await;

    let mut slots = inner.slots.lock().await;
    let outcome = match loaded {
        Ok(replica) => {
            let generation = inner.next_generation.fetch_add(1, Ordering::Relaxed);
            let handle = DocumentSession::spawn(Arc::clone(&inner), key, generation, replica);
            slots.insert(key, Slot::Active(handle));
            info!(
                workspace_id = %key.workspace_id,
                document_id = %key.document_id,
                generation,
                "document session loaded"
            );
            Ok(())
        }
        Err(error) => {
            // Not cached: the next connection retries the load.
            slots.remove(&key);
            warn!(
                workspace_id = %key.workspace_id,
                document_id = %key.document_id,
                error = %error,
                "failed to load document"
            );
            Err(error)
        }
    };
    drop(slots);
    done.send_replace(Some(outcome));
}
