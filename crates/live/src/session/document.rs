// The task that owns one document's replica.
//
// State machine: Active (has participants) -> Draining (no participants,
// flushing) -> retired (removed from the registry). A join while draining
// returns the session to Active.

use std::collections::HashMap;
use std::future::pending;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use quire_common::protocol::envelope::{Envelope, EnvelopeBody};
use quire_common::protocol::events::{ErrorEvent, RealtimeEvent, ServerEvent};
use quire_common::protocol::sync::{
    awareness_records, awareness_update, decode_awareness_payload, encode_awareness,
    encode_sync_step1, encode_sync_step2, encode_update, is_empty_update, AwarenessRecord,
};
use quire_common::types::DocumentKey;
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::awareness::AwarenessTable;
use super::{ClientHandle, Command, ConnectionId, Outbound, RegistryInner, SessionHandle, SessionStatus, Slot};
use crate::backplane::Subscription;
use crate::crdt::Replica;
use crate::guard::store_error_event;
use crate::persistence::SaveFailure;

const AWARENESS_SWEEP_INTERVAL: Duration = Duration::from_secs(5);
const MAX_TEARDOWN_ATTEMPTS: u32 = 3;

pub(super) struct DocumentSession {
    inner: Arc<RegistryInner>,
    key: DocumentKey,
    generation: u64,
    replica: Replica,
    commands: mpsc::UnboundedReceiver<Command>,
    subscription: Subscription,
    clients: HashMap<ConnectionId, ClientHandle>,
    awareness: AwarenessTable,
    /// Bumped on every local edit.
    edit_seq: u64,
    /// `edit_seq` covered by the last successful save.
    saved_seq: u64,
    first_unsaved_at: Option<Instant>,
    /// Local connections with edits since the last successful save.
    contributors: HashMap<ConnectionId, Uuid>,
    flush_at: Option<Instant>,
    saving: Option<(u64, JoinHandle<Result<(), SaveFailure>>)>,
    last_persisted_at: Option<DateTime<Utc>>,
    teardown_failures: u32,
    abandoned: bool,
    retire_at: Option<Instant>,
}

impl DocumentSession {
    pub(super) fn spawn(
        inner: Arc<RegistryInner>,
        key: DocumentKey,
        generation: u64,
        replica: Replica,
    ) -> SessionHandle {
        let (commands_tx, commands) = mpsc::unbounded_channel();
        let subscription = inner.backplane.subscribe(key);
        let session = Self {
            inner,
            key,
            generation,
            replica,
            commands,
            subscription,
            clients: HashMap::new(),
            awareness: AwarenessTable::default(),
            edit_seq: 0,
            saved_seq: 0,
            first_unsaved_at: None,
            contributors: HashMap::new(),
            flush_at: None,
            saving: None,
            last_persisted_at: None,
            teardown_failures: 0,
            abandoned: false,
            retire_at: None,
        };
        tokio::spawn(session.run());
        SessionHandle { generation, commands: commands_tx }
    }

    async fn run(mut self) {
        let mut sweep = tokio::time::interval(AWARENESS_SWEEP_INTERVAL);
        sweep.reset();

        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },
                Some(envelope) = self.subscription.recv() => self.handle_envelope(envelope),
                _ = sleep_until_opt(self.flush_at) => {
                    self.flush_at = None;
                    self.start_save();
                }
                joined = join_opt(&mut self.saving) => {
                    let seq = self.saving.take().map(|(seq, _)| seq).unwrap_or(self.saved_seq);
                    self.finish_save(seq, joined);
                }
                _ = sweep.tick() => {
                    let expired = self.awareness.expire_remote(Instant::now());
                    self.relay_awareness(expired, None);
                }
                _ = sleep_until_opt(self.retire_at) => {
                    if self.try_retire().await {
                        break;
                    }
                }
            }
            self.update_drain_state();
        }

        info!(
            workspace_id = %self.key.workspace_id,
            document_id = %self.key.document_id,
            generation = self.generation,
            "document session retired"
        );
    }

    fn is_dirty(&self) -> bool {
        self.edit_seq != self.saved_seq
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Join { client } => {
                debug!(document_id = %self.key.document_id, connection_id = %client.id, "participant joined");
                self.clients.insert(client.id, client);
                self.retire_at = None;
                self.teardown_failures = 0;
                if self.abandoned {
                    self.abandoned = false;
                    self.schedule_flush();
                }
            }
            Command::Leave { id } => self.leave(id),
            Command::SyncStep1 { id, state_vector } => {
                let Some(client) = self.clients.get(&id) else {
                    return;
                };
                client.send(Outbound::Binary(encode_sync_step2(self.replica.diff(&state_vector))));
                client.send(Outbound::Binary(encode_sync_step1(self.replica.state_vector())));
                let states = self.awareness.states();
                if !states.is_empty() {
                    client.send(Outbound::Binary(encode_awareness(awareness_update(states))));
                }
            }
            Command::Update { id, update } => {
                if let Err(error) = self.replica.apply_update(&update) {
                    warn!(
                        document_id = %self.key.document_id,
                        connection_id = %id,
                        error = %error,
                        "dropping undecodable update"
                    );
                    return;
                }
                self.after_local_change(Some(id), update);
            }
            Command::Awareness { id, update } => {
                if !self.clients.contains_key(&id) {
                    return;
                }
                let accepted = self.awareness.apply_local(id, awareness_records(&update));
                self.relay_awareness(accepted.clone(), Some(id));
                self.publish_awareness(accepted);
            }
            Command::AwarenessQuery { id } => {
                let states = self.awareness.states();
                if let Some(client) = self.clients.get(&id) {
                    client.send(Outbound::Binary(encode_awareness(awareness_update(states))));
                }
            }
            Command::Transact { job } => {
                let update = job(&self.replica);
                if !is_empty_update(&update) {
                    self.after_local_change(None, update);
                }
            }
            Command::Deliver { event, reply } => {
                let delivered = self.deliver_event(&event, None);
                let _ = reply.send(delivered);
            }
            Command::Snapshot { reply } => {
                let _ = reply.send(self.replica.snapshot());
            }
            Command::Status { reply } => {
                let _ = reply.send(SessionStatus {
                    clients: self.clients.len(),
                    dirty: self.is_dirty(),
                    saving: self.saving.is_some(),
                    last_persisted_at: self.last_persisted_at,
                });
            }
            Command::Flush { reply } => {
                let _ = reply.send(self.flush_now().await);
            }
        }
    }

    fn leave(&mut self, id: ConnectionId) {
        if self.clients.remove(&id).is_none() {
            return;
        }
        debug!(document_id = %self.key.document_id, connection_id = %id, "participant left");

        let removed = self.awareness.remove_connection(id);
        self.relay_awareness(removed.clone(), None);
        self.publish_awareness(removed);

        if self.clients.is_empty() {
            // Draining: flush now instead of waiting for the debounce.
            self.flush_at = None;
        }
    }

    /// A delta that originated on this process: already merged into the
    /// replica, still to be relayed, published and persisted.
    fn after_local_change(&mut self, origin: Option<ConnectionId>, update: Vec<u8>) {
        self.edit_seq += 1;
        self.first_unsaved_at.get_or_insert_with(Instant::now);
        if let Some(id) = origin {
            if let Some(client) = self.clients.get(&id) {
                self.contributors.insert(id, client.user_id);
            }
        }
        self.schedule_flush();

        let frame = encode_update(update.clone());
        for client in self.clients.values().filter(|client| Some(client.id) != origin) {
            client.send(Outbound::Binary(frame.clone()));
        }
        self.publish(EnvelopeBody::Update(update));
    }

    fn schedule_flush(&mut self) {
        if !self.is_dirty() {
            return;
        }
        let config = &self.inner.config;
        let now = Instant::now();
        let mut deadline = now + config.debounce;
        if let Some(first) = self.first_unsaved_at {
            deadline = deadline.min(first + config.max_debounce);
        }
        self.flush_at = Some(deadline.max(now));
    }

    fn handle_envelope(&mut self, envelope: Envelope) {
        if envelope.origin == self.inner.process_id || envelope.key != self.key {
            return;
        }

        match envelope.body {
            EnvelopeBody::Update(update) => {
                // Remote deltas are persisted by the process that produced them.
                if let Err(error) = self.replica.apply_update(&update) {
                    warn!(document_id = %self.key.document_id, error = %error, "dropping undecodable remote update");
                    return;
                }
                let frame = encode_update(update);
                for client in self.clients.values() {
                    client.send(Outbound::Binary(frame.clone()));
                }
            }
            EnvelopeBody::Awareness(payload) => match decode_awareness_payload(&payload) {
                Ok(records) => {
                    let accepted = self.awareness.apply_remote(records, Instant::now());
                    self.relay_awareness(accepted, None);
                }
                Err(error) => {
                    warn!(document_id = %self.key.document_id, error = %error, "dropping malformed remote awareness");
                }
            },
            EnvelopeBody::Error(event) => {
                let target = envelope.target_client_id.and_then(|target| self.clients.get(&target));
                if let Some(client) = target {
                    client.send(Outbound::Event(ServerEvent::Error(event)));
                }
            }
            EnvelopeBody::Event(event) => {
                self.deliver_event(&event, envelope.target_client_id);
            }
        }
    }

    fn deliver_event(&self, event: &RealtimeEvent, target: Option<ConnectionId>) -> usize {
        self.clients
            .values()
            .filter(|client| target.map_or(true, |target| target == client.id))
            .filter(|client| client.send(Outbound::Event(ServerEvent::Realtime(event.clone()))))
            .count()
    }

    fn relay_awareness(&self, records: Vec<AwarenessRecord>, except: Option<ConnectionId>) {
        if records.is_empty() {
            return;
        }
        let frame = encode_awareness(awareness_update(records));
        for client in self.clients.values().filter(|client| Some(client.id) != except) {
            client.send(Outbound::Binary(frame.clone()));
        }
    }

    fn publish_awareness(&self, records: Vec<AwarenessRecord>) {
        if !records.is_empty() {
            self.publish(EnvelopeBody::Awareness(encode_awareness(awareness_update(records))));
        }
    }

    fn publish(&self, body: EnvelopeBody) {
        self.publish_envelope(Envelope::fanout(self.key, self.inner.process_id, body));
    }

    /// Publishing never blocks merges.
    fn publish_envelope(&self, envelope: Envelope) {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            if !inner.backplane.publish(&envelope).await {
                debug!(
                    document_id = %envelope.key.document_id,
                    kind = ?envelope.kind(),
                    "backplane unavailable, delivered to local participants only"
                );
            }
        });
    }

    /// Send an error to one connection, wherever it lives.
    fn emit_error(&self, target: ConnectionId, event: ErrorEvent) {
        match self.clients.get(&target) {
            Some(client) => {
                client.send(Outbound::Event(ServerEvent::Error(event)));
            }
            None => self.publish_envelope(Envelope::targeted(
                self.key,
                self.inner.process_id,
                EnvelopeBody::Error(event),
                target,
            )),
        }
    }

    fn start_save(&mut self) {
        if self.saving.is_some() || !self.is_dirty() {
            return;
        }
        let seq = self.edit_seq;
        let snapshot = self.replica.snapshot();
        let store = self.inner.store.clone();
        let key = self.key;
        let task = tokio::spawn(async move { store.save(key, &snapshot).await });
        self.saving = Some((seq, task));
    }

    fn finish_save(&mut self, seq: u64, joined: Result<Result<(), SaveFailure>, JoinError>) {
        let result = joined.unwrap_or_else(|error| {
            Err(SaveFailure::Rejected(format!("save task did not complete: {error}")))
        });

        match result {
            Ok(()) => self.mark_saved(seq),
            Err(failure) => {
                warn!(
                    workspace_id = %self.key.workspace_id,
                    document_id = %self.key.document_id,
                    error = %failure,
                    "failed to save document"
                );
                self.report_store_failure(&failure);

                if self.clients.is_empty() {
                    self.teardown_failures += 1;
                    if self.teardown_failures >= MAX_TEARDOWN_ATTEMPTS {
                        error!(
                            workspace_id = %self.key.workspace_id,
                            document_id = %self.key.document_id,
                            attempts = self.teardown_failures,
                            "giving up flushing document, unsaved edits are lost"
                        );
                        self.abandoned = true;
                    } else {
                        self.flush_at = Some(Instant::now() + self.inner.config.debounce);
                    }
                } else if !failure.is_permanent() {
                    self.flush_at = Some(Instant::now() + self.inner.config.debounce);
                }
            }
        }
    }

    fn mark_saved(&mut self, seq: u64) {
        self.saved_seq = self.saved_seq.max(seq);
        self.last_persisted_at = Some(Utc::now());
        self.teardown_failures = 0;
        if self.is_dirty() {
            self.first_unsaved_at = Some(Instant::now());
            self.schedule_flush();
            if self.clients.is_empty() {
                self.flush_at = None;
            }
        } else {
            self.first_unsaved_at = None;
            self.contributors.clear();
        }
        debug!(document_id = %self.key.document_id, seq, "document saved");
    }

    fn report_store_failure(&mut self, failure: &SaveFailure) {
        let contributors = std::mem::take(&mut self.contributors);
        for (id, user_id) in contributors {
            self.emit_error(id, store_error_event(failure, user_id));
        }
    }

    /// Save synchronously, waiting out any save already in flight.
    async fn flush_now(&mut self) -> Result<(), SaveFailure> {
        if let Some((seq, task)) = self.saving.take() {
            let joined = task.await;
            self.finish_save(seq, joined);
        }
        if !self.is_dirty() {
            return Ok(());
        }

        let seq = self.edit_seq;
        let result = self.inner.store.save(self.key, &self.replica.snapshot()).await;
        match &result {
            Ok(()) => {
                self.flush_at = None;
                self.mark_saved(seq);
            }
            Err(failure) => self.report_store_failure(failure),
        }
        result
    }

    /// Decide what an empty session does next.
    fn update_drain_state(&mut self) {
        if !self.clients.is_empty() || self.saving.is_some() {
            self.retire_at = None;
            return;
        }
        if self.is_dirty() && !self.abandoned {
            if self.flush_at.is_none() {
                self.start_save();
            }
            self.retire_at = None;
            return;
        }
        if self.retire_at.is_none() {
            self.retire_at = Some(Instant::now() + self.inner.config.teardown_grace);
        }
    }

    /// Remove this session from the registry unless a command slipped in.
    async fn try_retire(&mut self) -> bool {
        self.retire_at = None;
        let mut slots = self.inner.slots.lock().await;
        match self.commands.try_recv() {
            Ok(command) => {
                drop(slots);
                self.handle_command(command).await;
                false
            }
            Err(_) => {
                let ours = matches!(
                    slots.get(&self.key),
                    Some(Slot::Active(handle)) if handle.generation == self.generation
                );
                if ours {
                    slots.remove(&self.key);
                }
                self.commands.close();
                true
            }
        }
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => pending().await,
    }
}

async fn join_opt<T>(task: &mut Option<(u64, JoinHandle<T>)>) -> Result<T, JoinError> {
    match task {
        Some((_, handle)) => handle.await,
        None => pending().await,
    }
}
