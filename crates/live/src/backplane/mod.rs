//! Cross-process fan-out of document envelopes.
//!
//! Every process subscribes to a document's channel while it holds a session
//! for that document. Delivery is best effort: `publish` returning `false`
//! means "no transport right now" and callers carry on with local relay only.

pub mod memory;
pub mod postgres;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use quire_common::protocol::envelope::Envelope;
use quire_common::types::DocumentKey;
use tokio::sync::mpsc;

pub use memory::MemoryHub;
pub use postgres::PgBackplane;

use crate::config::BackplaneKind;

#[derive(Clone, Default)]
pub enum Backplane {
    /// Single-process mode.
    #[default]
    Disabled,
    Memory(MemoryHub),
    Postgres(PgBackplane),
}

impl Backplane {
    pub fn kind(&self) -> BackplaneKind {
        match self {
            Self::Disabled => BackplaneKind::None,
            Self::Memory(_) => BackplaneKind::Memory,
            Self::Postgres(_) => BackplaneKind::Postgres,
        }
    }

    /// Returns `false` when no transport is currently available.
    pub async fn publish(&self, envelope: &Envelope) -> bool {
        match self {
            Self::Disabled => false,
            Self::Memory(hub) => hub.publish(envelope),
            Self::Postgres(backplane) => backplane.publish(envelope).await,
        }
    }

    pub fn subscribe(&self, key: DocumentKey) -> Subscription {
        let channel = key.channel_name();
        match self {
            Self::Disabled => {
                let (keepalive, receiver) = mpsc::unbounded_channel();
                Subscription { receiver, release: Release::Idle { _keepalive: keepalive } }
            }
            Self::Memory(hub) => {
                let (id, receiver) = hub.subscribe(&channel);
                Subscription { receiver, release: Release::Memory { hub: hub.clone(), channel, id } }
            }
            Self::Postgres(backplane) => {
                let (id, receiver) = backplane.subscribe(&channel);
                Subscription {
                    receiver,
                    release: Release::Postgres { backplane: backplane.clone(), channel, id },
                }
            }
        }
    }
}

/// Envelopes arriving on one document channel. Dropping it unsubscribes.
pub struct Subscription {
    receiver: mpsc::UnboundedReceiver<Envelope>,
    release: Release,
}

enum Release {
    Idle { _keepalive: mpsc::UnboundedSender<Envelope> },
    Memory { hub: MemoryHub, channel: String, id: u64 },
    Postgres { backplane: PgBackplane, channel: String, id: u64 },
}

impl Subscription {
    pub async fn recv(&mut self) -> Option<Envelope> {
        self.receiver.recv().await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        match &self.release {
            Release::Idle { .. } => {}
            Release::Memory { hub, channel, id } => hub.unsubscribe(channel, *id),
            Release::Postgres { backplane, channel, id } => backplane.unsubscribe(channel, *id),
        }
    }
}

/// Channel name → local subscribers.
#[derive(Debug, Default)]
pub(crate) struct SubscriberTable {
    channels: Mutex<HashMap<String, HashMap<u64, mpsc::UnboundedSender<Envelope>>>>,
    next_id: AtomicU64,
}

impl SubscriberTable {
    fn lock(&self) -> MutexGuard<'_, HashMap<String, HashMap<u64, mpsc::UnboundedSender<Envelope>>>> {
        self.channels.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns the subscriber id, its receiver and whether the channel is new.
    pub(crate) fn add(&self, channel: &str) -> (u64, mpsc::UnboundedReceiver<Envelope>, bool) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = mpsc::unbounded_channel();
        let mut channels = self.lock();
        let subscribers = channels.entry(channel.to_owned()).or_default();
        let first = subscribers.is_empty();
        subscribers.insert(id, sender);
        (id, receiver, first)
    }

    /// Returns true when the channel has no subscribers left.
    pub(crate) fn remove(&self, channel: &str, id: u64) -> bool {
        let mut channels = self.lock();
        let Some(subscribers) = channels.get_mut(channel) else {
            return false;
        };
        subscribers.remove(&id);
        if subscribers.is_empty() {
            channels.remove(channel);
            true
        } else {
            false
        }
    }

    pub(crate) fn dispatch(&self, channel: &str, envelope: &Envelope) -> usize {
        let channels = self.lock();
        channels
            .get(channel)
            .map(|subscribers| {
                subscribers.values().filter(|sender| sender.send(envelope.clone()).is_ok()).count()
            })
            .unwrap_or(0)
    }

    pub(crate) fn channels(&self) -> Vec<String> {
        self.lock().keys().cloned().collect()
    }

    pub(crate) fn subscriber_count(&self, channel: &str) -> usize {
        self.lock().get(channel).map(HashMap::len).unwrap_or(0)
    }
}
