// In-process hub. Session registries sharing one hub behave like separate
// server processes sharing a real transport.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use quire_common::protocol::envelope::Envelope;
use tokio::sync::mpsc;
use tracing::warn;

use super::SubscriberTable;

#[derive(Debug, Default)]
struct HubInner {
    subscribers: SubscriberTable,
    offline: AtomicBool,
}

#[derive(Debug, Clone, Default)]
pub struct MemoryHub {
    inner: Arc<HubInner>,
}

impl MemoryHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate losing (or regaining) the transport.
    pub fn set_online(&self, online: bool) {
        self.inner.offline.store(!online, Ordering::SeqCst);
    }

    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.inner.subscribers.subscriber_count(channel)
    }

    pub(super) fn publish(&self, envelope: &Envelope) -> bool {
        if self.inner.offline.load(Ordering::SeqCst) {
            return false;
        }

        // Go through the wire codec so the hub behaves like a real transport.
        let decoded = match envelope.encode().map(|raw| Envelope::decode(&raw)) {
            Ok(Ok(decoded)) => decoded,
            Ok(Err(error)) | Err(error) => {
                warn!(error = %error, "failed to encode envelope for memory backplane");
                return false;
            }
        };

        self.inner.subscribers.dispatch(&envelope.key.channel_name(), &decoded);
        true
    }

    pub(super) fn subscribe(&self, channel: &str) -> (u64, mpsc::UnboundedReceiver<Envelope>) {
        let (id, receiver, _) = self.inner.subscribers.add(channel);
        (id, receiver)
    }

    pub(super) fn unsubscribe(&self, channel: &str, id: u64) {
        self.inner.subscribers.remove(channel, id);
    }
}
