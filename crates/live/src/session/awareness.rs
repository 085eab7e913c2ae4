// Presence records held by a document session.

use std::collections::HashMap;
use std::time::Duration;

use quire_common::protocol::sync::AwarenessRecord;
use tokio::time::Instant;

use super::ConnectionId;

/// Remote records not refreshed within this window are dropped.
pub(crate) const REMOTE_AWARENESS_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Owner {
    Local(ConnectionId),
    Remote { refreshed_at: Instant },
}

#[derive(Debug, Clone)]
struct Entry {
    clock: u32,
    state: String,
    owner: Owner,
}

impl Entry {
    fn is_removed(&self) -> bool {
        self.state == quire_common::protocol::sync::REMOVED_STATE
    }

    fn record(&self, client_id: u64) -> AwarenessRecord {
        AwarenessRecord { client_id, clock: self.clock, state: self.state.clone() }
    }
}

/// Clock-ordered presence per Yjs client id. Removed clients keep a
/// tombstone so late updates with an older clock cannot resurrect them.
#[derive(Debug, Default)]
pub(crate) struct AwarenessTable {
    entries: HashMap<u64, Entry>,
}

impl AwarenessTable {
    fn accepts(&self, record: &AwarenessRecord) -> bool {
        match self.entries.get(&record.client_id) {
            None => !record.is_removed(),
            Some(current) => {
                record.clock > current.clock
                    || (record.clock == current.clock && record.is_removed() && !current.is_removed())
            }
        }
    }

    fn apply(&mut self, records: Vec<AwarenessRecord>, owner: Owner) -> Vec<AwarenessRecord> {
        let mut accepted = Vec::new();
        for record in records {
            if !self.accepts(&record) {
                continue;
            }
            self.entries.insert(
                record.client_id,
                Entry { clock: record.clock, state: record.state.clone(), owner },
            );
            accepted.push(record);
        }
        accepted
    }

    /// Records sent by a local connection. Returns the ones that changed state.
    /// A client id held live by another local connection stays with it.
    pub(crate) fn apply_local(
        &mut self,
        connection: ConnectionId,
        records: Vec<AwarenessRecord>,
    ) -> Vec<AwarenessRecord> {
        let records = records
            .into_iter()
            .filter(|record| !self.held_by_other(record.client_id, connection))
            .collect();
        self.apply(records, Owner::Local(connection))
    }

    fn held_by_other(&self, client_id: u64, connection: ConnectionId) -> bool {
        self.entries.get(&client_id).is_some_and(|entry| {
            !entry.is_removed()
                && matches!(entry.owner, Owner::Local(owner) if owner != connection)
        })
    }

    pub(crate) fn apply_remote(
        &mut self,
        records: Vec<AwarenessRecord>,
        now: Instant,
    ) -> Vec<AwarenessRecord> {
        self.apply(records, Owner::Remote { refreshed_at: now })
    }

    /// Tombstone every live record owned by `connection`.
    pub(crate) fn remove_connection(&mut self, connection: ConnectionId) -> Vec<AwarenessRecord> {
        self.tombstone(|owner| owner == Owner::Local(connection))
    }

    /// Tombstone remote records that went quiet.
    pub(crate) fn expire_remote(&mut self, now: Instant) -> Vec<AwarenessRecord> {
        self.tombstone(|owner| match owner {
            Owner::Remote { refreshed_at } => {
                now.saturating_duration_since(refreshed_at) >= REMOTE_AWARENESS_TIMEOUT
            }
            Owner::Local(_) => false,
        })
    }

    fn tombstone(&mut self, mut matches: impl FnMut(Owner) -> bool) -> Vec<AwarenessRecord> {
        let mut removed = self
            .entries
            .iter_mut()
            .filter(|(_, entry)| !entry.is_removed() && matches(entry.owner))
            .map(|(client_id, entry)| {
                let removal = AwarenessRecord::removal(*client_id, entry.clock.wrapping_add(1));
                entry.clock = removal.clock;
                entry.state = removal.state.clone();
                removal
            })
            .collect::<Vec<_>>();
        removed.sort_by_key(|record| record.client_id);
        removed
    }

    /// Every live record, for clients that just synced.
    pub(crate) fn states(&self) -> Vec<AwarenessRecord> {
        let mut states = self
            .entries
            .iter()
            .filter(|(_, entry)| !entry.is_removed())
            .map(|(client_id, entry)| entry.record(*client_id))
            .collect::<Vec<_>>();
        states.sort_by_key(|record| record.client_id);
        states
    }
}
