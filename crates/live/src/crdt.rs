// In-memory document replica backed by yrs.

use thiserror::Error;
use yrs::updates::decoder::Decode;
use yrs::{Doc, ReadTxn, StateVector, Transact, TransactionMut, Update};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CrdtError {
    #[error("failed to decode Yjs update: {0}")]
    Decode(String),
    #[error("failed to apply Yjs update: {0}")]
    Apply(String),
}

/// Authoritative copy of one document's CRDT state.
pub struct Replica {
    doc: Doc,
}

impl Replica {
    pub fn new() -> Self {
        Self { doc: Doc::new() }
    }

    /// Rebuild a replica from a persisted full-state snapshot.
    pub fn from_snapshot(snapshot: &[u8]) -> Result<Self, CrdtError> {
        let replica = Self::new();
        if !snapshot.is_empty() {
            replica.apply_update(snapshot)?;
        }
        Ok(replica)
    }

    pub fn apply_update(&self, update: &[u8]) -> Result<(), CrdtError> {
        let decoded =
            Update::decode_v1(update).map_err(|error| CrdtError::Decode(error.to_string()))?;
        self.doc
            .transact_mut()
            .apply_update(decoded)
            .map_err(|error| CrdtError::Apply(error.to_string()))
    }

    /// Full state as a v1 update.
    pub fn snapshot(&self) -> Vec<u8> {
        self.doc.transact().encode_state_as_update_v1(&StateVector::default())
    }

    pub fn state_vector(&self) -> StateVector {
        self.doc.transact().state_vector()
    }

    /// Everything the holder of `remote` is missing.
    pub fn diff(&self, remote: &StateVector) -> Vec<u8> {
        self.doc.transact().encode_diff_v1(remote)
    }

    /// Run `f` in a write transaction and return the update it produced.
    pub fn transact<F, R>(&self, f: F) -> (R, Vec<u8>)
    where
        F: FnOnce(&mut TransactionMut) -> R,
    {
        let mut txn = self.doc.transact_mut();
        let output = f(&mut txn);
        let update = txn.encode_update_v1();
        (output, update)
    }

    pub fn doc(&self) -> &Doc {
        &self.doc
    }
}

impl Default for Replica {
    fn default() -> Self {
        Self::new()
    }
}

/// Merge two full-state snapshots into one.
pub fn merge_snapshots(stored: &[u8], incoming: &[u8]) -> Result<Vec<u8>, CrdtError> {
    let replica = Replica::from_snapshot(stored)?;
    replica.apply_update(incoming)?;
    Ok(replica.snapshot())
}
