// Process-local snapshot store for development and tests.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use quire_common::types::DocumentKey;
use tokio::sync::Mutex;

use super::{LoadError, SaveFailure};
use crate::crdt::merge_snapshots;

#[derive(Debug, Default)]
struct MemoryRecord {
    snapshot: Vec<u8>,
    is_locked: bool,
    is_archived: bool,
}

#[derive(Debug, Default)]
struct MemoryState {
    records: HashMap<DocumentKey, MemoryRecord>,
    max_document_bytes: Option<usize>,
    load_delay: Duration,
    load_failures: VecDeque<LoadError>,
    save_failures: VecDeque<SaveFailure>,
}

#[derive(Debug, Default)]
struct MemoryInner {
    state: Mutex<MemoryState>,
    load_calls: AtomicUsize,
    save_attempts: AtomicUsize,
    saves: AtomicUsize,
}

#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<MemoryInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limit(max_document_bytes: usize) -> Self {
        let state = MemoryState { max_document_bytes: Some(max_document_bytes), ..Default::default() };
        Self { inner: Arc::new(MemoryInner { state: Mutex::new(state), ..Default::default() }) }
    }

    pub(super) async fn fetch(&self, key: DocumentKey) -> Result<Option<Vec<u8>>, LoadError> {
        self.inner.load_calls.fetch_add(1, Ordering::SeqCst);

        let delay = self.inner.state.lock().await.load_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.inner.state.lock().await;
        if let Some(failure) = state.load_failures.pop_front() {
            return Err(failure);
        }
        Ok(state
            .records
            .get(&key)
            .map(|record| record.snapshot.clone())
            .filter(|snapshot| !snapshot.is_empty()))
    }

    pub(super) async fn store(&self, key: DocumentKey, snapshot: &[u8]) -> Result<(), SaveFailure> {
        self.inner.save_attempts.fetch_add(1, Ordering::SeqCst);

        let mut state = self.inner.state.lock().await;
        if let Some(failure) = state.save_failures.pop_front() {
            return Err(failure);
        }

        let limit = state.max_document_bytes;
        let record = state.records.entry(key).or_default();
        if record.is_locked {
            return Err(SaveFailure::Locked);
        }
        if record.is_archived {
            return Err(SaveFailure::Archived);
        }

        let merged = if record.snapshot.is_empty() {
            snapshot.to_vec()
        } else {
            merge_snapshots(&record.snapshot, snapshot)?
        };
        if let Some(limit) = limit {
            if merged.len() > limit {
                return Err(SaveFailure::ContentTooLarge { size: merged.len(), limit });
            }
        }

        record.snapshot = merged;
        self.inner.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    /// Seed a stored snapshot.
    pub async fn insert(&self, key: DocumentKey, snapshot: Vec<u8>) {
        self.inner.state.lock().await.records.entry(key).or_default().snapshot = snapshot;
    }

    pub async fn snapshot(&self, key: DocumentKey) -> Option<Vec<u8>> {
        self.inner.state.lock().await.records.get(&key).map(|record| record.snapshot.clone())
    }

    pub async fn set_locked(&self, key: DocumentKey, is_locked: bool) {
        self.inner.state.lock().await.records.entry(key).or_default().is_locked = is_locked;
    }

    pub async fn set_archived(&self, key: DocumentKey, is_archived: bool) {
        self.inner.state.lock().await.records.entry(key).or_default().is_archived = is_archived;
    }

    pub async fn set_load_delay(&self, delay: Duration) {
        self.inner.state.lock().await.load_delay = delay;
    }

    pub async fn fail_next_loads(&self, failures: impl IntoIterator<Item = LoadError>) {
        self.inner.state.lock().await.load_failures.extend(failures);
    }

    pub async fn fail_next_saves(&self, failures: impl IntoIterator<Item = SaveFailure>) {
        self.inner.state.lock().await.save_failures.extend(failures);
    }

    pub fn load_calls(&self) -> usize {
        self.inner.load_calls.load(Ordering::SeqCst)
    }

    pub fn save_attempts(&self) -> usize {
        self.inner.save_attempts.load(Ordering::SeqCst)
    }

    /// Successful saves.
    pub fn saves(&self) -> usize {
        self.inner.saves.load(Ordering::SeqCst)
    }
}
