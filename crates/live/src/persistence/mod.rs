//! Durable document snapshots.
//!
//! A session calls [`DocumentStore::load`] once when it is created and
//! [`DocumentStore::save`] whenever its debounce timer fires or it drains.
//! Save failures are classified so the guard layer can turn them into
//! client-facing error events.

pub mod memory;
pub mod postgres;

use quire_common::protocol::events::ErrorCode;
use quire_common::types::DocumentKey;
use thiserror::Error;
use tracing::warn;

pub use memory::MemoryStore;
pub use postgres::PostgresStore;

use crate::crdt::{CrdtError, Replica};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LoadError {
    #[error("document store is unavailable: {0}")]
    Unavailable(String),
    #[error("stored snapshot is corrupt: {0}")]
    Corrupt(String),
}

impl From<CrdtError> for LoadError {
    fn from(error: CrdtError) -> Self {
        Self::Corrupt(error.to_string())
    }
}

/// Why a snapshot was not persisted.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SaveFailure {
    #[error("document is {size} bytes which exceeds the {limit} byte limit")]
    ContentTooLarge { size: usize, limit: usize },
    #[error("document is locked")]
    Locked,
    #[error("document is archived")]
    Archived,
    #[error("document store rejected the snapshot: {0}")]
    Rejected(String),
    #[error("document store is unavailable: {0}")]
    Transient(String),
}

impl SaveFailure {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    /// Failures that will recur until the content or document status changes.
    pub fn is_permanent(&self) -> bool {
        matches!(self, Self::ContentTooLarge { .. } | Self::Locked | Self::Archived)
    }

    pub fn error_code(&self) -> Option<ErrorCode> {
        match self {
            Self::ContentTooLarge { .. } => Some(ErrorCode::ContentTooLarge),
            Self::Locked => Some(ErrorCode::PageLocked),
            Self::Archived => Some(ErrorCode::PageArchived),
            Self::Rejected(_) | Self::Transient(_) => None,
        }
    }
}

impl From<CrdtError> for SaveFailure {
    fn from(error: CrdtError) -> Self {
        Self::Rejected(error.to_string())
    }
}

#[derive(Clone)]
pub enum DocumentStore {
    Postgres(PostgresStore),
    Memory(MemoryStore),
}

impl DocumentStore {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Postgres(_) => "postgres",
            Self::Memory(_) => "memory",
        }
    }

    /// Load a document, returning an empty replica when nothing is stored.
    pub async fn load(&self, key: DocumentKey) -> Result<Replica, LoadError> {
        let stored = match self {
            Self::Postgres(store) => store.fetch(key).await?,
            Self::Memory(store) => store.fetch(key).await?,
        };

        match stored {
            Some(snapshot) => Ok(Replica::from_snapshot(&snapshot)?),
            None => Ok(Replica::new()),
        }
    }

    /// Persist a full-state snapshot, retrying once on a transient failure.
    pub async fn save(&self, key: DocumentKey, snapshot: &[u8]) -> Result<(), SaveFailure> {
        match self.save_once(key, snapshot).await {
            Err(failure) if failure.is_transient() => {
                warn!(
                    workspace_id = %key.workspace_id,
                    document_id = %key.document_id,
                    error = %failure,
                    "transient save failure, retrying once"
                );
                self.save_once(key, snapshot).await
            }
            outcome => outcome,
        }
    }

    async fn save_once(&self, key: DocumentKey, snapshot: &[u8]) -> Result<(), SaveFailure> {
        match self {
            Self::Postgres(store) => store.store(key, snapshot).await,
            Self::Memory(store) => store.store(key, snapshot).await,
        }
    }

    pub async fn is_ready(&self) -> bool {
        match self {
            Self::Postgres(store) => store.is_ready().await,
            Self::Memory(_) => true,
        }
    }
}
