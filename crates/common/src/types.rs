// Core identity types shared across the quire crates.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Prefix of every backplane channel name.
pub const CHANNEL_PREFIX: &str = "quire_doc_";

/// Stable identity of a collaborative document.
///
/// Sessions, backplane channels and persisted snapshots are all keyed by it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentKey {
    pub workspace_id: Uuid,
    pub document_id: Uuid,
}

impl DocumentKey {
    pub fn new(workspace_id: Uuid, document_id: Uuid) -> Self {
        Self { workspace_id, document_id }
    }

    /// Backplane channel for this document.
    ///
    /// Derived from the document id only so the name stays within the
    /// 63-byte identifier limit of Postgres `LISTEN`.
    pub fn channel_name(&self) -> String {
        format!("{CHANNEL_PREFIX}{}", self.document_id.simple())
    }
}

impl fmt::Display for DocumentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.workspace_id, self.document_id)
    }
}

/// Per-connection permissions and document status flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Entitlements {
    pub can_read: bool,
    pub can_write: bool,
    pub is_locked: bool,
    pub is_archived: bool,
}

impl Entitlements {
    pub const fn read_write() -> Self {
        Self { can_read: true, can_write: true, is_locked: false, is_archived: false }
    }

    pub const fn read_only() -> Self {
        Self { can_read: true, can_write: false, is_locked: false, is_archived: false }
    }
}
