// Per-user document entitlements.

use std::collections::HashMap;
use std::sync::Arc;

use quire_common::types::{DocumentKey, Entitlements};
use thiserror::Error;
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum EntitlementError {
    #[error("failed to query document entitlements: {0}")]
    Query(#[from] sqlx::Error),
}

#[derive(Debug, Default)]
pub struct MemoryEntitlements {
    /// Applied to users without an explicit grant.
    fallback: Entitlements,
    grants: HashMap<(DocumentKey, Uuid), Entitlements>,
    /// `(is_locked, is_archived)` overrides shared by every user.
    status: HashMap<DocumentKey, (bool, bool)>,
}

#[derive(Clone)]
pub enum EntitlementStore {
    Postgres(sqlx::PgPool),
    Memory(Arc<RwLock<MemoryEntitlements>>),
}

impl EntitlementStore {
    /// Everyone may read and write every document.
    pub fn permissive() -> Self {
        Self::with_fallback(Entitlements::read_write())
    }

    /// Nobody has access until granted.
    pub fn deny_by_default() -> Self {
        Self::with_fallback(Entitlements::default())
    }

    fn with_fallback(fallback: Entitlements) -> Self {
        Self::Memory(Arc::new(RwLock::new(MemoryEntitlements { fallback, ..Default::default() })))
    }

    pub async fn resolve(
        &self,
        key: DocumentKey,
        user_id: Uuid,
    ) -> Result<Entitlements, EntitlementError> {
        match self {
            Self::Postgres(pool) => {
                let row = sqlx::query_as::<_, (bool, bool, bool, bool)>(
                    r#"
                    SELECT
                        e.can_read,
                        e.can_write,
                        COALESCE(s.is_locked, FALSE),
                        s.archived_at IS NOT NULL
                    FROM document_entitlements AS e
                    LEFT JOIN document_snapshots AS s
                        ON s.workspace_id = e.workspace_id
                       AND s.document_id = e.document_id
                    WHERE e.workspace_id = $1
                      AND e.document_id = $2
                      AND e.user_id = $3
                    "#,
                )
                .bind(key.workspace_id)
                .bind(key.document_id)
                .bind(user_id)
                .fetch_optional(pool)
                .await?;

                Ok(row
                    .map(|(can_read, can_write, is_locked, is_archived)| Entitlements {
                        can_read,
                        can_write,
                        is_locked,
                        is_archived,
                    })
                    .unwrap_or_default())
            }
            Self::Memory(store) => {
                let store = store.read().await;
                let mut entitlements =
                    store.grants.get(&(key, user_id)).copied().unwrap_or(store.fallback);
                if let Some((is_locked, is_archived)) = store.status.get(&key) {
                    entitlements.is_locked = *is_locked;
                    entitlements.is_archived = *is_archived;
                }
                Ok(entitlements)
            }
        }
    }

    /// Record an explicit grant. No-op for the Postgres store, whose grants
    /// are owned by the API service.
    pub async fn grant(&self, key: DocumentKey, user_id: Uuid, entitlements: Entitlements) {
        if let Self::Memory(store) = self {
            store.write().await.grants.insert((key, user_id), entitlements);
        }
    }

    pub async fn set_status(&self, key: DocumentKey, is_locked: bool, is_archived: bool) {
        if let Self::Memory(store) = self {
            store.write().await.status.insert(key, (is_locked, is_archived));
        }
    }
}
