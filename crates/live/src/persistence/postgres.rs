// Snapshot store backed by the `document_snapshots` table.

use chrono::{DateTime, Utc};
use quire_common::protocol::sync::EMPTY_UPDATE;
use quire_common::types::DocumentKey;
use sqlx::PgPool;

use super::{LoadError, SaveFailure};
use crate::crdt::merge_snapshots;
use crate::db::pool::check_pool_health;

#[derive(Debug, Clone)]
pub struct PostgresStore {
    pool: PgPool,
    max_document_bytes: usize,
}

impl PostgresStore {
    pub fn new(pool: PgPool, max_document_bytes: usize) -> Self {
        Self { pool, max_document_bytes }
    }

    pub(super) async fn fetch(&self, key: DocumentKey) -> Result<Option<Vec<u8>>, LoadError> {
        sqlx::query_scalar::<_, Vec<u8>>(
            "SELECT state FROM document_snapshots WHERE workspace_id = $1 AND document_id = $2",
        )
        .bind(key.workspace_id)
        .bind(key.document_id)
        .fetch_optional(&self.pool)
        .await
        .map(|state| state.filter(|bytes| !bytes.is_empty()))
        .map_err(|error| LoadError::Unavailable(error.to_string()))
    }

    /// Merge `snapshot` into the stored state under a row lock.
    pub(super) async fn store(&self, key: DocumentKey, snapshot: &[u8]) -> Result<(), SaveFailure> {
        let mut tx = self.pool.begin().await.map_err(classify)?;

        // Make sure a row exists so concurrent first saves serialize on it.
        sqlx::query(
            r#"
            INSERT INTO document_snapshots (workspace_id, document_id, state)
            VALUES ($1, $2, $3)
            ON CONFLICT (workspace_id, document_id) DO NOTHING
            "#,
        )
        .bind(key.workspace_id)
        .bind(key.document_id)
        .bind(EMPTY_UPDATE.as_slice())
        .execute(&mut *tx)
        .await
        .map_err(classify)?;

        let (stored, is_locked, archived_at) =
            sqlx::query_as::<_, (Vec<u8>, bool, Option<DateTime<Utc>>)>(
                r#"
                SELECT state, is_locked, archived_at
                FROM document_snapshots
                WHERE workspace_id = $1 AND document_id = $2
                FOR UPDATE
                "#,
            )
            .bind(key.workspace_id)
            .bind(key.document_id)
            .fetch_one(&mut *tx)
            .await
            .map_err(classify)?;

        if is_locked {
            return Err(SaveFailure::Locked);
        }
        if archived_at.is_some() {
            return Err(SaveFailure::Archived);
        }

        let merged = merge_snapshots(&stored, snapshot)?;
        if merged.len() > self.max_document_bytes {
            return Err(SaveFailure::ContentTooLarge {
                size: merged.len(),
                limit: self.max_document_bytes,
            });
        }

        sqlx::query(
            r#"
            UPDATE document_snapshots
            SET state = $3, updated_at = now()
            WHERE workspace_id = $1 AND document_id = $2
            "#,
        )
        .bind(key.workspace_id)
        .bind(key.document_id)
        .bind(merged)
        .execute(&mut *tx)
        .await
        .map_err(classify)?;

        tx.commit().await.map_err(classify)
    }

    pub(super) async fn is_ready(&self) -> bool {
        check_pool_health(&self.pool).await.is_ok()
    }
}

/// Connection-level problems are worth an immediate retry; anything the
/// database itself answered is a rejection.
fn classify(error: sqlx::Error) -> SaveFailure {
    match error {
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => SaveFailure::Transient(error.to_string()),
        sqlx::Error::Database(db_error) => SaveFailure::Rejected(db_error.message().to_string()),
        other => SaveFailure::Rejected(other.to_string()),
    }
}
