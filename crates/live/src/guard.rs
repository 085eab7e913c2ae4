//! Connection authorization, write admission and the error-event policy.
//!
//! Every `ErrorEvent` the server emits is built here so the
//! `shouldDisconnect` decision lives in one place:
//!
//! | errorType | errorCode | source | shouldDisconnect |
//! |---|---|---|---|
//! | fetch | - | load failed | true |
//! | store | - | store rejected or unavailable | false |
//! | store | content_too_large | persisted snapshot too large | false |
//! | store | page_locked / page_archived | store or guard refused a write | false |
//! | store | content_too_large | oversized handshake `SyncStep2` | true |
//! | store | content_too_large | oversized incremental `Update` | false |
//! | store | content_too_large | frame over the transport limit | true |

use quire_common::protocol::events::{ErrorCode, ErrorEvent, ErrorType, RealtimeEvent};
use quire_common::protocol::sync::is_empty_update;
use quire_common::types::{DocumentKey, Entitlements};
use tracing::{error, warn};
use uuid::Uuid;

use crate::auth::entitlements::EntitlementStore;
use crate::auth::jwt::TokenService;
use crate::error::{ErrorCode as HttpErrorCode, LiveError};
use crate::persistence::{LoadError, SaveFailure};

/// A caller allowed to open the document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Admission {
    pub user_id: Uuid,
    pub entitlements: Entitlements,
}

/// Runs before the WebSocket upgrade.
pub async fn authorize(
    tokens: &TokenService,
    entitlements: &EntitlementStore,
    key: DocumentKey,
    token: Option<&str>,
) -> Result<Admission, LiveError> {
    let Some(token) = token else {
        return Err(LiveError::new(HttpErrorCode::AuthInvalidToken, "missing access token"));
    };

    let identity = tokens.verify(token).map_err(|error| {
        warn!(error = %error, document_id = %key.document_id, "rejected collaboration token");
        LiveError::new(HttpErrorCode::AuthInvalidToken, "invalid access token")
    })?;

    if identity.workspace_id != key.workspace_id {
        return Err(LiveError::new(HttpErrorCode::AuthForbidden, "workspace mismatch"));
    }

    let resolved = entitlements.resolve(key, identity.user_id).await.map_err(|err| {
        error!(
            error = %err,
            user_id = %identity.user_id,
            workspace_id = %key.workspace_id,
            document_id = %key.document_id,
            "failed to resolve document entitlements"
        );
        LiveError::new(HttpErrorCode::StoreUnavailable, "could not resolve document access")
    })?;

    if !resolved.can_read {
        return Err(LiveError::new(HttpErrorCode::AuthForbidden, "caller cannot read document"));
    }

    Ok(Admission { user_id: identity.user_id, entitlements: resolved })
}

/// Where an incoming update came from in the sync protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteKind {
    /// `SyncStep2` sent by the client during the handshake.
    Handshake,
    /// `Update` sent after the handshake.
    Incremental,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteVerdict {
    /// Merge it.
    Apply,
    /// Carries no changes.
    Skip,
    /// The connection may not write; drop without telling the client.
    ReadOnly,
    Reject(Rejection),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    pub code: ErrorCode,
    pub message: String,
    pub should_disconnect: bool,
}

impl Rejection {
    pub fn to_event(&self, user_id: Uuid) -> ErrorEvent {
        ErrorEvent::new(
            ErrorType::Store,
            Some(self.code),
            self.message.clone(),
            self.should_disconnect,
            user_id,
        )
    }
}

/// Decide whether an update from a connection may enter the document.
pub fn check_write(
    entitlements: &Entitlements,
    update: &[u8],
    max_update_bytes: usize,
    kind: WriteKind,
) -> WriteVerdict {
    if is_empty_update(update) {
        return WriteVerdict::Skip;
    }
    if !entitlements.can_write {
        return WriteVerdict::ReadOnly;
    }
    if entitlements.is_archived {
        return WriteVerdict::Reject(Rejection {
            code: ErrorCode::PageArchived,
            message: "page is archived and cannot be edited".to_string(),
            should_disconnect: false,
        });
    }
    if entitlements.is_locked {
        return WriteVerdict::Reject(Rejection {
            code: ErrorCode::PageLocked,
            message: "page is locked and cannot be edited".to_string(),
            should_disconnect: false,
        });
    }
    if update.len() > max_update_bytes {
        return WriteVerdict::Reject(Rejection {
            code: ErrorCode::ContentTooLarge,
            message: format!(
                "update is {} bytes which exceeds the {max_update_bytes} byte limit",
                update.len()
            ),
            should_disconnect: kind == WriteKind::Handshake,
        });
    }
    WriteVerdict::Apply
}

/// A frame the transport refused to read. The rest of the frame is still
/// on the wire, so the connection cannot continue.
pub fn oversized_frame_rejection(max_update_bytes: usize) -> Rejection {
    Rejection {
        code: ErrorCode::ContentTooLarge,
        message: format!("frame exceeds the {max_update_bytes} byte update limit"),
        should_disconnect: true,
    }
}

pub fn fetch_error_event(failure: &LoadError, user_id: Uuid) -> ErrorEvent {
    ErrorEvent::new(
        ErrorType::Fetch,
        None,
        format!("failed to load document: {failure}"),
        true,
        user_id,
    )
}

pub fn store_error_event(failure: &SaveFailure, user_id: Uuid) -> ErrorEvent {
    ErrorEvent::new(ErrorType::Store, failure.error_code(), failure.to_string(), false, user_id)
}

/// Fold a page lifecycle event into a connection's cached status flags.
/// Events about other pages (a parent hearing of its sub-page) leave them
/// alone. Returns true when the flags changed.
pub fn apply_status_event(
    entitlements: &mut Entitlements,
    document_id: Uuid,
    event: &RealtimeEvent,
) -> bool {
    if !event.page_ids.contains(&document_id) {
        return false;
    }
    let before = *entitlements;
    match event.action.as_str() {
        "locked" | "lock" => entitlements.is_locked = true,
        "unlocked" | "unlock" => entitlements.is_locked = false,
        "archived" | "archive" => entitlements.is_archived = true,
        "unarchived" | "unarchive" => entitlements.is_archived = false,
        _ => {}
    }
    before != *entitlements
}
