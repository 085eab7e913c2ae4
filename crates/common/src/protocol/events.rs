// Text-frame events the server pushes to collaboration clients.
//
// Binary frames carry y-sync traffic; everything structured (errors, page
// lifecycle notifications) travels as JSON text frames wrapped in
// `ServerEvent`.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Which side of the document lifecycle failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorType {
    /// The initial state could not be loaded.
    Fetch,
    /// A write could not be persisted or was refused.
    Store,
}

/// Machine-readable reason attached to an [`ErrorEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    ContentTooLarge,
    PageLocked,
    PageArchived,
}

impl ErrorCode {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ContentTooLarge => "content_too_large",
            Self::PageLocked => "page_locked",
            Self::PageArchived => "page_archived",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "content_too_large" => Some(Self::ContentTooLarge),
            "page_locked" => Some(Self::PageLocked),
            "page_archived" => Some(Self::PageArchived),
            _ => None,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured, client-scoped failure notice.
///
/// Field names are part of the client contract and must not change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorEvent {
    pub error_message: String,
    pub error_type: ErrorType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<ErrorCode>,
    #[serde(default)]
    pub should_disconnect: bool,
    pub user_id: Uuid,
}

impl ErrorEvent {
    pub fn new(
        error_type: ErrorType,
        error_code: Option<ErrorCode>,
        message: impl Into<String>,
        should_disconnect: bool,
        user_id: Uuid,
    ) -> Self {
        Self { error_message: message.into(), error_type, error_code, should_disconnect, user_id }
    }
}

/// Page lifecycle notification relayed from the REST API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeEvent {
    pub action: String,
    pub page_ids: Vec<Uuid>,
    #[serde(default)]
    pub data: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<Uuid>,
}

/// Every JSON text frame sent from server to client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ServerEvent {
    Error(ErrorEvent),
    Realtime(RealtimeEvent),
}

impl ServerEvent {
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn decode(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }
}
