// Broadcast envelope exchanged between live-server processes.
//
// The wire form is a flat JSON object:
// `{workspaceId, documentId, origin, kind, payload, targetClientId?}` where
// `payload` is base64 for binary kinds (`update`, `awareness`) and a JSON
// string for structured kinds (`error`, `event`).

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::protocol::events::{ErrorEvent, RealtimeEvent};
use crate::types::DocumentKey;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvelopeKind {
    Update,
    Awareness,
    Error,
    Event,
}

#[derive(Debug, Clone, PartialEq)]
pub enum EnvelopeBody {
    /// Yjs v1 update bytes.
    Update(Vec<u8>),
    /// Encoded y-awareness message.
    Awareness(Vec<u8>),
    Error(ErrorEvent),
    Event(RealtimeEvent),
}

impl EnvelopeBody {
    pub fn kind(&self) -> EnvelopeKind {
        match self {
            Self::Update(_) => EnvelopeKind::Update,
            Self::Awareness(_) => EnvelopeKind::Awareness,
            Self::Error(_) => EnvelopeKind::Error,
            Self::Event(_) => EnvelopeKind::Event,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub key: DocumentKey,
    /// Process that published the envelope.
    pub origin: Uuid,
    pub body: EnvelopeBody,
    /// When set, only this connection receives the envelope.
    pub target_client_id: Option<Uuid>,
}

#[derive(Debug, Error)]
pub enum EnvelopeCodecError {
    #[error("malformed envelope json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("envelope payload is not valid base64: {0}")]
    Base64(#[from] base64::DecodeError),
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EnvelopeWire {
    workspace_id: Uuid,
    document_id: Uuid,
    origin: Uuid,
    kind: EnvelopeKind,
    payload: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    target_client_id: Option<Uuid>,
}

impl Envelope {
    pub fn fanout(key: DocumentKey, origin: Uuid, body: EnvelopeBody) -> Self {
        Self { key, origin, body, target_client_id: None }
    }

    pub fn targeted(key: DocumentKey, origin: Uuid, body: EnvelopeBody, target: Uuid) -> Self {
        Self { key, origin, body, target_client_id: Some(target) }
    }

    pub fn kind(&self) -> EnvelopeKind {
        self.body.kind()
    }

    pub fn encode(&self) -> Result<String, EnvelopeCodecError> {
        let payload = match &self.body {
            EnvelopeBody::Update(bytes) | EnvelopeBody::Awareness(bytes) => STANDARD.encode(bytes),
            EnvelopeBody::Error(event) => serde_json::to_string(event)?,
            EnvelopeBody::Event(event) => serde_json::to_string(event)?,
        };

        let wire = EnvelopeWire {
            workspace_id: self.key.workspace_id,
            document_id: self.key.document_id,
            origin: self.origin,
            kind: self.kind(),
            payload,
            target_client_id: self.target_client_id,
        };
        Ok(serde_json::to_string(&wire)?)
    }

    pub fn decode(raw: &str) -> Result<Self, EnvelopeCodecError> {
        let wire: EnvelopeWire = serde_json::from_str(raw)?;
        let body = match wire.kind {
            EnvelopeKind::Update => EnvelopeBody::Update(STANDARD.decode(&wire.payload)?),
            EnvelopeKind::Awareness => EnvelopeBody::Awareness(STANDARD.decode(&wire.payload)?),
            EnvelopeKind::Error => EnvelopeBody::Error(serde_json::from_str(&wire.payload)?),
            EnvelopeKind::Event => EnvelopeBody::Event(serde_json::from_str(&wire.payload)?),
        };

        Ok(Self {
            key: DocumentKey::new(wire.workspace_id, wire.document_id),
            origin: wire.origin,
            body,
            target_client_id: wire.target_client_id,
        })
    }
}
