// y-sync / y-awareness framing helpers.
//
// Thin layer over `yrs::sync` so the server and test clients agree on how
// binary WebSocket frames are split into protocol messages.

use thiserror::Error;
use yrs::encoding::read::Cursor;
use yrs::sync::awareness::{AwarenessUpdate, AwarenessUpdateEntry};
use yrs::sync::{Message, MessageReader, SyncMessage};
use yrs::updates::decoder::DecoderV1;
use yrs::updates::encoder::Encode;
use yrs::StateVector;

/// A Yjs v1 update with no structs and an empty delete set.
pub const EMPTY_UPDATE: [u8; 2] = [0, 0];

/// Awareness state value meaning "this client is gone".
pub const REMOVED_STATE: &str = "null";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("binary frame is empty")]
    Empty,
    #[error("failed to decode y-sync message: {0}")]
    Decode(String),
}

/// Returns true when an update carries no changes.
pub fn is_empty_update(update: &[u8]) -> bool {
    update.is_empty() || update == EMPTY_UPDATE
}

/// Split one binary frame into its protocol messages.
pub fn decode_frame(frame: &[u8]) -> Result<Vec<Message>, FrameError> {
    if frame.is_empty() {
        return Err(FrameError::Empty);
    }

    let mut decoder = DecoderV1::new(Cursor::new(frame));
    let mut reader = MessageReader::new(&mut decoder);
    let mut messages = Vec::new();
    while let Some(next) = reader.next() {
        messages.push(next.map_err(|error| FrameError::Decode(error.to_string()))?);
    }

    if messages.is_empty() {
        return Err(FrameError::Decode("frame contained no messages".to_string()));
    }
    Ok(messages)
}

pub fn encode_sync_step1(state_vector: StateVector) -> Vec<u8> {
    Message::Sync(SyncMessage::SyncStep1(state_vector)).encode_v1()
}

pub fn encode_sync_step2(update: Vec<u8>) -> Vec<u8> {
    Message::Sync(SyncMessage::SyncStep2(update)).encode_v1()
}

pub fn encode_update(update: Vec<u8>) -> Vec<u8> {
    Message::Sync(SyncMessage::Update(update)).encode_v1()
}

pub fn encode_awareness(update: AwarenessUpdate) -> Vec<u8> {
    Message::Awareness(update).encode_v1()
}

/// One client's presence as carried by an awareness update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AwarenessRecord {
    pub client_id: u64,
    pub clock: u32,
    pub state: String,
}

impl AwarenessRecord {
    pub fn is_removed(&self) -> bool {
        self.state == REMOVED_STATE
    }

    pub fn removal(client_id: u64, clock: u32) -> Self {
        Self { client_id, clock, state: REMOVED_STATE.to_string() }
    }
}

/// Flatten an awareness update into records, ordered by client id.
pub fn awareness_records(update: &AwarenessUpdate) -> Vec<AwarenessRecord> {
    let mut records = update
        .clients
        .iter()
        .map(|(client_id, entry)| AwarenessRecord {
            client_id: *client_id,
            clock: entry.clock,
            state: entry.json.to_string(),
        })
        .collect::<Vec<_>>();
    records.sort_by_key(|record| record.client_id);
    records
}

pub fn awareness_update<I>(records: I) -> AwarenessUpdate
where
    I: IntoIterator<Item = AwarenessRecord>,
{
    let clients = records
        .into_iter()
        .map(|record| {
            (record.client_id, AwarenessUpdateEntry { clock: record.clock, json: record.state.into() })
        })
        .collect();
    AwarenessUpdate { clients }
}

/// Decode the awareness payload that the backplane carries as raw bytes.
pub fn decode_awareness_payload(payload: &[u8]) -> Result<Vec<AwarenessRecord>, FrameError> {
    let mut records = Vec::new();
    for message in decode_frame(payload)? {
        if let Message::Awareness(update) = message {
            records.extend(awareness_records(&update));
        }
    }
    Ok(records)
}
