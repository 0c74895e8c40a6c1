//! Binary envelope codec for the broadcast channel.
//!
//! Wire format (bincode-encoded, standard config capped at [`MAX_FRAME_SIZE`]):
//! ```text
//! ┌──────────┬─────────────┬──────────┐
//! │ kind     │ payload len │ payload  │
//! │ 1 byte   │ varint      │ variable │
//! └──────────┴─────────────┴──────────┘
//! ```
//!
//! Kinds: 0 = doc update, 1 = awareness update, 2 = sync request,
//! 3 = sync response. Payloads are opaque here; only awareness payloads
//! have a structure this crate defines ([`AwarenessEntry`]).

use bincode::config::{Configuration, Limit, LittleEndian, Varint};
use serde::{Deserialize, Serialize};

/// Largest frame any decoder in this crate accepts.
///
/// Length prefixes are sender-controlled; bincode refuses to allocate past this.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

pub(crate) type WireConfig = Configuration<LittleEndian, Varint, Limit<MAX_FRAME_SIZE>>;

pub(crate) fn wire_config() -> WireConfig {
    bincode::config::standard().with_limit::<MAX_FRAME_SIZE>()
}

/// Envelope kinds carried on the broadcast channel.
///
/// Declaration order is the wire tag, keep it stable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum EnvelopeKind {
    /// Incremental CRDT delta
    DocUpdate = 0,
    /// Changed awareness records
    AwarenessUpdate = 1,
    /// "I just joined, send me your state" (empty payload)
    SyncRequest = 2,
    /// Full document state answering a sync request
    SyncResponse = 3,
}

/// A single message on the broadcast channel.
///
/// Constructed by the provider, consumed by remote providers, never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelEnvelope {
    pub kind: EnvelopeKind,
    pub payload: Vec<u8>,
}

impl ChannelEnvelope {
    /// Wrap an incremental delta.
    pub fn doc_update(delta: Vec<u8>) -> Self {
        Self {
            kind: EnvelopeKind::DocUpdate,
            payload: delta,
        }
    }

    /// Wrap an already-encoded awareness payload.
    pub fn awareness_update(payload: Vec<u8>) -> Self {
        Self {
            kind: EnvelopeKind::AwarenessUpdate,
            payload,
        }
    }

    pub fn sync_request() -> Self {
        Self {
            kind: EnvelopeKind::SyncRequest,
            payload: Vec::new(),
        }
    }

    /// Wrap a full document snapshot.
    pub fn sync_response(state: Vec<u8>) -> Self {
        Self {
            kind: EnvelopeKind::SyncResponse,
            payload: state,
        }
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, EncodeError> {
        bincode::serde::encode_to_vec(self, wire_config())
            .map_err(|e| EncodeError(e.to_string()))
    }

    /// Deserialize from binary wire format.
    ///
    /// Trailing bytes are rejected so that a truncated or concatenated
    /// frame never half-decodes into something plausible.
    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let (envelope, read): (Self, usize) =
            bincode::serde::decode_from_slice(bytes, wire_config())
                .map_err(|e| DecodeError::Envelope(e.to_string()))?;
        if read != bytes.len() {
            return Err(DecodeError::TrailingBytes(bytes.len() - read));
        }
        Ok(envelope)
    }

    /// Decode the awareness entries carried by an awareness envelope.
    pub fn awareness_entries(&self) -> Result<Vec<AwarenessEntry>, DecodeError> {
        if self.kind != EnvelopeKind::AwarenessUpdate {
            return Err(DecodeError::UnexpectedKind(self.kind));
        }
        decode_awareness(&self.payload)
    }
}

/// One changed awareness record as carried on the wire.
///
/// `state` is JSON text; `None` means the client is gone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AwarenessEntry {
    pub client_id: u64,
    pub clock: u64,
    pub state: Option<String>,
}

/// Encode a set of changed awareness records.
pub fn encode_awareness(entries: &[AwarenessEntry]) -> Result<Vec<u8>, EncodeError> {
    bincode::serde::encode_to_vec(entries, wire_config())
        .map_err(|e| EncodeError(e.to_string()))
}

/// Decode a set of changed awareness records.
pub fn decode_awareness(bytes: &[u8]) -> Result<Vec<AwarenessEntry>, DecodeError> {
    let (entries, _): (Vec<AwarenessEntry>, usize) =
        bincode::serde::decode_from_slice(bytes, wire_config())
            .map_err(|e| DecodeError::Awareness(e.to_string()))?;
    Ok(entries)
}

/// Client → relay frames.
///
/// The relay answers with raw envelope bytes only; it never looks inside them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RelayFrame {
    /// Join a named channel. Must be the first frame on a connection.
    Subscribe { channel: String },
    /// Fan an encoded envelope out to every other subscriber.
    Publish { payload: Vec<u8> },
}

impl RelayFrame {
    pub fn encode(&self) -> Result<Vec<u8>, EncodeError> {
        bincode::serde::encode_to_vec(self, wire_config())
            .map_err(|e| EncodeError(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let (frame, _): (Self, usize) =
            bincode::serde::decode_from_slice(bytes, wire_config())
                .map_err(|e| DecodeError::Envelope(e.to_string()))?;
        Ok(frame)
    }
}

/// Malformed envelope, awareness payload or CRDT delta.
///
/// Always fatal for the single message only: callers drop and log it.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("malformed envelope: {0}")]
    Envelope(String),
    #[error("{0} trailing bytes after envelope")]
    TrailingBytes(usize),
    #[error("unexpected envelope kind {0:?}")]
    UnexpectedKind(EnvelopeKind),
    #[error("malformed awareness payload: {0}")]
    Awareness(String),
    #[error("invalid awareness state for client {client_id}: {reason}")]
    AwarenessState { client_id: u64, reason: String },
    #[error("malformed document update: {0}")]
    Update(String),
}

/// Serialization failed (should not happen for well-formed values).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("serialization error: {0}")]
pub struct EncodeError(pub String);
