//! Broadcast transport: fire-and-forget publish, inbound envelope stream.
//!
//! Delivery is best effort and unordered. A transport never hands a client
//! its own envelopes back.

mod local;
mod ws;

pub use local::{ChannelHub, LocalTransport};
pub use ws::WsTransport;

use tokio::sync::mpsc;

use crate::protocol::{ChannelEnvelope, EncodeError};

/// Channel name for a document, e.g. `yjs:board-42`.
pub fn channel_name(prefix: &str, document_id: &str) -> String {
    format!("{prefix}{document_id}")
}

/// Publish/subscribe access to one named channel.
pub trait BroadcastTransport: Send + 'static {
    /// Send an envelope to every other subscriber. No-op once closed.
    fn publish(&self, envelope: &ChannelEnvelope) -> Result<(), TransportError>;

    /// Hand out the inbound stream. Returns `None` after the first call.
    ///
    /// The stream ends when the transport is closed or the link drops.
    fn take_inbound(&mut self) -> Option<mpsc::Receiver<ChannelEnvelope>>;

    /// Leave the channel. Idempotent.
    fn close(&mut self);

    fn is_closed(&self) -> bool;
}

/// Errors from the broadcast transport. Always logged, never fatal.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("transport is closed")]
    Closed,
    #[error(transparent)]
    Encode(#[from] EncodeError),
    #[error("send failed: {0}")]
    Send(String),
    #[error("connect failed: {0}")]
    Connect(String),
}
