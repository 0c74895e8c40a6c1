//! WebSocket transport to a [`RelayServer`](crate::relay::RelayServer).
//!
//! ```text
//! publish() ──► out_tx ──► writer task ──► RelayFrame::Publish ──► relay
//!                                                                    │
//! inbound  ◄── reader task ◄── raw envelope bytes ◄──────────────────┘
//! ```
//!
//! The first frame on every connection is `RelayFrame::Subscribe`.

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;

use super::{BroadcastTransport, TransportError};
use crate::protocol::{ChannelEnvelope, RelayFrame};

/// Outgoing frames buffered before `publish` reports backpressure.
const OUTGOING_CAPACITY: usize = 256;
const INBOUND_CAPACITY: usize = 256;

/// Client side of a relay connection bound to a single channel.
pub struct WsTransport {
    channel: String,
    outgoing: Option<mpsc::Sender<Vec<u8>>>,
    inbound: Option<mpsc::Receiver<ChannelEnvelope>>,
    reader: Option<JoinHandle<()>>,
    closed: bool,
}

impl WsTransport {
    /// Connect to `url` (e.g. `ws://127.0.0.1:9090`) and subscribe to `channel`.
    pub async fn connect(url: &str, channel: &str) -> Result<Self, TransportError> {
        let (ws_stream, _) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        let subscribe = RelayFrame::Subscribe {
            channel: channel.to_string(),
        }
        .encode()?;
        ws_writer
            .send(Message::Binary(subscribe.into()))
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;

        // Writer task: forward outgoing channel to WebSocket
        let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(OUTGOING_CAPACITY);
        tokio::spawn(async move {
            while let Some(data) = out_rx.recv().await {
                if ws_writer.send(Message::Binary(data.into())).await.is_err() {
                    log::warn!("Relay connection lost while writing");
                    return;
                }
            }
            let _ = ws_writer.send(Message::Close(None)).await;
        });

        // Reader task: raw envelope bytes from the relay
        let (in_tx, in_rx) = mpsc::channel(INBOUND_CAPACITY);
        let reader_channel = channel.to_string();
        let reader = tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Binary(data)) => {
                        let bytes: Vec<u8> = data.into();
                        match ChannelEnvelope::decode(&bytes) {
                            Ok(envelope) => {
                                if in_tx.send(envelope).await.is_err() {
                                    break;
                                }
                            }
                            Err(e) => log::warn!("Dropping undecodable envelope from relay: {e}"),
                        }
                    }
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }
            log::info!("Relay stream for {reader_channel} ended");
        });

        log::info!("Connected to relay {url} on {channel}");
        Ok(Self {
            channel: channel.to_string(),
            outgoing: Some(out_tx),
            inbound: Some(in_rx),
            reader: Some(reader),
            closed: false,
        })
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }
}

impl BroadcastTransport for WsTransport {
    fn publish(&self, envelope: &ChannelEnvelope) -> Result<(), TransportError> {
        if self.closed {
            return Ok(());
        }
        let outgoing = self.outgoing.as_ref().ok_or(TransportError::Closed)?;
        let frame = RelayFrame::Publish {
            payload: envelope.encode()?,
        }
        .encode()?;

        outgoing.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                TransportError::Send("outgoing queue full".to_string())
            }
            mpsc::error::TrySendError::Closed(_) => TransportError::Closed,
        })
    }

    fn take_inbound(&mut self) -> Option<mpsc::Receiver<ChannelEnvelope>> {
        self.inbound.take()
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        // Dropping the sender lets the writer flush and send Close
        self.outgoing = None;
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        log::debug!("Closed relay transport for {}", self.channel);
    }

    fn is_closed(&self) -> bool {
        self.closed
    }
}

impl Drop for WsTransport {
    fn drop(&mut self) {
        self.close();
    }
}
