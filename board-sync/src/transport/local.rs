//! In-process transport over a shared [`ChannelHub`].
//!
//! Every session in the process that joins the same channel name sees the
//! others' envelopes. Used by tests and by hosts that run several boards
//! side by side without a relay.

use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::{BroadcastTransport, TransportError};
use crate::broadcast::{ChannelGroup, ChannelRegistry, ChannelStats};
use crate::protocol::ChannelEnvelope;

/// Inbound envelopes buffered per transport before the forwarder waits.
const INBOUND_CAPACITY: usize = 256;

/// Process-wide registry of named channels. Cheap to clone.
#[derive(Clone)]
pub struct ChannelHub {
    registry: Arc<ChannelRegistry>,
}

impl ChannelHub {
    /// `capacity` is the per-subscriber frame buffer of each channel.
    pub fn new(capacity: usize) -> Self {
        Self {
            registry: Arc::new(ChannelRegistry::new(capacity)),
        }
    }

    /// Subscribe to `channel`. Frames published from now on are buffered
    /// until the inbound stream is taken.
    pub async fn join(&self, channel: &str) -> LocalTransport {
        let group = self.registry.get_or_create(channel).await;
        let mut subscriber = group.subscribe();
        let id = subscriber.id();
        let (tx, rx) = mpsc::channel(INBOUND_CAPACITY);

        let forwarder = tokio::spawn(async move {
            while let Some(bytes) = subscriber.recv().await {
                match ChannelEnvelope::decode(&bytes) {
                    Ok(envelope) => {
                        if tx.send(envelope).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => log::warn!("Dropping undecodable envelope: {e}"),
                }
            }
        });

        log::debug!("Subscriber {id} joined {channel}");
        LocalTransport {
            group,
            id,
            inbound: Some(rx),
            forwarder: Some(forwarder),
            closed: false,
        }
    }

    pub async fn stats(&self, channel: &str) -> Option<ChannelStats> {
        self.registry.get(channel).await.map(|g| g.stats())
    }

    /// Forget a channel nobody listens to any more.
    pub async fn prune(&self, channel: &str) -> bool {
        self.registry.remove_if_empty(channel).await
    }

    pub async fn channel_count(&self) -> usize {
        self.registry.channel_count().await
    }
}

impl Default for ChannelHub {
    fn default() -> Self {
        Self::new(1024)
    }
}

/// One membership of a [`ChannelHub`] channel.
pub struct LocalTransport {
    group: Arc<ChannelGroup>,
    id: Uuid,
    inbound: Option<mpsc::Receiver<ChannelEnvelope>>,
    forwarder: Option<JoinHandle<()>>,
    closed: bool,
}

impl LocalTransport {
    /// Publish bytes that are not necessarily a valid envelope.
    pub fn publish_raw(&self, bytes: Vec<u8>) {
        if !self.closed {
            self.group.publish(self.id, Arc::new(bytes));
        }
    }
}

impl BroadcastTransport for LocalTransport {
    fn publish(&self, envelope: &ChannelEnvelope) -> Result<(), TransportError> {
        if self.closed {
            return Ok(());
        }
        let encoded = envelope.encode()?;
        let others = self.group.publish(self.id, Arc::new(encoded));
        log::trace!(
            "{} published {:?} to {} subscribers",
            self.id,
            envelope.kind,
            others
        );
        Ok(())
    }

    fn take_inbound(&mut self) -> Option<mpsc::Receiver<ChannelEnvelope>> {
        self.inbound.take()
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        // Aborting drops the subscriber and the inbound sender
        if let Some(forwarder) = self.forwarder.take() {
            forwarder.abort();
        }
        log::debug!("Subscriber {} left {}", self.id, self.group.name());
    }

    fn is_closed(&self) -> bool {
        self.closed
    }
}

impl Drop for LocalTransport {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::EnvelopeKind;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_envelope_reaches_other_subscriber() {
        let hub = ChannelHub::new(16);
        let a = hub.join("yjs:doc").await;
        let mut b = hub.join("yjs:doc").await;
        let mut b_rx = b.take_inbound().unwrap();

        a.publish(&ChannelEnvelope::doc_update(vec![1, 2])).unwrap();

        let got = timeout(Duration::from_secs(1), b_rx.recv()).await.unwrap().unwrap();
        assert_eq!(got.kind, EnvelopeKind::DocUpdate);
        assert_eq!(got.payload, vec![1, 2]);
        assert!(b.take_inbound().is_none());
    }

    #[tokio::test]
    async fn test_no_self_delivery() {
        let hub = ChannelHub::new(16);
        let mut a = hub.join("yjs:doc").await;
        let mut a_rx = a.take_inbound().unwrap();

        a.publish(&ChannelEnvelope::sync_request()).unwrap();
        let own = timeout(Duration::from_millis(50), a_rx.recv()).await;
        assert!(own.is_err());
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_ends_stream() {
        let hub = ChannelHub::new(16);
        let a = hub.join("yjs:doc").await;
        let mut b = hub.join("yjs:doc").await;
        let mut b_rx = b.take_inbound().unwrap();

        b.close();
        b.close();
        assert!(b.is_closed());

        // Publishing after close is a silent no-op
        assert!(b.publish(&ChannelEnvelope::sync_request()).is_ok());

        a.publish(&ChannelEnvelope::doc_update(vec![5])).unwrap();
        let next = timeout(Duration::from_secs(1), b_rx.recv()).await.unwrap();
        assert!(next.is_none());
    }

    #[tokio::test]
    async fn test_garbage_frames_are_dropped() {
        let hub = ChannelHub::new(16);
        let a = hub.join("yjs:doc").await;
        let mut b = hub.join("yjs:doc").await;
        let mut b_rx = b.take_inbound().unwrap();

        a.publish_raw(vec![0xFF, 0xFF]);
        a.publish(&ChannelEnvelope::sync_request()).unwrap();

        let got = timeout(Duration::from_secs(1), b_rx.recv()).await.unwrap().unwrap();
        assert_eq!(got.kind, EnvelopeKind::SyncRequest);
    }

    #[tokio::test]
    async fn test_hub_stats_and_prune() {
        let hub = ChannelHub::new(16);
        let a = hub.join("yjs:doc").await;
        let b = hub.join("yjs:doc").await;

        a.publish(&ChannelEnvelope::sync_request()).unwrap();
        let stats = hub.stats("yjs:doc").await.unwrap();
        assert_eq!(stats.frames_published, 1);
        assert_eq!(stats.subscribers, 2);

        assert!(!hub.prune("yjs:doc").await);
        drop(a);
        drop(b);
        // Aborted forwarders release their subscribers asynchronously
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(hub.prune("yjs:doc").await);
        assert_eq!(hub.channel_count().await, 0);
    }
}
