//! Named fan-out channels with sender exclusion.
//!
//! Uses tokio broadcast channels for O(1) send to all subscribers.
//! Each subscriber gets an independent receiver that buffers up to
//! `capacity` frames; a subscriber that falls further behind loses the
//! oldest frames, which is fine for a best-effort channel carrying CRDT
//! deltas and idempotent snapshots.
//!
//! ```text
//!              ChannelRegistry
//!   "yjs:board-1" ──► ChannelGroup ──┬──► Subscriber A (skips own frames)
//!   "yjs:board-2" ──► ChannelGroup   ├──► Subscriber B
//!                                    └──► Subscriber C
//! ```
//!
//! Shared by the in-process hub and the WebSocket relay.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

/// One published frame, tagged with its publisher.
#[derive(Debug, Clone)]
struct Frame {
    sender: Uuid,
    bytes: Arc<Vec<u8>>,
}

/// Statistics for monitoring channel health.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChannelStats {
    pub frames_published: u64,
    pub frames_lagged: u64,
    pub subscribers: usize,
}

/// Lock-free counters, read via [`ChannelGroup::stats`].
#[derive(Default)]
struct AtomicChannelStats {
    frames_published: AtomicU64,
    frames_lagged: AtomicU64,
}

/// A single named broadcast channel.
pub struct ChannelGroup {
    name: String,
    sender: broadcast::Sender<Frame>,
    subscribers: Arc<AtomicUsize>,
    stats: Arc<AtomicChannelStats>,
}

impl ChannelGroup {
    /// `capacity` is the number of frames buffered per subscriber.
    pub fn new(name: impl Into<String>, capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            name: name.into(),
            sender,
            subscribers: Arc::new(AtomicUsize::new(0)),
            stats: Arc::new(AtomicChannelStats::default()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Join the channel under a fresh subscriber id.
    pub fn subscribe(&self) -> Subscriber {
        self.subscribers.fetch_add(1, Ordering::Relaxed);
        Subscriber {
            id: Uuid::new_v4(),
            rx: self.sender.subscribe(),
            subscribers: self.subscribers.clone(),
            stats: self.stats.clone(),
        }
    }

    /// Fan pre-encoded bytes out to every subscriber except `sender`.
    ///
    /// Returns the number of other subscribers that will see the frame.
    pub fn publish(&self, sender: Uuid, bytes: Arc<Vec<u8>>) -> usize {
        let receivers = self.sender.send(Frame { sender, bytes }).unwrap_or(0);
        self.stats.frames_published.fetch_add(1, Ordering::Relaxed);
        receivers.saturating_sub(1)
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> ChannelStats {
        ChannelStats {
            frames_published: self.stats.frames_published.load(Ordering::Relaxed),
            frames_lagged: self.stats.frames_lagged.load(Ordering::Relaxed),
            subscribers: self.subscriber_count(),
        }
    }
}

/// Receiving end of a channel membership. Dropping it leaves the channel.
pub struct Subscriber {
    id: Uuid,
    rx: broadcast::Receiver<Frame>,
    subscribers: Arc<AtomicUsize>,
    stats: Arc<AtomicChannelStats>,
}

impl Subscriber {
    /// Id to pass as `sender` when publishing, so our own frames are skipped.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Next frame published by someone else. `None` once the channel is gone.
    pub async fn recv(&mut self) -> Option<Arc<Vec<u8>>> {
        loop {
            match self.rx.recv().await {
                Ok(frame) if frame.sender == self.id => continue,
                Ok(frame) => return Some(frame.bytes),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    self.stats.frames_lagged.fetch_add(skipped, Ordering::Relaxed);
                    log::warn!("Subscriber {} lagged, {} frames dropped", self.id, skipped);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

impl Drop for Subscriber {
    fn drop(&mut self) {
        self.subscribers.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Maps channel names to broadcast groups.
///
/// Each channel is isolated: frames never cross between names.
pub struct ChannelRegistry {
    channels: Arc<RwLock<HashMap<String, Arc<ChannelGroup>>>>,
    default_capacity: usize,
}

impl ChannelRegistry {
    pub fn new(default_capacity: usize) -> Self {
        Self {
            channels: Arc::new(RwLock::new(HashMap::new())),
            default_capacity,
        }
    }

    /// Get or create the group for `name`.
    pub async fn get_or_create(&self, name: &str) -> Arc<ChannelGroup> {
        // Fast path: read lock
        {
            let channels = self.channels.read().await;
            if let Some(group) = channels.get(name) {
                return group.clone();
            }
        }

        let mut channels = self.channels.write().await;
        channels
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(ChannelGroup::new(name, self.default_capacity)))
            .clone()
    }

    pub async fn get(&self, name: &str) -> Option<Arc<ChannelGroup>> {
        self.channels.read().await.get(name).cloned()
    }

    /// Drop the group if nobody is subscribed any more.
    pub async fn remove_if_empty(&self, name: &str) -> bool {
        let mut channels = self.channels.write().await;
        let empty = channels
            .get(name)
            .map(|group| group.subscriber_count() == 0)
            .unwrap_or(false);
        if empty {
            channels.remove(name);
        }
        empty
    }

    pub async fn channel_count(&self) -> usize {
        self.channels.read().await.len()
    }

    pub async fn active_channels(&self) -> Vec<String> {
        self.channels.read().await.keys().cloned().collect()
    }
}
