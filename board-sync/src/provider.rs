//! Sync provider: binds one document to one broadcast channel.
//!
//! Lifecycle:
//! ```text
//!  spawn()
//!    │ load cache, register observer, take inbound stream
//!    ▼
//! CONNECTING ──► SYNCING ──► publish SYNC_REQUEST, arm bootstrap timer
//!                  │
//!                  │ first valid SYNC_RESPONSE, or timer expiry
//!                  ▼
//!               SYNCED ──► steady state
//!                  │
//!   destroy / handle dropped / transport closed
//!                  ▼
//!             DISCONNECTED  (goodbye, final flush, observer released)
//! ```
//!
//! Everything that touches the awareness table or feeds the document from
//! the network runs on a single task, one `tokio::select!` loop per session.
//! The application talks to it through [`ProviderHandle`].

use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::awareness::{AwarenessChange, AwarenessTable, ClientId};
use crate::cache::DocumentCache;
use crate::document::{Delta, DocumentError, UpdateLog};
use crate::offline::OfflineQueue;
use crate::protocol::{encode_awareness, ChannelEnvelope, EnvelopeKind};
use crate::transport::{channel_name, BroadcastTransport, TransportError};

// ───────────────────────────────────────────────────────────────────
// Public types
// ───────────────────────────────────────────────────────────────────

/// Where a provider is in its lifecycle. `Disconnected` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionStatus {
    Connecting,
    Syncing,
    Synced,
    Disconnected,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Syncing => "syncing",
            ConnectionStatus::Synced => "synced",
            ConnectionStatus::Disconnected => "disconnected",
        };
        f.write_str(name)
    }
}

/// Provider configuration.
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    /// How long to wait for a SYNC_RESPONSE before assuming we are alone
    pub bootstrap_timeout: Duration,
    /// Remote awareness records older than this are evicted
    pub awareness_timeout: Duration,
    /// Eviction and renewal check period
    pub awareness_check_interval: Duration,
    /// Debounce period for cache saves
    pub cache_flush_interval: Duration,
    /// Channel name prefix, followed by the document id
    pub channel_prefix: String,
    /// Maximum unpublished updates kept for retry
    pub offline_queue_capacity: usize,
    /// Re-broadcast remote awareness entries that changed our table
    pub relay_remote_awareness: bool,
    /// Buffered [`ProviderEvent`]s before new ones are dropped
    pub event_capacity: usize,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            bootstrap_timeout: Duration::from_millis(500),
            awareness_timeout: Duration::from_secs(30),
            awareness_check_interval: Duration::from_secs(3),
            cache_flush_interval: Duration::from_secs(1),
            channel_prefix: "yjs:".to_string(),
            offline_queue_capacity: 10_000,
            relay_remote_awareness: true,
            event_capacity: 256,
        }
    }
}

impl ProviderConfig {
    /// Short timers so tests run in milliseconds.
    pub fn for_testing() -> Self {
        Self {
            bootstrap_timeout: Duration::from_millis(100),
            awareness_timeout: Duration::from_millis(400),
            awareness_check_interval: Duration::from_millis(50),
            cache_flush_interval: Duration::from_millis(50),
            ..Self::default()
        }
    }
}

/// Notifications mirrored from the callbacks, for consumers that prefer a stream.
#[derive(Debug, Clone, PartialEq)]
pub enum ProviderEvent {
    Status(ConnectionStatus),
    /// Emitted exactly once per provider
    Synced,
    Awareness(AwarenessChange),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProviderError {
    #[error("provider loop has stopped")]
    Stopped,
    #[error("transport inbound stream was already taken")]
    InboundTaken,
    #[error(transparent)]
    Document(#[from] DocumentError),
}

type StatusCallback = Box<dyn Fn(ConnectionStatus) + Send + Sync>;
type SyncedCallback = Box<dyn Fn() + Send + Sync>;

enum Command {
    SetLocalAwareness(Value),
    ClearLocalAwareness,
    AwarenessStates(oneshot::Sender<HashMap<ClientId, Value>>),
    Destroy,
}

// ───────────────────────────────────────────────────────────────────
// Builder
// ───────────────────────────────────────────────────────────────────

/// Configures and starts a sync session for one document.
///
/// ```ignore
/// let doc = SyncDocument::new();
/// let transport = hub.join(&channel_name("yjs:", "board-1")).await;
/// let handle = Provider::new("board-1", doc.clone())
///     .with_cache(cache)
///     .on_synced(|| log::info!("board ready"))
///     .spawn(transport)?;
/// handle.wait_synced().await;
/// ```
pub struct Provider<D: UpdateLog> {
    document_id: String,
    document: D,
    config: ProviderConfig,
    cache: Option<Arc<dyn DocumentCache>>,
    status_callbacks: Vec<StatusCallback>,
    synced_callbacks: Vec<SyncedCallback>,
}

impl<D: UpdateLog> Provider<D> {
    pub fn new(document_id: impl Into<String>, document: D) -> Self {
        Self {
            document_id: document_id.into(),
            document,
            config: ProviderConfig::default(),
            cache: None,
            status_callbacks: Vec::new(),
            synced_callbacks: Vec::new(),
        }
    }

    pub fn with_config(mut self, config: ProviderConfig) -> Self {
        self.config = config;
        self
    }

    /// Replay `cache` before going online and keep it up to date.
    pub fn with_cache(mut self, cache: Arc<dyn DocumentCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn on_status_change(mut self, f: impl Fn(ConnectionStatus) + Send + Sync + 'static) -> Self {
        self.status_callbacks.push(Box::new(f));
        self
    }

    /// Called once, when the initial sync completes or times out.
    pub fn on_synced(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.synced_callbacks.push(Box::new(f));
        self
    }

    /// Channel this provider expects its transport to be bound to.
    pub fn channel_name(&self) -> String {
        channel_name(&self.config.channel_prefix, &self.document_id)
    }

    /// Start the session on a transport already bound to [`Provider::channel_name`].
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn<T: BroadcastTransport>(self, transport: T) -> Result<ProviderHandle, ProviderError> {
        let client_id = self.document.client_id();
        let (status_tx, status_rx) = watch::channel(ConnectionStatus::Connecting);
        let (synced_tx, synced_rx) = watch::channel(false);
        let (event_tx, event_rx) = mpsc::channel(self.config.event_capacity.max(1));
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (delta_tx, delta_rx) = mpsc::unbounded_channel();

        let mut session = Session {
            document_id: self.document_id.clone(),
            document: self.document,
            transport,
            awareness: AwarenessTable::new(client_id),
            offline: OfflineQueue::new(self.config.offline_queue_capacity),
            config: self.config,
            cache: self.cache,
            observer: None,
            status: ConnectionStatus::Connecting,
            status_tx,
            synced_tx,
            events: event_tx,
            status_callbacks: self.status_callbacks,
            synced_callbacks: self.synced_callbacks,
            synced_fired: false,
            dirty: false,
            awareness_resend: false,
            torn_down: false,
        };
        session.announce_status(ConnectionStatus::Connecting);

        // Cache first, so the observer never re-publishes what we already had
        session.load_cache();
        session.observer = Some(session.document.observe(delta_tx)?);
        let inbound = session
            .transport
            .take_inbound()
            .ok_or(ProviderError::InboundTaken)?;
        session.set_status(ConnectionStatus::Syncing);

        log::info!(
            "Provider for {} started as client {client_id}",
            session.document_id
        );
        let task = tokio::spawn(session.run(inbound, delta_rx, command_rx));

        Ok(ProviderHandle {
            document_id: self.document_id,
            client_id,
            commands: command_tx,
            status: status_rx,
            synced: synced_rx,
            events: Some(event_rx),
            task: Some(task),
        })
    }
}

// ───────────────────────────────────────────────────────────────────
// Handle
// ───────────────────────────────────────────────────────────────────

/// Application side of a running provider. Dropping it tears the session down.
pub struct ProviderHandle {
    document_id: String,
    client_id: ClientId,
    commands: mpsc::UnboundedSender<Command>,
    status: watch::Receiver<ConnectionStatus>,
    synced: watch::Receiver<bool>,
    events: Option<mpsc::Receiver<ProviderEvent>>,
    task: Option<JoinHandle<()>>,
}

impl ProviderHandle {
    pub fn document_id(&self) -> &str {
        &self.document_id
    }

    /// Our awareness key.
    pub fn client_id(&self) -> ClientId {
        self.client_id
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.status.borrow()
    }

    /// Resolve once the initial sync has completed. False if the provider
    /// stopped before ever syncing.
    pub async fn wait_synced(&self) -> bool {
        let mut synced = self.synced.clone();
        let ok = synced.wait_for(|s| *s).await.is_ok();
        ok
    }

    /// Resolve once the provider has reached DISCONNECTED.
    pub async fn wait_disconnected(&self) {
        let mut status = self.status.clone();
        let _ = status
            .wait_for(|s| *s == ConnectionStatus::Disconnected)
            .await;
    }

    /// Replace our awareness state and broadcast it.
    pub fn set_local_awareness(&self, state: Value) -> Result<(), ProviderError> {
        self.send(Command::SetLocalAwareness(state))
    }

    /// Withdraw our awareness state and broadcast the removal.
    pub fn clear_local_awareness(&self) -> Result<(), ProviderError> {
        self.send(Command::ClearLocalAwareness)
    }

    /// Snapshot of every live awareness state, ours included.
    pub async fn awareness_states(&self) -> Result<HashMap<ClientId, Value>, ProviderError> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::AwarenessStates(tx))?;
        rx.await.map_err(|_| ProviderError::Stopped)
    }

    /// Take the event stream. Only the first call returns `Some`.
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<ProviderEvent>> {
        self.events.take()
    }

    /// Tear the session down and wait for it to finish.
    pub async fn destroy(mut self) {
        let _ = self.commands.send(Command::Destroy);
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                log::error!("Provider task for {} failed: {e}", self.document_id);
            }
        }
    }

    fn send(&self, command: Command) -> Result<(), ProviderError> {
        self.commands.send(command).map_err(|_| ProviderError::Stopped)
    }
}

impl Drop for ProviderHandle {
    fn drop(&mut self) {
        // The task finishes teardown on its own
        let _ = self.commands.send(Command::Destroy);
    }
}

// ───────────────────────────────────────────────────────────────────
// Session (runs on the provider task)
// ───────────────────────────────────────────────────────────────────

struct Session<D: UpdateLog, T: BroadcastTransport> {
    document_id: String,
    document: D,
    transport: T,
    awareness: AwarenessTable,
    offline: OfflineQueue,
    config: ProviderConfig,
    cache: Option<Arc<dyn DocumentCache>>,
    observer: Option<D::Observer>,
    status: ConnectionStatus,
    status_tx: watch::Sender<ConnectionStatus>,
    synced_tx: watch::Sender<bool>,
    events: mpsc::Sender<ProviderEvent>,
    status_callbacks: Vec<StatusCallback>,
    synced_callbacks: Vec<SyncedCallback>,
    synced_fired: bool,
    /// Document changed since the last cache save
    dirty: bool,
    /// Last awareness publish of our own record failed
    awareness_resend: bool,
    torn_down: bool,
}

impl<D: UpdateLog, T: BroadcastTransport> Session<D, T> {
    async fn run(
        mut self,
        mut inbound: mpsc::Receiver<ChannelEnvelope>,
        mut deltas: mpsc::UnboundedReceiver<Delta>,
        mut commands: mpsc::UnboundedReceiver<Command>,
    ) {
        self.publish_or_warn(&ChannelEnvelope::sync_request());

        let bootstrap = tokio::time::sleep(self.config.bootstrap_timeout);
        tokio::pin!(bootstrap);

        let mut awareness_tick = tokio::time::interval(self.config.awareness_check_interval);
        awareness_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut flush_tick = tokio::time::interval(self.config.cache_flush_interval);
        flush_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            let syncing = self.status == ConnectionStatus::Syncing;
            tokio::select! {
                envelope = inbound.recv() => match envelope {
                    Some(envelope) => self.handle_envelope(envelope),
                    None => {
                        log::info!("Transport for {} closed", self.document_id);
                        break;
                    }
                },
                delta = deltas.recv() => match delta {
                    Some(delta) => self.handle_delta(delta),
                    None => break,
                },
                command = commands.recv() => match command {
                    Some(Command::Destroy) | None => break,
                    Some(command) => self.handle_command(command),
                },
                _ = &mut bootstrap, if syncing => self.on_bootstrap_timeout(),
                _ = awareness_tick.tick() => self.tick_awareness(),
                _ = flush_tick.tick() => {
                    self.retry_offline();
                    self.flush_cache();
                }
            }
        }

        // Edits made right before shutdown still go out and get cached
        while let Ok(delta) = deltas.try_recv() {
            self.handle_delta(delta);
        }
        self.teardown();
    }

    // ── Inbound ──────────────────────────────────────────────────

    fn handle_envelope(&mut self, envelope: ChannelEnvelope) {
        log::trace!(
            "{} received {:?} ({} bytes)",
            self.document_id,
            envelope.kind,
            envelope.payload.len()
        );

        match envelope.kind {
            EnvelopeKind::DocUpdate => {
                if let Err(e) = self.document.apply_delta(&envelope.payload) {
                    log::warn!("Dropping update for {}: {e}", self.document_id);
                }
            }
            EnvelopeKind::SyncRequest => {
                let state = self.document.full_state();
                self.publish_or_warn(&ChannelEnvelope::sync_response(state));
                // Let the newcomer see us without waiting for a renewal
                if self.awareness.local_state().is_some() {
                    let local = self.awareness.local_id();
                    self.publish_awareness(&[local]);
                }
            }
            EnvelopeKind::SyncResponse => match self.document.apply_delta(&envelope.payload) {
                Ok(()) => {
                    if self.status == ConnectionStatus::Syncing {
                        log::debug!("{} bootstrapped from a peer", self.document_id);
                        self.mark_synced();
                    }
                }
                Err(e) => log::warn!("Dropping sync response for {}: {e}", self.document_id),
            },
            EnvelopeKind::AwarenessUpdate => match envelope.awareness_entries() {
                Ok(entries) => {
                    let change = self.awareness.apply_entries(&entries);
                    if !change.is_empty() {
                        if self.config.relay_remote_awareness {
                            self.publish_awareness(&change.changed());
                        }
                        self.emit(ProviderEvent::Awareness(change));
                    }
                }
                Err(e) => log::warn!("Dropping awareness update for {}: {e}", self.document_id),
            },
        }
    }

    fn handle_delta(&mut self, delta: Delta) {
        self.dirty = true;
        if let Delta::Local(update) = delta {
            self.publish_update(update);
        }
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::SetLocalAwareness(state) => {
                let change = self.awareness.set_local(state);
                self.publish_awareness(&change.changed());
                self.emit(ProviderEvent::Awareness(change));
            }
            Command::ClearLocalAwareness => {
                let change = self.awareness.clear_local();
                if !change.is_empty() {
                    self.publish_awareness(&change.changed());
                    self.emit(ProviderEvent::Awareness(change));
                }
            }
            Command::AwarenessStates(reply) => {
                let _ = reply.send(self.awareness.states());
            }
            Command::Destroy => {}
        }
    }

    // ── Timers ───────────────────────────────────────────────────

    fn on_bootstrap_timeout(&mut self) {
        log::debug!(
            "No sync response for {} within {:?}, continuing alone",
            self.document_id,
            self.config.bootstrap_timeout
        );
        self.mark_synced();
    }

    fn tick_awareness(&mut self) {
        let now = Instant::now();
        let timeout = self.config.awareness_timeout;

        let removed = self.awareness.evict_stale(now, timeout);
        if !removed.is_empty() {
            log::debug!("Evicted {} stale awareness records", removed.len());
            self.emit(ProviderEvent::Awareness(AwarenessChange {
                removed,
                ..AwarenessChange::default()
            }));
        }

        let local = self.awareness.local_id();
        if self.awareness.local_needs_renewal(now, timeout) {
            self.awareness.renew_local(now);
            self.publish_awareness(&[local]);
        } else if self.awareness_resend {
            self.publish_awareness(&[local]);
        }
    }

    fn flush_cache(&mut self) {
        if !self.dirty {
            return;
        }
        let Some(cache) = &self.cache else {
            self.dirty = false;
            return;
        };
        match cache.save(&self.document_id, &self.document.full_state()) {
            Ok(()) => self.dirty = false,
            Err(e) => log::warn!("Failed to cache {}: {e}", self.document_id),
        }
    }

    fn load_cache(&mut self) {
        let Some(cache) = &self.cache else { return };
        match cache.load(&self.document_id) {
            Ok(Some(state)) => match self.document.apply_delta(&state) {
                Ok(()) => log::debug!(
                    "Restored {} from cache ({} bytes)",
                    self.document_id,
                    state.len()
                ),
                Err(e) => log::warn!("Ignoring corrupt cache entry for {}: {e}", self.document_id),
            },
            Ok(None) => {}
            Err(e) => log::warn!("Failed to read cache for {}: {e}", self.document_id),
        }
    }

    // ── Outbound ─────────────────────────────────────────────────

    fn publish_update(&mut self, update: Vec<u8>) {
        self.retry_offline();
        if self.offline.is_empty() {
            match self.transport.publish(&ChannelEnvelope::doc_update(update.clone())) {
                Ok(()) => return,
                Err(e) => log::warn!("Publish failed for {}, queueing: {e}", self.document_id),
            }
        }
        if !self.offline.enqueue(update) {
            log::warn!(
                "Offline queue full for {}, dropping update",
                self.document_id
            );
        }
    }

    fn retry_offline(&mut self) {
        if self.offline.is_empty() {
            return;
        }
        let transport = &self.transport;
        match self
            .offline
            .retry(|update| transport.publish(&ChannelEnvelope::doc_update(update.to_vec())))
        {
            Ok(sent) => log::debug!("Replayed {sent} queued updates for {}", self.document_id),
            Err(e) => log::trace!("Queued updates still pending: {e}"),
        }
    }

    fn publish_awareness(&mut self, ids: &[ClientId]) {
        let local = self.awareness.local_id();
        let result = encode_awareness(&self.awareness.entries_for(ids))
            .map_err(TransportError::from)
            .and_then(|payload| {
                self.transport
                    .publish(&ChannelEnvelope::awareness_update(payload))
            });

        match result {
            Ok(()) => {
                if ids.contains(&local) {
                    self.awareness_resend = false;
                }
            }
            Err(e) => {
                log::warn!("Awareness publish failed for {}: {e}", self.document_id);
                if ids.contains(&local) {
                    self.awareness_resend = true;
                }
            }
        }
    }

    fn publish_or_warn(&self, envelope: &ChannelEnvelope) {
        if let Err(e) = self.transport.publish(envelope) {
            log::warn!(
                "Failed to publish {:?} for {}: {e}",
                envelope.kind,
                self.document_id
            );
        }
    }

    // ── Status ───────────────────────────────────────────────────

    fn mark_synced(&mut self) {
        self.set_status(ConnectionStatus::Synced);
        if self.synced_fired {
            return;
        }
        self.synced_fired = true;
        self.synced_tx.send_replace(true);
        for callback in &self.synced_callbacks {
            callback();
        }
        self.emit(ProviderEvent::Synced);
    }

    fn set_status(&mut self, status: ConnectionStatus) {
        if self.status == status || self.status == ConnectionStatus::Disconnected {
            return;
        }
        log::debug!("{} status {} -> {}", self.document_id, self.status, status);
        self.status = status;
        self.announce_status(status);
    }

    fn announce_status(&self, status: ConnectionStatus) {
        self.status_tx.send_replace(status);
        for callback in &self.status_callbacks {
            callback(status);
        }
        self.emit(ProviderEvent::Status(status));
    }

    fn emit(&self, event: ProviderEvent) {
        if self.events.try_send(event).is_err() {
            log::trace!("Event stream for {} full or closed", self.document_id);
        }
    }

    // ── Teardown ─────────────────────────────────────────────────

    /// Release everything. Safe to call more than once.
    fn teardown(&mut self) {
        if self.torn_down {
            return;
        }
        self.torn_down = true;

        let goodbye = self.awareness.clear_local();
        if !goodbye.is_empty() {
            self.publish_awareness(&goodbye.changed());
            self.emit(ProviderEvent::Awareness(goodbye));
        }
        self.retry_offline();
        self.flush_cache();
        self.transport.close();
        self.observer.take();
        self.set_status(ConnectionStatus::Disconnected);

        log::info!("Provider for {} stopped", self.document_id);
    }
}

impl<D: UpdateLog, T: BroadcastTransport> Drop for Session<D, T> {
    fn drop(&mut self) {
        self.teardown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use crate::document::SyncDocument;
    use crate::transport::ChannelHub;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tokio::time::timeout;

    const CHANNEL: &str = "yjs:board-1";

    #[test]
    fn test_config_defaults() {
        let config = ProviderConfig::default();
        assert_eq!(config.bootstrap_timeout, Duration::from_millis(500));
        assert_eq!(config.awareness_timeout, Duration::from_secs(30));
        assert_eq!(config.channel_prefix, "yjs:");
        assert_eq!(config.offline_queue_capacity, 10_000);
        assert!(config.relay_remote_awareness);
    }

    #[test]
    fn test_status_display() {
        assert_eq!(ConnectionStatus::Connecting.to_string(), "connecting");
        assert_eq!(ConnectionStatus::Disconnected.to_string(), "disconnected");
    }

    #[test]
    fn test_channel_name() {
        let provider = Provider::new("board-1", SyncDocument::new());
        assert_eq!(provider.channel_name(), CHANNEL);
    }

    #[tokio::test]
    async fn test_alone_reaches_synced_after_timeout() {
        let hub = ChannelHub::new(64);
        let transport = hub.join(CHANNEL).await;
        let statuses = Arc::new(Mutex::new(Vec::new()));
        let synced_calls = Arc::new(AtomicUsize::new(0));

        let seen = statuses.clone();
        let calls = synced_calls.clone();
        let started = Instant::now();
        let handle = Provider::new("board-1", SyncDocument::new())
            .with_config(ProviderConfig::for_testing())
            .on_status_change(move |s| seen.lock().unwrap().push(s))
            .on_synced(move || {
                calls.fetch_add(1, Ordering::SeqCst);
            })
            .spawn(transport)
            .unwrap();

        assert!(timeout(Duration::from_secs(2), handle.wait_synced()).await.unwrap());
        assert!(started.elapsed() >= Duration::from_millis(100));
        assert_eq!(handle.status(), ConnectionStatus::Synced);

        handle.destroy().await;
        assert_eq!(synced_calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            *statuses.lock().unwrap(),
            vec![
                ConnectionStatus::Connecting,
                ConnectionStatus::Syncing,
                ConnectionStatus::Synced,
                ConnectionStatus::Disconnected,
            ]
        );
    }

    #[tokio::test]
    async fn test_inbound_already_taken() {
        let hub = ChannelHub::new(64);
        let mut transport = hub.join(CHANNEL).await;
        let _stolen = transport.take_inbound();

        let result = Provider::new("board-1", SyncDocument::new()).spawn(transport);
        assert!(matches!(result, Err(ProviderError::InboundTaken)));
    }

    #[tokio::test]
    async fn test_commands_after_stop() {
        let hub = ChannelHub::new(64);
        let transport = hub.join(CHANNEL).await;
        let handle = Provider::new("board-1", SyncDocument::new())
            .with_config(ProviderConfig::for_testing())
            .spawn(transport)
            .unwrap();

        handle.commands.send(Command::Destroy).unwrap();
        timeout(Duration::from_secs(1), handle.wait_disconnected())
            .await
            .unwrap();
        // Give the task a moment to drop its receiver
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(
            handle.set_local_awareness(serde_json::json!({"name": "late"})),
            Err(ProviderError::Stopped)
        );
        handle.destroy().await;
    }

    #[tokio::test]
    async fn test_cache_written_on_destroy() {
        let hub = ChannelHub::new(64);
        let cache = Arc::new(MemoryCache::new());
        let doc = SyncDocument::new();

        let handle = Provider::new("board-1", doc.clone())
            .with_config(ProviderConfig::for_testing())
            .with_cache(cache.clone())
            .spawn(hub.join(CHANNEL).await)
            .unwrap();

        doc.insert_text("content", 0, "persist me");
        handle.destroy().await;

        let restored = SyncDocument::new();
        let state = cache.load("board-1").unwrap().unwrap();
        restored.apply_delta(&state).unwrap();
        assert_eq!(restored.text("content"), "persist me");
    }
}
