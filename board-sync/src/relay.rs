//! Stateless WebSocket pub/sub relay.
//!
//! Architecture:
//! ```text
//! Client A ──┐                                   ┌──► Client B
//!            ├── Subscribe("yjs:board-1") ── ChannelGroup
//! Client B ──┘        Publish(bytes) ──────────  └──► Client C
//! Client C ──── Subscribe("yjs:board-1")
//! ```
//!
//! The relay holds no document state and never decodes envelopes. It only
//! routes opaque bytes between subscribers of the same channel, excluding
//! the publisher. Durability lives in the clients.

use std::net::SocketAddr;
use std::sync::Arc;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, RwLock};
use tokio_tungstenite::tungstenite::Message;

use crate::broadcast::ChannelRegistry;
use crate::protocol::RelayFrame;

/// Relay configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Frames buffered per subscriber before the slowest ones lag
    pub broadcast_capacity: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            broadcast_capacity: 256,
        }
    }
}

impl RelayConfig {
    /// Ephemeral port on localhost.
    pub fn for_testing() -> Self {
        Self {
            bind_addr: "127.0.0.1:0".to_string(),
            broadcast_capacity: 64,
        }
    }
}

/// Relay statistics.
#[derive(Debug, Clone, Default)]
pub struct RelayStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_frames: u64,
    pub total_bytes: u64,
    pub active_channels: usize,
}

/// The relay server.
pub struct RelayServer {
    config: RelayConfig,
    registry: Arc<ChannelRegistry>,
    stats: Arc<RwLock<RelayStats>>,
    shutdown: watch::Sender<bool>,
}

impl RelayServer {
    pub fn new(config: RelayConfig) -> Self {
        let registry = Arc::new(ChannelRegistry::new(config.broadcast_capacity));
        let (shutdown, _) = watch::channel(false);
        Self {
            config,
            registry,
            stats: Arc::new(RwLock::new(RelayStats::default())),
            shutdown,
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(RelayConfig::default())
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    /// Bind the configured address and serve until [`RelayServer::shutdown`].
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Relay listening on {}", listener.local_addr()?);
        self.serve(listener).await
    }

    /// Serve on an already-bound listener (lets tests use port 0).
    pub async fn serve(
        &self,
        listener: TcpListener,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let mut shutdown = self.shutdown.subscribe();
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, addr) = accepted?;
                    log::debug!("New TCP connection from {addr}");

                    let registry = self.registry.clone();
                    let stats = self.stats.clone();
                    let shutdown = self.shutdown.subscribe();
                    tokio::spawn(async move {
                        if let Err(e) =
                            Self::handle_connection(stream, addr, registry, stats, shutdown).await
                        {
                            log::error!("Connection error from {addr}: {e}");
                        }
                    });
                }
                _ = shutdown.changed() => {
                    log::info!("Relay shutting down");
                    return Ok(());
                }
            }
        }
    }

    /// Stop accepting and drop every open connection.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    pub async fn stats(&self) -> RelayStats {
        let mut stats = self.stats.read().await.clone();
        stats.active_channels = self.registry.channel_count().await;
        stats
    }

    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        registry: Arc<ChannelRegistry>,
        stats: Arc<RwLock<RelayStats>>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        // First frame must name the channel
        let channel = loop {
            match ws_receiver.next().await {
                Some(Ok(Message::Binary(data))) => {
                    let bytes: Vec<u8> = data.into();
                    match RelayFrame::decode(&bytes) {
                        Ok(RelayFrame::Subscribe { channel }) => break channel,
                        Ok(RelayFrame::Publish { .. }) => {
                            log::warn!("Publish before subscribe from {addr}, closing");
                            return Ok(());
                        }
                        Err(e) => {
                            log::warn!("Bad handshake frame from {addr}: {e}");
                            return Ok(());
                        }
                    }
                }
                Some(Ok(Message::Ping(data))) => ws_sender.send(Message::Pong(data)).await?,
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(e.into()),
                None => return Ok(()),
            }
        };

        let group = registry.get_or_create(&channel).await;
        let mut subscriber = group.subscribe();
        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }
        log::info!("{addr} subscribed to {channel} as {}", subscriber.id());

        let result: Result<(), Box<dyn std::error::Error + Send + Sync>> = async {
            loop {
                tokio::select! {
                    msg = ws_receiver.next() => match msg {
                        Some(Ok(Message::Binary(data))) => {
                            let bytes: Vec<u8> = data.into();
                            match RelayFrame::decode(&bytes) {
                                Ok(RelayFrame::Publish { payload }) => {
                                    {
                                        let mut s = stats.write().await;
                                        s.total_frames += 1;
                                        s.total_bytes += payload.len() as u64;
                                    }
                                    let others = group.publish(subscriber.id(), Arc::new(payload));
                                    log::trace!("Relayed frame on {channel} to {others} subscribers");
                                }
                                Ok(RelayFrame::Subscribe { .. }) => {
                                    log::warn!("Ignoring second subscribe from {addr}");
                                }
                                Err(e) => log::warn!("Failed to decode frame from {addr}: {e}"),
                            }
                        }
                        Some(Ok(Message::Ping(data))) => ws_sender.send(Message::Pong(data)).await?,
                        Some(Ok(Message::Close(_))) | None => {
                            log::info!("Connection closed from {addr}");
                            return Ok(());
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => return Err(e.into()),
                    },
                    outbound = subscriber.recv() => match outbound {
                        Some(bytes) => {
                            ws_sender.send(Message::Binary(bytes.as_ref().clone().into())).await?;
                        }
                        None => return Ok(()),
                    },
                    _ = shutdown.changed() => {
                        let _ = ws_sender.send(Message::Close(None)).await;
                        return Ok(());
                    }
                }
            }
        }
        .await;

        drop(subscriber);
        registry.remove_if_empty(&channel).await;
        {
            let mut s = stats.write().await;
            s.active_connections = s.active_connections.saturating_sub(1);
        }
        result
    }
}
