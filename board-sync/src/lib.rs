//! # board-sync: CRDT document sync for collaborative boards
//!
//! Keeps a replicated document and an ephemeral awareness side-channel
//! consistent across any number of clients, using nothing but an
//! unordered, best-effort publish/subscribe channel.
//!
//! ## Architecture
//!
//! ```text
//!  local edit                                   remote peers
//!      │                                             ▲
//!      ▼                                             │
//! ┌──────────────┐  Delta::Local   ┌──────────┐  DOC_UPDATE   ┌───────────┐
//! │ SyncDocument │ ──────────────► │ Provider │ ────────────► │ Transport │
//! │ (UpdateLog)  │ ◄────────────── │ (1 task) │ ◄──────────── │ (hub/ws)  │
//! └──────────────┘  apply_delta    └────┬─────┘   envelopes   └───────────┘
//!                   (network origin)    │
//!                          ┌────────────┼─────────────┐
//!                          ▼                          ▼
//!                 ┌────────────────┐         ┌────────────────┐
//!                 │ AwarenessTable │         │ DocumentCache  │
//!                 │ (LWW, timeout) │         │ (mem / RocksDB)│
//!                 └────────────────┘         └────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: Binary envelope codec (bincode)
//! - [`document`]: Update log trait and the Yrs-backed document
//! - [`awareness`]: Presence records with clock-based last-writer-wins
//! - [`cache`]: Client-side snapshot cache
//! - [`offline`]: Retry queue for updates that failed to publish
//! - [`broadcast`]: Named fan-out channels with sender exclusion
//! - [`transport`]: In-process and WebSocket channel access
//! - [`relay`]: Stateless WebSocket pub/sub relay
//! - [`provider`]: Session lifecycle, bootstrap sync, update relay

pub mod awareness;
pub mod broadcast;
pub mod cache;
pub mod document;
pub mod offline;
pub mod protocol;
pub mod provider;
pub mod relay;
pub mod transport;
mod validate;

// Re-exports for convenience
pub use awareness::{AwarenessChange, AwarenessRecord, AwarenessTable, ClientId};
pub use broadcast::{ChannelGroup, ChannelRegistry, ChannelStats};
pub use cache::{CacheConfig, CacheError, CacheMetadata, DocumentCache, MemoryCache, RocksCache};
pub use document::{Delta, DocumentError, SyncDocument, UpdateLog, NETWORK_ORIGIN};
pub use offline::OfflineQueue;
pub use protocol::{AwarenessEntry, ChannelEnvelope, DecodeError, EncodeError, EnvelopeKind, RelayFrame};
pub use provider::{
    ConnectionStatus, Provider, ProviderConfig, ProviderError, ProviderEvent, ProviderHandle,
};
pub use relay::{RelayConfig, RelayServer, RelayStats};
pub use transport::{channel_name, BroadcastTransport, ChannelHub, LocalTransport, TransportError, WsTransport};
