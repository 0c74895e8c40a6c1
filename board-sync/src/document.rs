//! Update log: the replicated CRDT document and its delta stream.
//!
//! The provider only ever sees opaque byte buffers through [`UpdateLog`].
//! [`SyncDocument`] is the shipped engine, a Yrs document whose update
//! observer tags every emitted delta with its origin:
//!
//! ```text
//! transact_local(..)            apply_delta(..)
//!       │                             │ origin = NETWORK_ORIGIN
//!       ▼                             ▼
//!   ┌──────────────── Yrs Doc ─────────────────┐
//!   │        observe_update_v1 callback        │
//!   └───────────────────┬──────────────────────┘
//!                       ▼
//!        Delta::Local(bytes) | Delta::Remote(bytes)
//! ```
//!
//! The origin tag never leaves the process; only the bytes go on the wire.

use tokio::sync::mpsc;
use yrs::updates::decoder::Decode;
use yrs::{
    Doc, GetString, Origin, ReadTxn, StateVector, Subscription, Text, Transact, TransactionMut,
    Update, WriteTxn,
};

use crate::protocol::DecodeError;
use crate::validate::check_update_v1;

/// Transaction origin used for everything that did not come from a local edit.
pub const NETWORK_ORIGIN: &str = "board-sync/network";

/// An incremental change, tagged with where it was produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delta {
    /// Produced by an edit on this client; must be published exactly once.
    Local(Vec<u8>),
    /// Produced by applying a network or cache update; never re-published.
    Remote(Vec<u8>),
}

impl Delta {
    pub fn bytes(&self) -> &[u8] {
        match self {
            Delta::Local(b) | Delta::Remote(b) => b,
        }
    }

    pub fn into_bytes(self) -> Vec<u8> {
        match self {
            Delta::Local(b) | Delta::Remote(b) => b,
        }
    }

    pub fn is_local(&self) -> bool {
        matches!(self, Delta::Local(_))
    }
}

/// Errors raised by the update log outside of delta decoding.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DocumentError {
    #[error("document is mid-transaction, cannot register observer")]
    ObserverBusy,
}

/// Opaque mergeable state container driven by the provider.
///
/// Implementations must make `apply_delta` idempotent and commutative.
pub trait UpdateLog: Send + Sync + 'static {
    /// RAII guard returned by [`UpdateLog::observe`]; dropping it stops emission.
    type Observer: Send + 'static;

    /// Merge a delta or full snapshot produced by any replica.
    fn apply_delta(&self, delta: &[u8]) -> Result<(), DecodeError>;

    /// Full snapshot for bootstrap responses and the durable cache.
    fn full_state(&self) -> Vec<u8>;

    /// Identity of this replica, also used as its awareness key.
    fn client_id(&self) -> u64;

    /// Forward every future change into `sink`, tagged by origin.
    fn observe(&self, sink: mpsc::UnboundedSender<Delta>) -> Result<Self::Observer, DocumentError>;
}

/// Yrs-backed collaborative document.
///
/// Cloning is cheap and yields a handle to the same document, so the
/// session can keep editing while the provider holds its own handle.
///
/// The replica id is the Yrs client id, so awareness records and CRDT
/// items from this client share one key.
#[derive(Clone)]
pub struct SyncDocument {
    doc: Doc,
}

impl SyncDocument {
    /// Fresh document under a random 32-bit client id.
    pub fn new() -> Self {
        Self { doc: Doc::new() }
    }

    /// Fresh document under a fixed client id.
    ///
    /// Two live replicas must never share an id; reuse one only for the
    /// same client across restarts.
    pub fn with_client_id(client_id: u64) -> Self {
        Self {
            doc: Doc::with_client_id(client_id),
        }
    }

    /// Run a local edit. The resulting delta is emitted as [`Delta::Local`].
    pub fn transact_local<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&mut TransactionMut) -> R,
    {
        let mut txn = self.doc.transact_mut();
        f(&mut txn)
    }

    /// Insert text into a named root text type.
    pub fn insert_text(&self, name: &str, index: u32, chunk: &str) {
        self.transact_local(|txn| {
            let text = txn.get_or_insert_text(name);
            text.insert(txn, index, chunk);
        });
    }

    /// Append text to the end of a named root text type.
    pub fn append_text(&self, name: &str, chunk: &str) {
        self.transact_local(|txn| {
            let text = txn.get_or_insert_text(name);
            let len = text.get_string(txn).len() as u32;
            text.insert(txn, len, chunk);
        });
    }

    /// Current contents of a named root text type (empty if absent).
    pub fn text(&self, name: &str) -> String {
        let text = self.doc.get_or_insert_text(name);
        let txn = self.doc.transact();
        text.get_string(&txn)
    }

    /// Per-client logical clocks; equal vectors mean equal sets of updates.
    pub fn state_vector(&self) -> StateVector {
        let txn = self.doc.transact();
        txn.state_vector()
    }
}

impl Default for SyncDocument {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SyncDocument {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncDocument")
            .field("client_id", &self.doc.client_id())
            .field("state_vector", &self.state_vector())
            .finish()
    }
}

impl UpdateLog for SyncDocument {
    type Observer = Subscription;

    fn apply_delta(&self, delta: &[u8]) -> Result<(), DecodeError> {
        check_update_v1(delta).map_err(|e| DecodeError::Update(e.to_string()))?;
        let update = Update::decode_v1(delta).map_err(|e| DecodeError::Update(e.to_string()))?;
        let mut txn = self.doc.transact_mut_with(NETWORK_ORIGIN);
        txn.apply_update(update)
            .map_err(|e| DecodeError::Update(e.to_string()))
    }

    fn full_state(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.encode_state_as_update_v1(&StateVector::default())
    }

    fn client_id(&self) -> u64 {
        self.doc.client_id()
    }

    fn observe(&self, sink: mpsc::UnboundedSender<Delta>) -> Result<Subscription, DocumentError> {
        let network = Origin::from(NETWORK_ORIGIN);
        self.doc
            .observe_update_v1(move |txn, event| {
                let update = event.update.clone();
                let delta = if txn.origin() == Some(&network) {
                    Delta::Remote(update)
                } else {
                    Delta::Local(update)
                };
                // Receiver gone means the provider is shutting down
                let _ = sink.send(delta);
            })
            .map_err(|_| DocumentError::ObserverBusy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(rx: &mut mpsc::UnboundedReceiver<Delta>) -> Vec<Delta> {
        let mut out = Vec::new();
        while let Ok(delta) = rx.try_recv() {
            out.push(delta);
        }
        out
    }

    #[test]
    fn test_local_edit_emits_local_delta() {
        let doc = SyncDocument::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _observer = doc.observe(tx).unwrap();

        doc.insert_text("content", 0, "hello");

        let deltas = drain(&mut rx);
        assert_eq!(deltas.len(), 1);
        assert!(deltas[0].is_local());
        assert!(!deltas[0].bytes().is_empty());
    }

    #[test]
    fn test_applied_delta_emits_remote_delta() {
        let a = SyncDocument::new();
        let b = SyncDocument::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _observer = b.observe(tx).unwrap();

        a.insert_text("content", 0, "from a");
        b.apply_delta(&a.full_state()).unwrap();

        let deltas = drain(&mut rx);
        assert_eq!(deltas.len(), 1);
        assert!(matches!(deltas[0], Delta::Remote(_)));
        assert_eq!(b.text("content"), "from a");
    }

    #[test]
    fn test_dropping_observer_stops_emission() {
        let doc = SyncDocument::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let observer = doc.observe(tx).unwrap();
        drop(observer);

        doc.insert_text("content", 0, "quiet");
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn test_apply_is_idempotent() {
        let a = SyncDocument::new();
        a.insert_text("content", 0, "note");
        let state = a.full_state();

        let b = SyncDocument::new();
        b.apply_delta(&state).unwrap();
        let once = b.text("content");
        let sv_once = b.state_vector();

        b.apply_delta(&state).unwrap();
        assert_eq!(b.text("content"), once);
        assert_eq!(b.state_vector(), sv_once);
    }

    #[test]
    fn test_apply_rejects_garbage() {
        let doc = SyncDocument::new();
        doc.insert_text("content", 0, "intact");

        assert!(doc.apply_delta(&[0xFF, 0x00, 0x13, 0x37]).is_err());
        assert_eq!(doc.text("content"), "intact");
    }

    #[test]
    fn test_text_missing_root_is_empty() {
        let doc = SyncDocument::new();
        assert_eq!(doc.text("nothing-here"), "");
    }

    #[test]
    fn test_append_text() {
        let doc = SyncDocument::new();
        doc.append_text("content", "sticky");
        doc.append_text("content", " note");
        assert_eq!(doc.text("content"), "sticky note");
    }

    #[test]
    fn test_clone_shares_state() {
        let doc = SyncDocument::new();
        let handle = doc.clone();
        handle.insert_text("content", 0, "shared");
        assert_eq!(doc.text("content"), "shared");
        assert_eq!(doc.client_id(), handle.client_id());
    }

    #[test]
    fn test_client_ids() {
        let a = SyncDocument::new();
        let b = SyncDocument::new();
        assert_ne!(a.client_id(), b.client_id());

        let pinned = SyncDocument::with_client_id(42);
        assert_eq!(pinned.client_id(), 42);

        // Items written by the replica carry the same id
        pinned.insert_text("content", 0, "mine");
        assert_eq!(pinned.state_vector().get(&42), 4);
    }

    #[test]
    fn test_apply_rejects_invalid_utf8_text() {
        let source = SyncDocument::new();
        source.insert_text("content", 0, "hello");
        let mut update = source.full_state();
        let at = update.windows(5).position(|w| w == b"hello").unwrap();
        update[at] = 0xFF;

        let doc = SyncDocument::new();
        doc.insert_text("content", 0, "intact");
        let before = doc.state_vector();

        let err = doc.apply_delta(&update).unwrap_err();
        assert!(matches!(err, DecodeError::Update(_)));
        assert_eq!(doc.text("content"), "intact");
        assert_eq!(doc.state_vector(), before);

        // The untouched update still applies
        doc.apply_delta(&source.full_state()).unwrap();
        assert!(doc.text("content").contains("hello"));
    }

    #[test]
    fn test_apply_rejects_oversized_delete_set() {
        let doc = SyncDocument::new();
        // No blocks, then one delete-set client claiming u32::MAX ranges
        let err = doc
            .apply_delta(&[0, 1, 1, 0xFF, 0xFF, 0xFF, 0xFF, 0x0F])
            .unwrap_err();
        assert!(matches!(err, DecodeError::Update(_)));
    }
}
