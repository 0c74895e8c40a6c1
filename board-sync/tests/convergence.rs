//! Property tests: replicas converge no matter how updates are delivered.

use board_sync::{Delta, SyncDocument, UpdateLog};
use proptest::prelude::*;
use tokio::sync::mpsc;
use yrs::{Text, WriteTxn};

const REPLICAS: usize = 3;

#[derive(Debug, Clone)]
enum Edit {
    Insert { pos: u32, chunk: String },
    Delete { pos: u32, len: u32 },
}

fn arb_edit() -> impl Strategy<Value = (usize, Edit)> {
    let insert = (any::<u32>(), "[a-z]{1,4}").prop_map(|(pos, chunk)| Edit::Insert { pos, chunk });
    let delete = (any::<u32>(), 1u32..4).prop_map(|(pos, len)| Edit::Delete { pos, len });
    (0..REPLICAS, prop_oneof![3 => insert, 1 => delete])
}

fn apply_edit(doc: &SyncDocument, edit: &Edit) {
    doc.transact_local(|txn| {
        let text = txn.get_or_insert_text("content");
        let len = text.len(txn);
        match edit {
            Edit::Insert { pos, chunk } => text.insert(txn, pos % (len + 1), chunk),
            Edit::Delete { pos, len: n } if len > 0 => {
                let start = pos % len;
                text.remove_range(txn, start, (*n).min(len - start));
            }
            Edit::Delete { .. } => {}
        }
    });
}

struct Replica {
    doc: SyncDocument,
    deltas: mpsc::UnboundedReceiver<Delta>,
    _observer: <SyncDocument as UpdateLog>::Observer,
}

impl Replica {
    fn new() -> Self {
        let doc = SyncDocument::new();
        let (tx, deltas) = mpsc::unbounded_channel();
        let observer = doc.observe(tx).unwrap();
        Self {
            doc,
            deltas,
            _observer: observer,
        }
    }

    /// Local deltas produced since the last call.
    fn drain_local(&mut self) -> Vec<Vec<u8>> {
        let mut out = Vec::new();
        while let Ok(delta) = self.deltas.try_recv() {
            if delta.is_local() {
                out.push(delta.into_bytes());
            }
        }
        out
    }
}

proptest! {
    /// Any subset of deliveries, in any order and with repeats, followed by
    /// eventual full delivery, leaves every replica with identical state.
    #[test]
    fn prop_replicas_converge(
        edits in prop::collection::vec(arb_edit(), 1..40),
        early in prop::collection::vec((0..REPLICAS, any::<prop::sample::Index>()), 0..60),
    ) {
        let mut replicas: Vec<Replica> = (0..REPLICAS).map(|_| Replica::new()).collect();
        let mut updates: Vec<Vec<u8>> = Vec::new();

        for (who, edit) in &edits {
            apply_edit(&replicas[*who].doc, edit);
            updates.extend(replicas[*who].drain_local());
        }

        if !updates.is_empty() {
            for (to, pick) in &early {
                let update = &updates[pick.index(updates.len())];
                prop_assert!(replicas[*to].doc.apply_delta(update).is_ok());
            }
        }

        for replica in &replicas {
            for update in updates.iter().rev() {
                prop_assert!(replica.doc.apply_delta(update).is_ok());
            }
        }

        let first = &replicas[0].doc;
        for replica in &replicas[1..] {
            prop_assert_eq!(replica.doc.state_vector(), first.state_vector());
            prop_assert_eq!(replica.doc.text("content"), first.text("content"));
        }

        // Delivering remote updates never produces new local deltas
        for replica in &mut replicas {
            prop_assert!(replica.drain_local().is_empty());
        }
    }

    /// Full-state snapshots merge like any other update.
    #[test]
    fn prop_snapshot_exchange_converges(
        edits in prop::collection::vec(arb_edit(), 1..30),
    ) {
        let replicas: Vec<SyncDocument> = (0..REPLICAS).map(|_| SyncDocument::new()).collect();
        for (who, edit) in &edits {
            apply_edit(&replicas[*who], edit);
        }

        let snapshots: Vec<Vec<u8>> = replicas.iter().map(|d| d.full_state()).collect();
        for doc in &replicas {
            for snapshot in &snapshots {
                prop_assert!(doc.apply_delta(snapshot).is_ok());
            }
        }

        let first = &replicas[0];
        for doc in &replicas[1..] {
            prop_assert_eq!(doc.state_vector(), first.state_vector());
            prop_assert_eq!(doc.text("content"), first.text("content"));
        }

        // Applying everything again is a no-op
        let before = first.state_vector();
        for snapshot in &snapshots {
            prop_assert!(first.apply_delta(snapshot).is_ok());
        }
        prop_assert_eq!(first.state_vector(), before);
    }
}
