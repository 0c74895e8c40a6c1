//! Awareness table: ephemeral per-client presence with LWW clocks.
//!
//! Every client owns exactly one record (cursor, name, color, whatever the
//! application puts in its JSON state). Records travel on the broadcast
//! channel as [`AwarenessEntry`] lists and are merged here.
//!
//! ```text
//! set_local(state)            apply_entries(remote)
//!       │ clock += 1                │ accept iff clock > known
//!       ▼                           ▼
//!   ┌──────────── AwarenessTable ────────────┐
//!   │  states: client → (JSON, clock, seen)  │
//!   │  clocks: client → highest clock seen   │
//!   └──────────────────┬─────────────────────┘
//!                      ▼
//!      AwarenessChange { added, updated, removed }
//! ```
//!
//! Clocks of removed clients are remembered so a late, older entry can
//! never resurrect them. The local record is never evicted; instead it is
//! renewed at half the timeout so peers keep it alive.

use serde_json::Value;
use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::protocol::{AwarenessEntry, DecodeError};

/// Awareness key of a replica.
pub type ClientId = u64;

/// The latest known state of one client.
#[derive(Debug, Clone, PartialEq)]
pub struct AwarenessRecord {
    pub state: Value,
    pub clock: u64,
    pub last_updated: Instant,
}

/// Client ids touched by one mutation of the table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AwarenessChange {
    pub added: Vec<ClientId>,
    pub updated: Vec<ClientId>,
    pub removed: Vec<ClientId>,
}

impl AwarenessChange {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }

    /// Every touched id, in added, updated, removed order.
    pub fn changed(&self) -> Vec<ClientId> {
        self.added
            .iter()
            .chain(&self.updated)
            .chain(&self.removed)
            .copied()
            .collect()
    }
}

/// Outcome of merging one remote entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Merge {
    Added,
    Updated,
    Removed,
    /// Accepted (newer clock) but nothing to report, e.g. removal of an unknown client.
    Silent,
}

/// All awareness records known to one provider.
#[derive(Debug)]
pub struct AwarenessTable {
    local_id: ClientId,
    states: HashMap<ClientId, AwarenessRecord>,
    /// Highest clock ever accepted per client, including removed ones.
    clocks: HashMap<ClientId, u64>,
}

impl AwarenessTable {
    pub fn new(local_id: ClientId) -> Self {
        Self {
            local_id,
            states: HashMap::new(),
            clocks: HashMap::new(),
        }
    }

    pub fn local_id(&self) -> ClientId {
        self.local_id
    }

    fn clock_of(&self, client_id: ClientId) -> u64 {
        self.clocks.get(&client_id).copied().unwrap_or(0)
    }

    // ───────────────────────────────────────────────────────────────
    // Local record
    // ───────────────────────────────────────────────────────────────

    /// Replace the local state, bumping its clock.
    pub fn set_local(&mut self, state: Value) -> AwarenessChange {
        let clock = self.clock_of(self.local_id) + 1;
        self.clocks.insert(self.local_id, clock);
        let previous = self.states.insert(
            self.local_id,
            AwarenessRecord {
                state,
                clock,
                last_updated: Instant::now(),
            },
        );

        let mut change = AwarenessChange::default();
        if previous.is_some() {
            change.updated.push(self.local_id);
        } else {
            change.added.push(self.local_id);
        }
        change
    }

    /// Drop the local state. The bumped clock makes the removal win on peers.
    pub fn clear_local(&mut self) -> AwarenessChange {
        let mut change = AwarenessChange::default();
        if self.states.remove(&self.local_id).is_some() {
            let clock = self.clock_of(self.local_id) + 1;
            self.clocks.insert(self.local_id, clock);
            change.removed.push(self.local_id);
        }
        change
    }

    pub fn local_state(&self) -> Option<&Value> {
        self.states.get(&self.local_id).map(|r| &r.state)
    }

    pub fn local_clock(&self) -> u64 {
        self.clock_of(self.local_id)
    }

    /// True when the local record is older than half the timeout.
    pub fn local_needs_renewal(&self, now: Instant, timeout: Duration) -> bool {
        self.states
            .get(&self.local_id)
            .map(|r| now.saturating_duration_since(r.last_updated) >= timeout / 2)
            .unwrap_or(false)
    }

    /// Re-stamp the local record with a new clock without changing its state.
    ///
    /// Returns false when there is no local record to renew.
    pub fn renew_local(&mut self, now: Instant) -> bool {
        let clock = self.clock_of(self.local_id) + 1;
        match self.states.get_mut(&self.local_id) {
            Some(record) => {
                record.clock = clock;
                record.last_updated = now;
                self.clocks.insert(self.local_id, clock);
                true
            }
            None => false,
        }
    }

    // ───────────────────────────────────────────────────────────────
    // Remote records
    // ───────────────────────────────────────────────────────────────

    /// Merge one remote record. Returns true if the table changed.
    ///
    /// `state == None` removes the client. Only a strictly greater clock
    /// is accepted, and records about our own id are ignored.
    pub fn apply_remote(&mut self, client_id: ClientId, state: Option<Value>, clock: u64) -> bool {
        matches!(
            self.merge_remote(client_id, state, clock, Instant::now()),
            Some(Merge::Added | Merge::Updated | Merge::Removed)
        )
    }

    fn merge_remote(
        &mut self,
        client_id: ClientId,
        state: Option<Value>,
        clock: u64,
        now: Instant,
    ) -> Option<Merge> {
        if client_id == self.local_id || clock <= self.clock_of(client_id) {
            return None;
        }
        self.clocks.insert(client_id, clock);

        match state {
            Some(state) => {
                let previous = self.states.insert(
                    client_id,
                    AwarenessRecord {
                        state,
                        clock,
                        last_updated: now,
                    },
                );
                Some(if previous.is_some() {
                    Merge::Updated
                } else {
                    Merge::Added
                })
            }
            None => Some(if self.states.remove(&client_id).is_some() {
                Merge::Removed
            } else {
                Merge::Silent
            }),
        }
    }

    /// Merge a decoded awareness payload.
    ///
    /// An entry whose state is not valid JSON is skipped on its own; the
    /// rest of the batch still applies.
    pub fn apply_entries(&mut self, entries: &[AwarenessEntry]) -> AwarenessChange {
        let now = Instant::now();
        let mut change = AwarenessChange::default();

        for entry in entries {
            let state = match entry.state.as_deref().map(parse_state).transpose() {
                Ok(state) => state,
                Err(reason) => {
                    let err = DecodeError::AwarenessState {
                        client_id: entry.client_id,
                        reason,
                    };
                    log::warn!("Dropping awareness entry: {}", err);
                    continue;
                }
            };

            let id = entry.client_id;
            match self.merge_remote(id, state, entry.clock, now) {
                Some(Merge::Added) => change.added.push(id),
                Some(Merge::Updated) => change.updated.push(id),
                Some(Merge::Removed) => change.removed.push(id),
                Some(Merge::Silent) | None => {}
            }
        }

        change
    }

    /// Remove remote records not refreshed within `timeout`. Returns removed ids.
    pub fn evict_stale(&mut self, now: Instant, timeout: Duration) -> Vec<ClientId> {
        let local_id = self.local_id;
        let stale: Vec<ClientId> = self
            .states
            .iter()
            .filter(|(id, r)| {
                **id != local_id && now.saturating_duration_since(r.last_updated) >= timeout
            })
            .map(|(id, _)| *id)
            .collect();

        for id in &stale {
            self.states.remove(id);
        }
        stale
    }

    // ───────────────────────────────────────────────────────────────
    // Queries
    // ───────────────────────────────────────────────────────────────

    /// Wire entries for the given ids. Ids without a live record are sent
    /// as removals carrying their last clock.
    pub fn entries_for(&self, ids: &[ClientId]) -> Vec<AwarenessEntry> {
        ids.iter()
            .map(|id| AwarenessEntry {
                client_id: *id,
                clock: self.clock_of(*id),
                state: self.states.get(id).map(|r| r.state.to_string()),
            })
            .collect()
    }

    pub fn get(&self, client_id: ClientId) -> Option<&AwarenessRecord> {
        self.states.get(&client_id)
    }

    /// Snapshot of every live state, local one included.
    pub fn states(&self) -> HashMap<ClientId, Value> {
        self.states
            .iter()
            .map(|(id, r)| (*id, r.state.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}

fn parse_state(text: &str) -> Result<Value, String> {
    serde_json::from_str(text).map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const LOCAL: ClientId = 1;
    const PEER: ClientId = 2;

    fn entry(client_id: ClientId, clock: u64, state: Option<Value>) -> AwarenessEntry {
        AwarenessEntry {
            client_id,
            clock,
            state: state.map(|s| s.to_string()),
        }
    }

    // ── Local record ─────────────────────────────────────────────

    #[test]
    fn test_set_local_bumps_clock() {
        let mut table = AwarenessTable::new(LOCAL);

        let first = table.set_local(json!({"name": "Alice"}));
        assert_eq!(first.added, vec![LOCAL]);
        assert_eq!(table.local_clock(), 1);

        let second = table.set_local(json!({"name": "Alice", "cursor": {"x": 4, "y": 2}}));
        assert_eq!(second.updated, vec![LOCAL]);
        assert_eq!(table.local_clock(), 2);
        assert_eq!(table.local_state().unwrap()["cursor"]["x"], 4);
    }

    #[test]
    fn test_clear_local_emits_removal_with_higher_clock() {
        let mut table = AwarenessTable::new(LOCAL);
        table.set_local(json!({"name": "Alice"}));

        let change = table.clear_local();
        assert_eq!(change.removed, vec![LOCAL]);
        assert_eq!(table.local_clock(), 2);

        let wire = table.entries_for(&[LOCAL]);
        assert_eq!(wire, vec![entry(LOCAL, 2, None)]);

        // Nothing left to clear
        assert!(table.clear_local().is_empty());
    }

    #[test]
    fn test_renewal_after_half_timeout() {
        let mut table = AwarenessTable::new(LOCAL);
        let timeout = Duration::from_secs(30);
        assert!(!table.local_needs_renewal(Instant::now(), timeout));

        table.set_local(json!({"name": "Alice"}));
        let now = Instant::now();
        assert!(!table.local_needs_renewal(now, timeout));
        assert!(table.local_needs_renewal(now + Duration::from_secs(16), timeout));

        assert!(table.renew_local(now + Duration::from_secs(16)));
        assert_eq!(table.local_clock(), 2);
        assert!(!table.local_needs_renewal(now + Duration::from_secs(20), timeout));
    }

    #[test]
    fn test_renew_without_local_record() {
        let mut table = AwarenessTable::new(LOCAL);
        assert!(!table.renew_local(Instant::now()));
        assert_eq!(table.local_clock(), 0);
    }

    // ── Remote records ───────────────────────────────────────────

    #[test]
    fn test_remote_lww_strictly_greater() {
        let mut table = AwarenessTable::new(LOCAL);

        assert!(table.apply_remote(PEER, Some(json!({"name": "Bob"})), 5));
        // Same clock loses
        assert!(!table.apply_remote(PEER, Some(json!({"name": "Mallory"})), 5));
        // Older clock loses
        assert!(!table.apply_remote(PEER, Some(json!({"name": "Eve"})), 3));
        assert_eq!(table.get(PEER).unwrap().state["name"], "Bob");

        assert!(table.apply_remote(PEER, Some(json!({"name": "Bobby"})), 6));
        assert_eq!(table.get(PEER).unwrap().clock, 6);
    }

    #[test]
    fn test_remote_removal() {
        let mut table = AwarenessTable::new(LOCAL);
        table.apply_remote(PEER, Some(json!({"name": "Bob"})), 1);

        assert!(table.apply_remote(PEER, None, 2));
        assert!(table.get(PEER).is_none());

        // A delayed older record must not resurrect the client
        assert!(!table.apply_remote(PEER, Some(json!({"name": "Bob"})), 1));
        assert!(table.get(PEER).is_none());
    }

    #[test]
    fn test_own_id_ignored() {
        let mut table = AwarenessTable::new(LOCAL);
        table.set_local(json!({"name": "Alice"}));

        assert!(!table.apply_remote(LOCAL, None, 100));
        assert!(table.local_state().is_some());
        assert_eq!(table.local_clock(), 1);
    }

    #[test]
    fn test_apply_entries_reports_change_set() {
        let mut table = AwarenessTable::new(LOCAL);
        table.apply_remote(3, Some(json!({"name": "Carol"})), 1);
        table.apply_remote(4, Some(json!({"name": "Dave"})), 1);

        let change = table.apply_entries(&[
            entry(PEER, 1, Some(json!({"name": "Bob"}))),
            entry(3, 2, Some(json!({"name": "Carol", "cursor": {"x": 1, "y": 1}}))),
            entry(4, 2, None),
            entry(5, 1, None),
            entry(LOCAL, 9, Some(json!({"name": "spoof"}))),
        ]);

        assert_eq!(change.added, vec![PEER]);
        assert_eq!(change.updated, vec![3]);
        assert_eq!(change.removed, vec![4]);
        assert_eq!(change.changed(), vec![PEER, 3, 4]);
        assert!(table.local_state().is_none());
    }

    #[test]
    fn test_apply_entries_skips_bad_json() {
        let mut table = AwarenessTable::new(LOCAL);
        let bad = AwarenessEntry {
            client_id: PEER,
            clock: 1,
            state: Some("{not json".into()),
        };

        let change = table.apply_entries(&[bad, entry(3, 1, Some(json!({"name": "Carol"})))]);
        assert_eq!(change.added, vec![3]);
        assert!(table.get(PEER).is_none());
    }

    // ── Eviction ─────────────────────────────────────────────────

    #[test]
    fn test_evict_stale_keeps_local() {
        let mut table = AwarenessTable::new(LOCAL);
        let timeout = Duration::from_secs(30);
        table.set_local(json!({"name": "Alice"}));
        table.apply_remote(PEER, Some(json!({"name": "Bob"})), 1);

        assert!(table.evict_stale(Instant::now(), timeout).is_empty());

        let later = Instant::now() + Duration::from_secs(31);
        assert_eq!(table.evict_stale(later, timeout), vec![PEER]);
        assert!(table.get(PEER).is_none());
        assert!(table.local_state().is_some());
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_evicted_client_returns_with_newer_clock() {
        let mut table = AwarenessTable::new(LOCAL);
        table.apply_remote(PEER, Some(json!({"name": "Bob"})), 4);
        table.evict_stale(Instant::now() + Duration::from_secs(60), Duration::from_secs(30));

        assert!(!table.apply_remote(PEER, Some(json!({"name": "Bob"})), 4));
        assert!(table.apply_remote(PEER, Some(json!({"name": "Bob"})), 5));
    }

    // ── Wire entries ─────────────────────────────────────────────

    #[test]
    fn test_entries_for_serializes_json() {
        let mut table = AwarenessTable::new(LOCAL);
        table.set_local(json!({"name": "Alice"}));

        let entries = table.entries_for(&[LOCAL]);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].clock, 1);
        let state: Value = serde_json::from_str(entries[0].state.as_deref().unwrap()).unwrap();
        assert_eq!(state, json!({"name": "Alice"}));
    }
}
