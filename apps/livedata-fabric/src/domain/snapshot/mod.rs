//! Snapshots and Snapshot Retention
//!
//! A [`Snapshot`] is an immutable capture of the values a provider held at
//! one instant, identified by a [`SnapshotId`]. Ids come from a per-store
//! counter and increase strictly with each capture.
//!
//! [`SnapshotStore`] retains captures until they are released. Retained
//! entries are shared behind `Arc` and never mutated, so any number of
//! readers can query them concurrently; lookups go through a sharded map
//! and never contend with tick ingestion.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use super::market_data::Requirement;

// =============================================================================
// Snapshot Id
// =============================================================================

/// Timestamp token identifying one capture within one provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SnapshotId(u64);

impl SnapshotId {
    /// Wrap a raw id.
    #[must_use]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// The raw id.
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SnapshotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "snapshot-{}", self.0)
    }
}

// =============================================================================
// Snapshot
// =============================================================================

/// Immutable point-in-time association of requirements to values.
#[derive(Debug, Clone)]
pub struct Snapshot {
    id: SnapshotId,
    captured_at: DateTime<Utc>,
    values: HashMap<Requirement, f64>,
}

impl Snapshot {
    /// Create a snapshot.
    #[must_use]
    pub const fn new(
        id: SnapshotId,
        captured_at: DateTime<Utc>,
        values: HashMap<Requirement, f64>,
    ) -> Self {
        Self {
            id,
            captured_at,
            values,
        }
    }

    /// Snapshot id.
    #[must_use]
    pub const fn id(&self) -> SnapshotId {
        self.id
    }

    /// Wall-clock time of the capture.
    #[must_use]
    pub const fn captured_at(&self) -> DateTime<Utc> {
        self.captured_at
    }

    /// Value captured for a requirement, if it had one.
    #[must_use]
    pub fn value(&self, requirement: &Requirement) -> Option<f64> {
        self.values.get(requirement).copied()
    }

    /// Number of requirements with a captured value.
    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether nothing was captured.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

// =============================================================================
// Snapshot Store
// =============================================================================

/// Retention table mapping snapshot ids to immutable payloads.
///
/// Generic over the payload so that a combining layer can retain its own
/// per-constituent id mapping with the same id and release semantics.
#[derive(Debug)]
pub struct SnapshotStore<T> {
    next_id: AtomicU64,
    retained: DashMap<SnapshotId, Arc<T>>,
}

impl<T> Default for SnapshotStore<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> SnapshotStore<T> {
    /// Create an empty store. The first id handed out is 1.
    #[must_use]
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            retained: DashMap::new(),
        }
    }

    /// Allocate a fresh id, build the payload for it and retain it.
    pub fn insert_with(&self, build: impl FnOnce(SnapshotId) -> T) -> SnapshotId {
        let id = SnapshotId(self.next_id.fetch_add(1, Ordering::SeqCst));
        self.retained.insert(id, Arc::new(build(id)));
        id
    }

    /// Retained payload for an id.
    #[must_use]
    pub fn get(&self, id: SnapshotId) -> Option<Arc<T>> {
        self.retained.get(&id).map(|entry| Arc::clone(entry.value()))
    }

    /// Drop retention for an id. Returns the payload if it was retained.
    pub fn release(&self, id: SnapshotId) -> Option<Arc<T>> {
        self.retained.remove(&id).map(|(_, payload)| payload)
    }

    /// Whether an id is currently retained.
    #[must_use]
    pub fn contains(&self, id: SnapshotId) -> bool {
        self.retained.contains_key(&id)
    }

    /// Number of retained entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.retained.len()
    }

    /// Whether nothing is retained.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.retained.is_empty()
    }
}

impl SnapshotStore<Snapshot> {
    /// Value retained for `(id, requirement)`.
    ///
    /// `None` when the id is unknown or released, or the requirement had no
    /// value at capture time.
    #[must_use]
    pub fn value(&self, id: SnapshotId, requirement: &Requirement) -> Option<f64> {
        self.get(id)?.value(requirement)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;
    use crate::domain::market_data::ExternalId;

    fn req(value: &str) -> Requirement {
        Requirement::market_value(ExternalId::of("TICKER", value))
    }

    fn capture(store: &SnapshotStore<Snapshot>, values: &[(&str, f64)]) -> SnapshotId {
        let values = values.iter().map(|(k, v)| (req(k), *v)).collect();
        store.insert_with(|id| Snapshot::new(id, Utc::now(), values))
    }

    #[test]
    fn ids_increase_monotonically() {
        let store = SnapshotStore::<Snapshot>::new();

        let first = capture(&store, &[]);
        let second = capture(&store, &[]);

        assert_eq!(first, SnapshotId::new(1));
        assert!(second > first);
    }

    #[test]
    fn query_returns_captured_value() {
        let store = SnapshotStore::new();
        let id = capture(&store, &[("AAPL", 150.0)]);

        assert_eq!(store.value(id, &req("AAPL")), Some(150.0));
        assert_eq!(store.value(id, &req("MSFT")), None);
    }

    #[test]
    fn unknown_and_released_ids_yield_none() {
        let store = SnapshotStore::new();
        let id = capture(&store, &[("AAPL", 150.0)]);

        assert_eq!(store.value(SnapshotId::new(999), &req("AAPL")), None);

        assert!(store.release(id).is_some());
        assert_eq!(store.value(id, &req("AAPL")), None);
        // Idempotent.
        assert!(store.release(id).is_none());
        assert!(store.is_empty());
    }

    #[test]
    fn released_payload_stays_readable_by_existing_holders() {
        let store = SnapshotStore::new();
        let id = capture(&store, &[("AAPL", 1.0)]);

        let held = store.get(id).unwrap();
        store.release(id);

        assert_eq!(held.value(&req("AAPL")), Some(1.0));
        assert_eq!(held.id(), id);
    }

    #[test]
    fn generic_payloads() {
        let store = SnapshotStore::<Vec<SnapshotId>>::new();
        let id = store.insert_with(|_| vec![SnapshotId::new(7), SnapshotId::new(3)]);

        assert_eq!(
            store.get(id).as_deref(),
            Some(&vec![SnapshotId::new(7), SnapshotId::new(3)])
        );
    }

    #[test]
    fn concurrent_captures_get_distinct_ids() {
        let store = Arc::new(SnapshotStore::<Snapshot>::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = Arc::clone(&store);
                thread::spawn(move || (0..50).map(|_| capture(&store, &[])).collect::<Vec<_>>())
            })
            .collect();

        let mut ids: Vec<_> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        ids.sort();
        ids.dedup();

        assert_eq!(ids.len(), 400);
        assert_eq!(store.len(), 400);
    }
}
