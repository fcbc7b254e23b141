//! The frozen master grid and the copy-on-write working grid used to plan a
//! rebalance without mutating the master.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use crate::order::{Order, OrderIndices, SlotId};

/// An immutable, versioned snapshot of the grid. Every master mutation
/// produces a new snapshot and swaps the whole `Arc` in one step — there is
/// no in-place field mutation on a live snapshot.
#[derive(Debug, Clone)]
pub struct MasterSnapshot {
    pub orders: BTreeMap<SlotId, Order>,
    pub indices: OrderIndices,
    pub boundary_idx: usize,
    pub version: u64,
}

impl MasterSnapshot {
    pub fn empty() -> Self {
        Self {
            orders: BTreeMap::new(),
            indices: OrderIndices::default(),
            boundary_idx: 0,
            version: 0,
        }
    }

    /// Slot ids sorted by ascending price — the "master rail". `SlotId` order is a creation-time handle,
    /// not a price order, so this always re-sorts by price rather than by
    /// map iteration order.
    pub fn rail(&self) -> Vec<SlotId> {
        let mut slots: Vec<SlotId> = self.orders.keys().copied().collect();
        slots.sort_by(|a, b| self.orders[a].price.cmp(&self.orders[b].price));
        slots
    }
}

/// Holds the current master snapshot behind a `parking_lot::RwLock`. Reads
/// (`load`) are a lock-free-fast `Arc` clone; the actual serialize-with-other-
/// mutators discipline lives in the manager's async `grid_lock` — this type
/// only provides the atomic swap-the-whole-bundle primitive for the
/// persistent map overlaid on a shared `Arc`'d master.
#[derive(Debug)]
pub struct MasterGrid {
    current: RwLock<Arc<MasterSnapshot>>,
}

impl MasterGrid {
    pub fn new(snapshot: MasterSnapshot) -> Self {
        Self { current: RwLock::new(Arc::new(snapshot)) }
    }

    pub fn load(&self) -> Arc<MasterSnapshot> {
        self.current.read().clone()
    }

    pub fn version(&self) -> u64 {
        self.current.read().version
    }

    /// Installs a new snapshot. Callers must hold the manager's `grid_lock`
    /// before calling this — it is not itself reentrant-safe across
    /// concurrent mutators, only atomic with respect to readers.
    pub fn swap(&self, snapshot: MasterSnapshot) {
        debug!(version = snapshot.version, orders = snapshot.orders.len(), "master grid swapped");
        *self.current.write() = Arc::new(snapshot);
    }
}

/// A mutable clone of the master used to plan a rebalance. Reads fall
/// through to nothing extra (the clone already contains every slot); writes
/// mutate the local map directly, and `build_delta` computes what changed
/// relative to the master at commit time.
#[derive(Debug, Clone)]
pub struct WorkingGrid {
    pub base_version: u64,
    orders: BTreeMap<SlotId, Order>,
    stale: Arc<AtomicBool>,
    stale_reason: Arc<RwLock<Option<String>>>,
}

impl WorkingGrid {
    /// Clones `master`'s orders with `base_version` pinned to its current
    /// version.
    pub fn clone_from(master: &MasterSnapshot) -> Self {
        Self {
            base_version: master.version,
            orders: master.orders.clone(),
            stale: Arc::new(AtomicBool::new(false)),
            stale_reason: Arc::new(RwLock::new(None)),
        }
    }

    pub fn get(&self, slot_id: SlotId) -> Option<&Order> {
        self.orders.get(&slot_id)
    }

    pub fn set(&mut self, order: Order) {
        self.orders.insert(order.slot_id, order);
    }

    pub fn delete(&mut self, slot_id: SlotId) {
        self.orders.remove(&slot_id);
    }

    pub fn entries(&self) -> impl Iterator<Item = (&SlotId, &Order)> {
        self.orders.iter()
    }

    pub fn to_map(&self) -> BTreeMap<SlotId, Order> {
        self.orders.clone()
    }

    pub fn get_indexes(&self) -> OrderIndices {
        OrderIndices::repair(&self.orders)
    }

    /// A handle other tasks can clone to mark this working grid stale from
    /// outside the task that owns it (a concurrent master mutation while
    /// this working copy is mid-rebalance or mid-broadcast).
    pub fn staleness_handle(&self) -> StalenessHandle {
        StalenessHandle { stale: self.stale.clone(), reason: self.stale_reason.clone() }
    }

    /// Applies a master update for a single slot into this working copy so
    /// the next planning cycle starts from a correct baseline, even though
    /// this working grid itself is (or is about to be) marked stale.
    pub fn sync_from_master(&mut self, master: &MasterSnapshot, slot_id: SlotId, version: u64) {
        match master.orders.get(&slot_id) {
            Some(order) => {
                self.orders.insert(slot_id, order.clone());
            }
            None => {
                self.orders.remove(&slot_id);
            }
        }
        self.base_version = version;
    }

    pub fn mark_stale(&self, reason: impl Into<String>) {
        self.stale.store(true, Ordering::SeqCst);
        *self.stale_reason.write() = Some(reason.into());
    }

    pub fn is_stale(&self) -> bool {
        self.stale.load(Ordering::SeqCst)
    }

    pub fn stale_reason(&self) -> Option<String> {
        self.stale_reason.read().clone()
    }

    /// True once either this grid was explicitly marked stale, or the
    /// master has moved past `base_version`.
    pub fn is_stale_against(&self, master: &MasterGrid) -> bool {
        self.is_stale() || master.version() != self.base_version
    }

    /// The slots that differ between this working copy and `master`
    /// (insertions, updates, and deletions all surface as `Some(order)` /
    /// `None` pairs keyed by slot).
    pub fn build_delta(&self, master: &MasterSnapshot) -> BTreeMap<SlotId, Option<Order>> {
        let mut delta = BTreeMap::new();
        for (slot_id, order) in &self.orders {
            match master.orders.get(slot_id) {
                Some(existing) if existing == order => {}
                _ => {
                    delta.insert(*slot_id, Some(order.clone()));
                }
            }
        }
        for slot_id in master.orders.keys() {
            if !self.orders.contains_key(slot_id) {
                delta.insert(*slot_id, None);
            }
        }
        delta
    }

    pub fn memory_stats(&self) -> WorkingGridMemoryStats {
        WorkingGridMemoryStats {
            slot_count: self.orders.len(),
            approx_bytes: self.orders.len() * std::mem::size_of::<Order>(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkingGridMemoryStats {
    pub slot_count: usize,
    pub approx_bytes: usize,
}

/// A cloneable, `Send + Sync` handle used to mark a working grid stale from
/// a task other than the one planning the rebalance.
#[derive(Debug, Clone)]
pub struct StalenessHandle {
    stale: Arc<AtomicBool>,
    reason: Arc<RwLock<Option<String>>>,
}

impl StalenessHandle {
    pub fn mark(&self, reason: impl Into<String>) {
        self.stale.store(true, Ordering::SeqCst);
        *self.reason.write() = Some(reason.into());
    }
}

/// Monotone version counter shared by [`MasterGrid`]; split out so the
/// manager can hand out a version without taking the grid's read lock.
#[derive(Debug, Default)]
pub struct VersionCounter(AtomicU64);

impl VersionCounter {
    pub fn next(&self) -> u64 {
        self.0.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn current(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn zero_sized_for(state: crate::order::OrderState) -> rust_decimal::Decimal {
        match state {
            crate::order::OrderState::Virtual => dec!(0),
            _ => dec!(1.0),
        }
    }

    fn order(id: u64, kind: crate::order::OrderKind, state: crate::order::OrderState) -> Order {
        Order {
            slot_id: SlotId(id),
            price: dec!(1.0),
            kind,
            state,
            size: zero_sized_for(state),
            chain_order_id: None,
            committed_side: None,
            raw_on_chain: None,
        }
    }

    #[test]
    fn working_grid_delta_reflects_local_edits() {
        let mut master = MasterSnapshot::empty();
        master.orders.insert(SlotId(1), order(1, crate::order::OrderKind::Buy, crate::order::OrderState::Virtual));
        master.version = 1;

        let mut working = WorkingGrid::clone_from(&master);
        working.set(order(1, crate::order::OrderKind::Buy, crate::order::OrderState::Active));
        working.set(order(2, crate::order::OrderKind::Sell, crate::order::OrderState::Virtual));

        let delta = working.build_delta(&master);
        assert_eq!(delta.len(), 2);
        assert!(delta.get(&SlotId(1)).unwrap().is_some());
        assert!(delta.get(&SlotId(2)).unwrap().is_some());
    }

    #[test]
    fn staleness_handle_marks_from_outside() {
        let master = MasterSnapshot::empty();
        let working = WorkingGrid::clone_from(&master);
        let handle = working.staleness_handle();
        assert!(!working.is_stale());
        handle.mark("concurrent fill");
        assert!(working.is_stale());
        assert_eq!(working.stale_reason().as_deref(), Some("concurrent fill"));
    }

    #[test]
    fn stale_against_detects_version_bump() {
        let mut master_snap = MasterSnapshot::empty();
        master_snap.version = 5;
        let working = WorkingGrid::clone_from(&master_snap);
        let grid = MasterGrid::new(master_snap);
        assert!(!working.is_stale_against(&grid));

        let mut bumped = MasterSnapshot::empty();
        bumped.version = 6;
        grid.swap(bumped);
        assert!(working.is_stale_against(&grid));
    }
}
