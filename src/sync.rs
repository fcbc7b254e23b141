//! Blockchain reconciliation: two-pass open-orders sync, incremental
//! fill-history sync, and lease-based shadow locks.

use std::collections::{BTreeMap, BTreeSet};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use rust_decimal::Decimal;
use tracing::warn;

use crate::order::{ChainOrderId, Order, OrderKind, OrderState, Side, SlotId};
use crate::primitives::chain_sizes_equal;

/// A chain order record already filtered to the configured market pair and
/// parsed into engine-native types.
#[derive(Debug, Clone)]
pub struct ParsedChainOrder {
    pub chain_order_id: ChainOrderId,
    pub side: Side,
    pub price: Decimal,
    pub size: Decimal,
}

/// Per-order price tolerance; `None` is treated as zero tolerance (exact
/// match required).
pub fn calculate_price_tolerance(increment_percent: Decimal, price: Decimal) -> Option<Decimal> {
    if increment_percent <= Decimal::ZERO {
        return None;
    }
    Some(price * increment_percent / Decimal::ONE_HUNDRED / Decimal::from(2))
}

#[derive(Debug, Default)]
pub struct OpenOrdersSyncResult {
    pub slot_updates: BTreeMap<SlotId, Order>,
    pub orders_needing_price_correction: BTreeSet<SlotId>,
    pub surplus_cancellations: Vec<ChainOrderId>,
    pub filled_slots: Vec<SlotId>,
}

/// Runs the two-pass open-orders reconciliation. Returns
/// the set of slot updates to apply to a working grid plus the signals
/// (price corrections, fills, stale-cancel candidates) orchestration needs.
pub fn sync_from_open_orders(
    grid: &BTreeMap<SlotId, Order>,
    chain_orders: &[ParsedChainOrder],
    asset_precision_for_side: impl Fn(Side) -> u32,
    ideal_size_for_slot: impl Fn(SlotId) -> Decimal,
    increment_percent: Decimal,
) -> OpenOrdersSyncResult {
    let mut result = OpenOrdersSyncResult::default();
    let chain_by_id: BTreeMap<&ChainOrderId, &ParsedChainOrder> =
        chain_orders.iter().map(|o| (&o.chain_order_id, o)).collect();

    let mut claimed_chain_ids: BTreeSet<ChainOrderId> = BTreeSet::new();

    // Pass 1: grid -> chain.
    for (slot_id, order) in grid {
        let Some(chain_id) = &order.chain_order_id else { continue };
        let Some(chain_order) = chain_by_id.get(chain_id).copied() else { continue };
        claimed_chain_ids.insert(chain_id.clone());

        let grid_side = match order.kind {
            OrderKind::Buy => Some(Side::Buy),
            OrderKind::Sell => Some(Side::Sell),
            OrderKind::Spread => order.committed_side,
        };

        if grid_side != Some(chain_order.side) {
            result.surplus_cancellations.push(chain_id.clone());
            continue;
        }

        let tolerance = calculate_price_tolerance(increment_percent, order.price).unwrap_or(Decimal::ZERO);
        if (order.price - chain_order.price).abs() > tolerance {
            result.orders_needing_price_correction.insert(*slot_id);
        }

        let precision = asset_precision_for_side(chain_order.side);
        let sizes_equal = chain_sizes_equal(order.size, chain_order.size, precision).unwrap_or(false);

        if !sizes_equal {
            if chain_order.size > Decimal::ZERO && chain_order.size < order.size {
                let mut updated = order.clone();
                updated.state = OrderState::Partial;
                updated.size = chain_order.size;
                result.slot_updates.insert(*slot_id, updated);
            } else if chain_order.size == Decimal::ZERO {
                let mut updated = order.clone();
                updated.kind = OrderKind::Spread;
                updated.state = OrderState::Virtual;
                updated.size = Decimal::ZERO;
                updated.chain_order_id = None;
                result.slot_updates.insert(*slot_id, updated);
                result.filled_slots.push(*slot_id);
            }
        }
    }

    // Phantoms / disappeared orders: ACTIVE/PARTIAL slots whose chain id no
    // longer appears in the snapshot. Only those that previously carried a
    // chain id count as filled.
    for (slot_id, order) in grid {
        if !order.is_on_chain() {
            continue;
        }
        let still_present = order.chain_order_id.as_ref().map(|id| chain_by_id.contains_key(id)).unwrap_or(false);
        if !still_present {
            let had_chain_id = order.chain_order_id.is_some();
            let mut updated = order.clone();
            updated.kind = OrderKind::Spread;
            updated.state = OrderState::Virtual;
            updated.size = Decimal::ZERO;
            updated.chain_order_id = None;
            result.slot_updates.insert(*slot_id, updated);
            if had_chain_id {
                result.filled_slots.push(*slot_id);
            }
        }
    }

    // Pass 2: chain -> grid, for every chain order not claimed above.
    let mut claimed_slots: BTreeSet<SlotId> = result.slot_updates.keys().copied().collect();
    for chain_order in chain_orders {
        if claimed_chain_ids.contains(&chain_order.chain_order_id) {
            continue;
        }

        let strict_match = grid.iter().find(|(slot_id, order)| {
            !claimed_slots.contains(*slot_id)
                && order.chain_order_id.is_none()
                && side_of(order) == Some(chain_order.side)
                && (order.price - chain_order.price).abs()
                    <= calculate_price_tolerance(increment_percent, order.price).unwrap_or(Decimal::ZERO)
        });

        let matched = strict_match.or_else(|| {
            let relaxed_tolerance = (increment_percent * Decimal::from(2) / Decimal::ONE_HUNDRED * chain_order.price)
                .max(chain_order.price * Decimal::from(2) / Decimal::ONE_HUNDRED);
            grid.iter().find(|(slot_id, order)| {
                !claimed_slots.contains(*slot_id)
                    && order.state == OrderState::Virtual
                    && order.chain_order_id.is_none()
                    && side_of(order) == Some(chain_order.side)
                    && (order.price - chain_order.price).abs() <= relaxed_tolerance
            })
        });

        if let Some((slot_id, order)) = matched {
            claimed_slots.insert(*slot_id);
            let ideal = ideal_size_for_slot(*slot_id);
            let mut updated = order.clone();
            updated.chain_order_id = Some(chain_order.chain_order_id.clone());
            updated.kind = if chain_order.side == Side::Buy { OrderKind::Buy } else { OrderKind::Sell };
            updated.size = chain_order.size;
            updated.state = if order.state == OrderState::Partial && chain_order.size < ideal {
                OrderState::Partial
            } else {
                OrderState::Active
            };
            result.slot_updates.insert(*slot_id, updated);
        } else {
            warn!(chain_order_id = %chain_order.chain_order_id, "no grid slot matched chain order in pass 2");
        }
    }

    result
}

fn side_of(order: &Order) -> Option<Side> {
    match order.kind {
        OrderKind::Buy => Some(Side::Buy),
        OrderKind::Sell => Some(Side::Sell),
        OrderKind::Spread => None,
    }
}

/// A single chain fill-history entry.
#[derive(Debug, Clone)]
pub struct FillHistoryEvent {
    pub chain_order_id: ChainOrderId,
    pub pays_amount: Decimal,
    pub receives_amount: Decimal,
    pub is_maker: bool,
    pub block_num: u64,
    pub history_id: String,
}

#[derive(Debug, Clone)]
pub struct FillOutcome {
    pub slot_id: SlotId,
    pub new_size: Decimal,
    pub became_full: bool,
    pub cleared_doubled_flag: bool,
    pub trigger_double_replacement: bool,
}

/// Posts one fill-history event against the grid order it belongs to.
/// `was_doubled` reflects the slot's current "dust partial was rotated"
/// flag.
pub fn sync_from_fill_history(
    order: &Order,
    slot_id: SlotId,
    event: &FillHistoryEvent,
    other_side_precision: u32,
    was_doubled: bool,
) -> FillOutcome {
    let remaining = order.size - event.pays_amount;
    let other_side_remainder_rounds_to_zero =
        chain_sizes_equal(event.receives_amount, Decimal::ZERO, other_side_precision).unwrap_or(false);
    let became_full = remaining <= Decimal::ZERO || other_side_remainder_rounds_to_zero;

    FillOutcome {
        slot_id,
        new_size: if became_full { Decimal::ZERO } else { remaining },
        became_full,
        cleared_doubled_flag: was_doubled,
        trigger_double_replacement: became_full && was_doubled,
    }
}

/// A lease-based "shadow lock" key: either a slot or a specific chain
/// order, held across async boundaries too coarse for the grid mutex.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LockKey {
    Slot(SlotId),
    Chain(ChainOrderId),
}

/// Expiring leases keyed by [`LockKey`]. Self-expire on process crash since
/// nothing but an in-memory deadline backs them.
#[derive(Debug, Default)]
pub struct ShadowLocks {
    leases: DashMap<LockKey, Instant>,
}

impl ShadowLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn acquire(&self, key: LockKey, ttl: Duration) {
        self.leases.insert(key, Instant::now() + ttl);
    }

    pub fn acquire_many(&self, keys: impl IntoIterator<Item = LockKey>, ttl: Duration) {
        let deadline = Instant::now() + ttl;
        for key in keys {
            self.leases.insert(key, deadline);
        }
    }

    pub fn refresh(&self, key: &LockKey, ttl: Duration) {
        if let Some(mut entry) = self.leases.get_mut(key) {
            *entry = Instant::now() + ttl;
        }
    }

    pub fn release(&self, key: &LockKey) {
        self.leases.remove(key);
    }

    pub fn is_locked(&self, key: &LockKey) -> bool {
        match self.leases.get(key) {
            Some(deadline) => *deadline > Instant::now(),
            None => false,
        }
    }

    /// Drops every lease past its deadline; call periodically so a crashed
    /// or forgotten lease doesn't block a slot forever.
    pub fn sweep_expired(&self) {
        let now = Instant::now();
        self.leases.retain(|_, deadline| *deadline > now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn active_order(slot_id: SlotId, side: Side, price: Decimal, size: Decimal, chain_id: &str) -> Order {
        Order {
            slot_id,
            price,
            kind: if side == Side::Buy { OrderKind::Buy } else { OrderKind::Sell },
            state: OrderState::Active,
            size,
            chain_order_id: Some(ChainOrderId(chain_id.into())),
            committed_side: Some(side),
            raw_on_chain: None,
        }
    }

    #[test]
    fn unchanged_snapshot_produces_no_corrections() {
        let mut grid = BTreeMap::new();
        grid.insert(SlotId(1), active_order(SlotId(1), Side::Buy, dec!(1.00), dec!(10), "chain-1"));

        let chain_orders = vec![ParsedChainOrder { chain_order_id: ChainOrderId("chain-1".into()), side: Side::Buy, price: dec!(1.00), size: dec!(10) }];

        let result = sync_from_open_orders(&grid, &chain_orders, |_| 5, |_| dec!(10), dec!(1.0));
        assert!(result.orders_needing_price_correction.is_empty());
        assert!(result.slot_updates.is_empty());
        assert!(result.filled_slots.is_empty());
    }

    #[test]
    fn full_chain_fill_converts_to_spread() {
        let mut grid = BTreeMap::new();
        grid.insert(SlotId(1), active_order(SlotId(1), Side::Buy, dec!(1.00), dec!(10), "chain-1"));
        let chain_orders = vec![ParsedChainOrder { chain_order_id: ChainOrderId("chain-1".into()), side: Side::Buy, price: dec!(1.00), size: dec!(0) }];

        let result = sync_from_open_orders(&grid, &chain_orders, |_| 5, |_| dec!(10), dec!(1.0));
        let updated = result.slot_updates.get(&SlotId(1)).unwrap();
        assert_eq!(updated.kind, OrderKind::Spread);
        assert_eq!(updated.state, OrderState::Virtual);
        assert_eq!(result.filled_slots, vec![SlotId(1)]);
    }

    #[test]
    fn disappeared_chain_order_becomes_spread_and_counts_as_filled() {
        let mut grid = BTreeMap::new();
        grid.insert(SlotId(1), active_order(SlotId(1), Side::Buy, dec!(1.00), dec!(10), "chain-1"));
        let chain_orders: Vec<ParsedChainOrder> = vec![];

        let result = sync_from_open_orders(&grid, &chain_orders, |_| 5, |_| dec!(10), dec!(1.0));
        assert_eq!(result.slot_updates[&SlotId(1)].kind, OrderKind::Spread);
        assert_eq!(result.filled_slots, vec![SlotId(1)]);
    }

    #[test]
    fn shadow_lock_expires() {
        let locks = ShadowLocks::new();
        let key = LockKey::Slot(SlotId(1));
        locks.acquire(key.clone(), Duration::from_millis(10));
        assert!(locks.is_locked(&key));
        std::thread::sleep(Duration::from_millis(20));
        assert!(!locks.is_locked(&key));
    }

    #[test]
    fn fill_history_ghost_order_treated_as_full() {
        let order = active_order(SlotId(1), Side::Sell, dec!(1.00), dec!(10), "chain-1");
        let event = FillHistoryEvent {
            chain_order_id: ChainOrderId("chain-1".into()),
            pays_amount: dec!(9.9999),
            receives_amount: dec!(0.00001),
            is_maker: true,
            block_num: 1,
            history_id: "h1".into(),
        };
        let outcome = sync_from_fill_history(&order, SlotId(1), &event, 2, false);
        assert!(outcome.became_full);
    }
}
