//! Immutable order records and the state/type indices kept in lock-step
//! with the master grid.

use std::collections::{BTreeMap, BTreeSet};

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::GridError;

/// Stable identifier of a grid position. Slots are created once, at grid
/// initialization, and never renumbered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SlotId(pub u64);

impl std::fmt::Display for SlotId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "slot#{}", self.0)
    }
}

/// Opaque blockchain order handle.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ChainOrderId(pub String);

impl std::fmt::Display for ChainOrderId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A fund-accounting side. Asset A is the SELL sizing asset, asset B is the
/// BUY sizing asset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn opposite(self) -> Side {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Side::Buy => write!(f, "buy"),
            Side::Sell => write!(f, "sell"),
        }
    }
}

/// The role a grid slot currently plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderKind {
    Buy,
    Sell,
    /// A VIRTUAL placeholder reserving a price level inside the spread gap.
    Spread,
}

/// The lifecycle state of a slot's order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderState {
    /// Not resting on chain.
    Virtual,
    /// Resting on chain at full size.
    Active,
    /// Resting on chain, partially filled.
    Partial,
}

/// The last snapshot of an order's on-chain representation, kept to compute
/// size deltas between sync passes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawOnChain {
    pub chain_order_id: ChainOrderId,
    pub price: Decimal,
    pub size: Decimal,
}

/// An immutable grid slot record. Mutation happens by constructing a new
/// `Order` from the old one and installing it into a cloned grid map
/// (`apply_order_update` on [`crate::grid::WorkingGrid`]); there is no
/// `&mut self` mutator on this type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub slot_id: SlotId,
    pub price: Decimal,
    pub kind: OrderKind,
    pub state: OrderState,
    pub size: Decimal,
    pub chain_order_id: Option<ChainOrderId>,
    pub committed_side: Option<Side>,
    pub raw_on_chain: Option<RawOnChain>,
}

impl Order {
    /// A fresh VIRTUAL spread placeholder at `price`.
    pub fn spread_placeholder(slot_id: SlotId, price: Decimal) -> Self {
        Self {
            slot_id,
            price,
            kind: OrderKind::Spread,
            state: OrderState::Virtual,
            size: Decimal::ZERO,
            chain_order_id: None,
            committed_side: None,
            raw_on_chain: None,
        }
    }

    pub fn is_on_chain(&self) -> bool {
        matches!(self.state, OrderState::Active | OrderState::Partial)
    }

    /// A "phantom order": claims to be on chain but carries no chain id.
    /// Must never be allowed to persist.
    pub fn is_phantom(&self) -> bool {
        self.is_on_chain() && self.chain_order_id.is_none()
    }

    /// Applies a diff, auto-correcting phantom states. Returns the new
    /// record plus an illegal-state signal if the requested
    /// transition was rejected and rewritten.
    pub fn with_update(&self, update: OrderUpdate) -> (Order, Option<String>) {
        let mut next = self.clone();
        let mut illegal = None;

        if let Some(kind) = update.kind {
            if self.kind == OrderKind::Spread && matches!(kind, OrderKind::Buy | OrderKind::Sell) {
                // A SPREAD slot may only become BUY/SELL while still VIRTUAL;
                // going straight to ACTIVE/PARTIAL is invariant 3.
            }
            next.kind = kind;
        }
        if let Some(state) = update.state {
            next.state = state;
        }
        if let Some(size) = update.size {
            next.size = size;
        }
        if update.clear_chain_id {
            next.chain_order_id = None;
            next.raw_on_chain = None;
        } else if let Some(id) = update.chain_order_id {
            next.chain_order_id = Some(id);
        }
        if let Some(side) = update.committed_side {
            next.committed_side = Some(side);
        }
        if let Some(raw) = update.raw_on_chain {
            next.raw_on_chain = Some(raw);
        }

        if next.is_phantom() {
            illegal = Some(format!(
                "{}: {:?} state requires a chain_order_id; downgraded to VIRTUAL",
                next.slot_id, next.state
            ));
            next.state = OrderState::Virtual;
            next.size = Decimal::ZERO;
            next.chain_order_id = None;
        }

        if next.kind == OrderKind::Spread {
            // Invariant 2: SPREAD implies zero size and VIRTUAL.
            next.size = Decimal::ZERO;
            next.state = OrderState::Virtual;
        }

        (next, illegal)
    }
}

/// A partial update to apply to an [`Order`]. `None` fields are left
/// unchanged — an explicit optionality in place of a loose diff object.
#[derive(Debug, Clone, Default)]
pub struct OrderUpdate {
    pub kind: Option<OrderKind>,
    pub state: Option<OrderState>,
    pub size: Option<Decimal>,
    pub chain_order_id: Option<ChainOrderId>,
    pub clear_chain_id: bool,
    pub committed_side: Option<Side>,
    pub raw_on_chain: Option<RawOnChain>,
}

/// `by_state`/`by_type` index sets, maintained in lock-step with the master
/// map.
#[derive(Debug, Clone, Default)]
pub struct OrderIndices {
    by_state: BTreeMap<StateKey, BTreeSet<SlotId>>,
    by_type: BTreeMap<TypeKey, BTreeSet<SlotId>>,
}

// `OrderState`/`OrderKind` aren't `Ord`, so the indices key on a small
// discriminant wrapper rather than deriving Ord on the public enums (which
// would pressure their variant order to mean something it doesn't).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct StateKey(u8);
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct TypeKey(u8);

fn state_key(s: OrderState) -> StateKey {
    StateKey(match s {
        OrderState::Virtual => 0,
        OrderState::Active => 1,
        OrderState::Partial => 2,
    })
}
fn type_key(t: OrderKind) -> TypeKey {
    TypeKey(match t {
        OrderKind::Buy => 0,
        OrderKind::Sell => 1,
        OrderKind::Spread => 2,
    })
}

impl OrderIndices {
    pub fn by_state(&self, state: OrderState) -> &BTreeSet<SlotId> {
        static EMPTY: BTreeSet<SlotId> = BTreeSet::new();
        self.by_state.get(&state_key(state)).unwrap_or(&EMPTY)
    }

    pub fn by_type(&self, kind: OrderKind) -> &BTreeSet<SlotId> {
        static EMPTY: BTreeSet<SlotId> = BTreeSet::new();
        self.by_type.get(&type_key(kind)).unwrap_or(&EMPTY)
    }

    /// Rebuilds both index sets from scratch against the given master map.
    pub fn repair(master: &BTreeMap<SlotId, Order>) -> Self {
        let mut indices = OrderIndices::default();
        for (slot_id, order) in master {
            indices
                .by_state
                .entry(state_key(order.state))
                .or_default()
                .insert(*slot_id);
            indices
                .by_type
                .entry(type_key(order.kind))
                .or_default()
                .insert(*slot_id);
        }
        indices
    }

    /// Debug invariant: every master entry appears in exactly one state set
    /// and one type set, and no set references an absent slot.
    pub fn validate(&self, master: &BTreeMap<SlotId, Order>) -> Result<(), GridError> {
        for slot_id in master.keys() {
            let in_state_sets = self.by_state.values().filter(|s| s.contains(slot_id)).count();
            let in_type_sets = self.by_type.values().filter(|s| s.contains(slot_id)).count();
            if in_state_sets != 1 {
                return Err(GridError::Internal(format!(
                    "{} appears in {} state sets (expected 1)",
                    slot_id, in_state_sets
                )));
            }
            if in_type_sets != 1 {
                return Err(GridError::Internal(format!(
                    "{} appears in {} type sets (expected 1)",
                    slot_id, in_type_sets
                )));
            }
        }
        for set in self.by_state.values().chain(self.by_type.values()) {
            for slot_id in set {
                if !master.contains_key(slot_id) {
                    return Err(GridError::Internal(format!(
                        "index references absent slot {}",
                        slot_id
                    )));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn sample_order(id: u64, kind: OrderKind, state: OrderState) -> Order {
        Order {
            slot_id: SlotId(id),
            price: dec!(1.0),
            kind,
            state,
            size: if matches!(state, OrderState::Virtual) { Decimal::ZERO } else { dec!(1.0) },
            chain_order_id: if matches!(state, OrderState::Virtual) {
                None
            } else {
                Some(ChainOrderId(format!("chain-{id}")))
            },
            committed_side: None,
            raw_on_chain: None,
        }
    }

    #[test]
    fn phantom_order_is_auto_corrected() {
        let order = sample_order(1, OrderKind::Buy, OrderState::Virtual);
        let (updated, illegal) = order.with_update(OrderUpdate {
            state: Some(OrderState::Active),
            clear_chain_id: true,
            ..Default::default()
        });
        assert!(illegal.is_some());
        assert_eq!(updated.state, OrderState::Virtual);
        assert_eq!(updated.size, Decimal::ZERO);
        assert!(updated.chain_order_id.is_none());
    }

    #[test]
    fn spread_forces_zero_size_and_virtual() {
        let order = sample_order(2, OrderKind::Buy, OrderState::Active);
        let (updated, _) = order.with_update(OrderUpdate {
            kind: Some(OrderKind::Spread),
            ..Default::default()
        });
        assert_eq!(updated.size, Decimal::ZERO);
        assert_eq!(updated.state, OrderState::Virtual);
    }

    #[test]
    fn validate_indices_round_trip() {
        let mut master = BTreeMap::new();
        master.insert(SlotId(1), sample_order(1, OrderKind::Buy, OrderState::Active));
        master.insert(SlotId(2), sample_order(2, OrderKind::Spread, OrderState::Virtual));
        let indices = OrderIndices::repair(&master);
        assert!(indices.validate(&master).is_ok());
        assert!(indices.by_type(OrderKind::Buy).contains(&SlotId(1)));
        assert!(indices.by_state(OrderState::Virtual).contains(&SlotId(2)));
    }

    #[test]
    fn validate_indices_detects_dangling_reference() {
        let mut master = BTreeMap::new();
        master.insert(SlotId(1), sample_order(1, OrderKind::Buy, OrderState::Active));
        let mut indices = OrderIndices::repair(&master);
        indices.by_type.get_mut(&type_key(OrderKind::Buy)).unwrap().insert(SlotId(99));
        assert!(indices.validate(&master).is_err());
    }
}
