//! Diffs the master grid against a planned target and emits a compact,
//! batchable action list.

use std::collections::BTreeMap;

use rust_decimal::Decimal;

use crate::grid::MasterSnapshot;
use crate::order::{ChainOrderId, Order, OrderKind, OrderState, Side, SlotId};

/// A single blockchain-facing action emitted by [`reconcile`].
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    Create { slot_id: SlotId, side: Side, price: Decimal, size: Decimal },
    Update { slot_id: SlotId, chain_order_id: ChainOrderId, new_price: Decimal, new_size: Decimal },
    Cancel { slot_id: SlotId, chain_order_id: ChainOrderId },
}

#[derive(Debug, Clone)]
pub struct ReconcileResult {
    pub actions: Vec<Action>,
    pub aborted: bool,
    pub reason: Option<String>,
}

fn order_side(order: &Order) -> Option<Side> {
    match order.kind {
        OrderKind::Buy => Some(Side::Buy),
        OrderKind::Sell => Some(Side::Sell),
        OrderKind::Spread => None,
    }
}

/// Diffs `master` against `target`, producing create/update/cancel actions.
/// Never updates an order in place across a side change — a side flip is
/// always a cancel of the old chain order plus a fresh create.
pub fn reconcile(master: &MasterSnapshot, target: &BTreeMap<SlotId, Order>, target_boundary: usize) -> ReconcileResult {
    let mut actions = Vec::new();
    let clamped_boundary = target_boundary.min(master.orders.len().saturating_sub(1));

    for (slot_id, target_order) in target {
        let target_side = order_side(target_order);
        let master_order = master.orders.get(slot_id);

        match master_order {
            None => {
                if let Some(side) = target_side {
                    if target_order.size > Decimal::ZERO {
                        actions.push(Action::Create { slot_id: *slot_id, side, price: target_order.price, size: target_order.size });
                    }
                }
            }
            Some(existing) => {
                let existing_side = order_side(existing);
                let existing_on_chain = existing.is_on_chain();

                if !existing_on_chain {
                    if let Some(side) = target_side {
                        if target_order.size > Decimal::ZERO {
                            actions.push(Action::Create { slot_id: *slot_id, side, price: target_order.price, size: target_order.size });
                        }
                    }
                    continue;
                }

                let chain_id = match &existing.chain_order_id {
                    Some(id) => id.clone(),
                    None => continue,
                };

                if existing_side != target_side {
                    actions.push(Action::Cancel { slot_id: *slot_id, chain_order_id: chain_id });
                    if let Some(side) = target_side {
                        if target_order.size > Decimal::ZERO {
                            actions.push(Action::Create { slot_id: *slot_id, side, price: target_order.price, size: target_order.size });
                        }
                    }
                } else if existing.size != target_order.size || existing.price != target_order.price {
                    if target_order.size == Decimal::ZERO {
                        actions.push(Action::Cancel { slot_id: *slot_id, chain_order_id: chain_id });
                    } else {
                        actions.push(Action::Update {
                            slot_id: *slot_id,
                            chain_order_id: chain_id,
                            new_price: target_order.price,
                            new_size: target_order.size,
                        });
                    }
                }
            }
        }
    }

    for (slot_id, existing) in &master.orders {
        if target.contains_key(slot_id) {
            continue;
        }
        if existing.is_on_chain() {
            if let Some(chain_id) = &existing.chain_order_id {
                actions.push(Action::Cancel { slot_id: *slot_id, chain_order_id: chain_id.clone() });
            }
        }
    }

    ReconcileResult { actions, aborted: false, reason: None }
}
