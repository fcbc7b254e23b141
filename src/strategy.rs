//! The boundary-crawl strategy: target-grid computation, role assignment,
//! size allocation, and rotate/place/cancel decisions.

use std::cmp::Ordering as CmpOrdering;

use rust_decimal::prelude::*;
use rust_decimal::Decimal;

use crate::accountant::SideAmounts;
use crate::grid::MasterSnapshot;
use crate::order::{ChainOrderId, Order, OrderKind, OrderState, Side, SlotId};

/// A classified fill event as it arrives at the strategy layer. Fills with
/// an unrecognized side are kept as `Unknown` rather than dropped so
/// callers can log and ignore them explicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FillSide {
    Buy,
    Sell,
    Unknown,
}

#[derive(Debug, Clone, Copy)]
pub struct FillEvent {
    pub side: FillSide,
    pub is_partial: bool,
    /// A delayed-rotation trigger from a dust-partial update that later
    /// completed.
    pub is_double_replacement_trigger: bool,
}

/// `gap_slots = max(MIN_SPREAD_ORDERS, ceil(ln(1+spread/100)/ln(1+increment/100)))`,
/// with the spread floored at `increment * MIN_SPREAD_FACTOR` so a
/// pathologically narrow configured spread can never collapse the gap
/// below a multiple of the grid's own increment.
pub fn compute_gap_slots(
    target_spread_percent: Decimal,
    increment_percent: Decimal,
    min_spread_orders: usize,
    min_spread_factor: Decimal,
) -> usize {
    let effective_spread = target_spread_percent.max(increment_percent * min_spread_factor);
    let spread_ratio = (Decimal::ONE + effective_spread / Decimal::ONE_HUNDRED)
        .to_f64()
        .unwrap_or(1.0);
    let increment_ratio = (Decimal::ONE + increment_percent / Decimal::ONE_HUNDRED)
        .to_f64()
        .unwrap_or(1.0);
    let raw = (spread_ratio.ln() / increment_ratio.ln()).ceil();
    let computed = if raw.is_finite() && raw > 0.0 { raw as usize } else { 0 };
    computed.max(min_spread_orders)
}

/// Finds the initial boundary index on first run: the ACTIVE BUY slot
/// nearest `start_price`, or — absent one — `split_idx - floor(gap/2) - 1`
/// where `split_idx` is the first rail index at or above `start_price`.
pub fn compute_initial_boundary(master: &MasterSnapshot, rail: &[SlotId], start_price: Decimal, gap_slots: usize) -> usize {
    if rail.is_empty() {
        return 0;
    }

    let closest_active_buy = rail
        .iter()
        .enumerate()
        .filter(|(_, slot_id)| {
            master
                .orders
                .get(slot_id)
                .map(|o| o.kind == OrderKind::Buy && o.state == OrderState::Active)
                .unwrap_or(false)
        })
        .min_by_key(|(_, slot_id)| (master.orders[slot_id].price - start_price).abs());

    if let Some((idx, _)) = closest_active_buy {
        return idx;
    }

    let split_idx = rail
        .iter()
        .position(|slot_id| master.orders[slot_id].price >= start_price)
        .unwrap_or(rail.len());

    let boundary = split_idx as isize - (gap_slots / 2) as isize - 1;
    boundary.clamp(0, rail.len() as isize - 1) as usize
}

/// Applies one fill to the boundary index. Only full (non-partial) fills
/// and explicit double-replacement triggers move the boundary; unknown
/// sides are ignored. Clamped to `[0, len-1]`.
pub fn shift_boundary(boundary_idx: usize, rail_len: usize, fill: &FillEvent) -> usize {
    if rail_len == 0 {
        return 0;
    }
    if fill.is_partial && !fill.is_double_replacement_trigger {
        return boundary_idx.min(rail_len - 1);
    }
    let shifted = match fill.side {
        FillSide::Buy => boundary_idx as isize - 1,
        FillSide::Sell => boundary_idx as isize + 1,
        FillSide::Unknown => boundary_idx as isize,
    };
    shifted.clamp(0, rail_len as isize - 1) as usize
}

/// The reaction cap per side: the count of valid full fills of the
/// *opposite* side, floored at 1 whenever any fill arrived (or for a
/// periodic sweep with no fills at all).
pub fn compute_reaction_caps(fills: &[FillEvent]) -> ReactionCaps {
    let valid_buy_fills = fills.iter().filter(|f| matches!(f.side, FillSide::Buy) && !f.is_partial).count();
    let valid_sell_fills = fills.iter().filter(|f| matches!(f.side, FillSide::Sell) && !f.is_partial).count();

    let any_fills = !fills.is_empty();
    ReactionCaps {
        // A BUY fill caps SELL-side actions and vice versa.
        buy: if any_fills { valid_sell_fills.max(1) } else { 1 },
        sell: if any_fills { valid_buy_fills.max(1) } else { 1 },
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReactionCaps {
    pub buy: usize,
    pub sell: usize,
}

/// Assigns BUY/SPREAD/SELL roles along the rail for the given boundary.
/// Slots whose order is pending cancellation (has a live chain id but is
/// being rotated away) keep their current side until the chain confirms —
/// modeled here as "skip slots with a chain id already committed to a
/// different side than their geometric role".
pub fn assign_roles(rail: &[SlotId], boundary_idx: usize, gap_slots: usize) -> Vec<(SlotId, OrderKind)> {
    let mut roles = Vec::with_capacity(rail.len());
    for (idx, slot_id) in rail.iter().enumerate() {
        let kind = if idx <= boundary_idx {
            OrderKind::Buy
        } else if idx <= boundary_idx + gap_slots {
            OrderKind::Spread
        } else {
            OrderKind::Sell
        };
        roles.push((*slot_id, kind));
    }
    roles
}

/// Per-side target sizing and rotate/place/cancel decisions, produced by
/// the nine-step per-side rebalance.
#[derive(Debug, Clone, Default)]
pub struct SideRebalancePlan {
    pub target_window: Vec<SlotId>,
    pub ideal_sizes: std::collections::BTreeMap<SlotId, Decimal>,
    pub dust_partial_updates: Vec<(SlotId, Decimal)>,
    pub non_dust_partial_updates: Vec<(SlotId, Decimal, Option<SlotId>)>,
    pub rotations: Vec<Rotation>,
    pub placements: Vec<(SlotId, Decimal)>,
    pub cancellations: Vec<SlotId>,
}

#[derive(Debug, Clone, Copy)]
pub struct Rotation {
    pub from_slot: SlotId,
    pub from_chain_id_known: bool,
    pub to_slot: SlotId,
    pub size: Decimal,
}

/// Inputs needed to plan one side's rebalance.
pub struct SideRebalanceInput<'a> {
    pub side: Side,
    pub rail: &'a [SlotId],
    pub master: &'a MasterSnapshot,
    pub budget: Decimal,
    pub increment_percent: Decimal,
    pub dust_percent: Decimal,
    pub reaction_cap: usize,
    pub locked_slots: &'a std::collections::BTreeSet<SlotId>,
    pub locked_chain_ids: &'a std::collections::BTreeSet<ChainOrderId>,
    /// The configured target spread, for the step-1 window-widening rule.
    pub target_spread_percent: Decimal,
    /// The current best-bid/best-ask spread, percent of best bid. `None`
    /// when one side has no on-chain order to measure from.
    pub current_spread_percent: Option<Decimal>,
    /// Whether this rebalance is reacting to fills (the widening rule only
    /// applies to a periodic sweep with no fills in flight).
    pub fills_processed: bool,
}

fn side_matches(kind: OrderKind, side: Side) -> bool {
    matches!(
        (kind, side),
        (OrderKind::Buy, Side::Buy) | (OrderKind::Sell, Side::Sell)
    )
}

/// The current best-bid/best-ask spread as a percentage of the best bid.
/// `None` if either side has no on-chain order to measure from.
pub fn current_spread_percent(master: &MasterSnapshot) -> Option<Decimal> {
    let best_bid = master
        .orders
        .values()
        .filter(|o| o.kind == OrderKind::Buy && o.is_on_chain())
        .map(|o| o.price)
        .max()?;
    let best_ask = master
        .orders
        .values()
        .filter(|o| o.kind == OrderKind::Sell && o.is_on_chain())
        .map(|o| o.price)
        .min()?;
    if best_bid <= Decimal::ZERO {
        return None;
    }
    Some((best_ask - best_bid) / best_bid * Decimal::ONE_HUNDRED)
}

/// Runs one side's rebalance in isolation; the caller runs this once per
/// side and merges the two plans before reconciling.
pub fn plan_side_rebalance(input: SideRebalanceInput<'_>) -> SideRebalancePlan {
    let mut plan = SideRebalancePlan::default();

    let side_slots: Vec<SlotId> = input
        .rail
        .iter()
        .copied()
        .filter(|slot_id| input.master.orders.get(slot_id).map(|o| side_matches(o.kind, input.side)).unwrap_or(false))
        .collect();

    // Market-closest-first ordering: for BUY the market sits at the high
    // end of the BUY zone, for SELL at the low end of the SELL zone.
    let mut sorted = side_slots.clone();
    match input.side {
        Side::Buy => sorted.reverse(),
        Side::Sell => {}
    }

    let reverse_weights = matches!(input.side, Side::Buy);
    let sizes = crate::primitives::allocate_funds_by_weights(
        input.budget,
        side_slots.len(),
        input.increment_percent / Decimal::ONE_HUNDRED,
        reverse_weights,
        4,
    )
    .unwrap_or_default();

    for (slot_id, size) in side_slots.iter().zip(sizes.iter()) {
        plan.ideal_sizes.insert(*slot_id, *size);
    }

    // Step 1: the target window is the run of market-closest slots the
    // budget can actually fund — `allocate_funds_by_weights` assigns
    // monotonically shrinking weight outward, so once a slot's ideal size
    // rounds to zero every slot further out does too.
    let mut target_count = sorted
        .iter()
        .map(|s| *plan.ideal_sizes.get(s).unwrap_or(&Decimal::ZERO))
        .take_while(|size| *size > Decimal::ZERO)
        .count();

    // Widen by one slot if the live spread has blown out past double the
    // configured target — but only on a periodic sweep, not while reacting
    // to fills (where the boundary shift itself is the correction).
    if !input.fills_processed {
        if let Some(current_spread) = input.current_spread_percent {
            let doubled_target = input.target_spread_percent * Decimal::from(2);
            if current_spread > doubled_target {
                target_count += 1;
            }
        }
    }
    target_count = target_count.min(sorted.len());

    plan.target_window = sorted.iter().take(target_count).copied().collect();

    let dust_threshold = |ideal: Decimal| ideal * input.dust_percent / Decimal::ONE_HUNDRED;

    let is_locked = |slot_id: &SlotId, order: &Order| {
        input.locked_slots.contains(slot_id)
            || order.chain_order_id.as_ref().map(|id| input.locked_chain_ids.contains(id)).unwrap_or(false)
    };

    let mut shortages: Vec<SlotId> = Vec::new();
    let mut hard_surpluses: Vec<SlotId> = Vec::new();
    let mut dust_surpluses: Vec<SlotId> = Vec::new();
    let mut partials: Vec<SlotId> = Vec::new();

    for slot_id in &plan.target_window {
        let order = match input.master.orders.get(slot_id) {
            Some(o) => o,
            None => continue,
        };
        let ideal = *plan.ideal_sizes.get(slot_id).unwrap_or(&Decimal::ZERO);
        if is_locked(slot_id, order) {
            continue;
        }
        if order.state == OrderState::Partial {
            partials.push(*slot_id);
            continue;
        }
        if order.state == OrderState::Virtual || order.size < dust_threshold(ideal) {
            shortages.push(*slot_id);
        }
    }

    for slot_id in &side_slots {
        let order = match input.master.orders.get(slot_id) {
            Some(o) => o,
            None => continue,
        };
        if !order.is_on_chain() || is_locked(slot_id, order) {
            continue;
        }
        let ideal = *plan.ideal_sizes.get(slot_id).unwrap_or(&Decimal::ZERO);
        let in_window = plan.target_window.contains(slot_id);
        if !in_window {
            hard_surpluses.push(*slot_id);
        } else if order.state == OrderState::Active && order.size < dust_threshold(ideal) {
            dust_surpluses.push(*slot_id);
        }
    }

    // Step 6: PARTIAL handling before anything else.
    let mut remaining_budget = input.budget;
    for slot_id in partials {
        let order = &input.master.orders[&slot_id];
        let ideal = *plan.ideal_sizes.get(&slot_id).unwrap_or(&Decimal::ZERO);
        let capped_ideal = ideal.min(remaining_budget.max(Decimal::ZERO));
        if order.size < dust_threshold(ideal) {
            plan.dust_partial_updates.push((slot_id, capped_ideal));
            remaining_budget -= capped_ideal - order.size;
        } else {
            let adjacent_outward = adjacent_outward_slot(input.rail, &side_slots, slot_id, input.side);
            plan.non_dust_partial_updates.push((slot_id, capped_ideal, adjacent_outward));
            remaining_budget -= capped_ideal - order.size;
        }
    }

    // Steps 4+5: order surpluses (PARTIAL already consumed above; here
    // hard/dust surpluses), sort innermost-first for rotation priority.
    let market_closest_first = |a: &SlotId, b: &SlotId| -> CmpOrdering {
        let pa = input.master.orders.get(a).map(|o| o.price).unwrap_or_default();
        let pb = input.master.orders.get(b).map(|o| o.price).unwrap_or_default();
        match input.side {
            Side::Buy => pb.cmp(&pa),
            Side::Sell => pa.cmp(&pb),
        }
    };
    // A PARTIAL order can now show up here too: once the window fix above
    // can shrink `target_count` below the full side, a PARTIAL sitting
    // outside the window is a hard surplus like any other on-chain order
    // (the `partials` list above only ever holds in-window PARTIALs, which
    // are resized in place rather than rotated). Step 4 sorts PARTIALs to
    // the front of the surplus queue so they rotate before plain Actives.
    let is_partial_surplus = |slot_id: &SlotId| {
        input.master.orders.get(slot_id).map(|o| o.state == OrderState::Partial).unwrap_or(false)
    };
    let mut surpluses: Vec<SlotId> = dust_surpluses.into_iter().chain(hard_surpluses).collect();
    surpluses.sort_by(|a, b| is_partial_surplus(b).cmp(&is_partial_surplus(a)).then_with(|| market_closest_first(a, b)));

    let mut shortage_queue: Vec<SlotId> = shortages;
    shortage_queue.sort_by(market_closest_first);

    let reaction_budget = input.reaction_cap;
    let mut actions_taken = 0usize;

    let mut shortage_iter = shortage_queue.into_iter();
    for surplus_slot in surpluses {
        if actions_taken >= reaction_budget {
            plan.cancellations.push(surplus_slot);
            continue;
        }
        if let Some(target_slot) = shortage_iter.next() {
            let order = &input.master.orders[&surplus_slot];
            let ideal = *plan.ideal_sizes.get(&target_slot).unwrap_or(&Decimal::ZERO);
            let size = ideal.min(remaining_budget.max(order.size));
            plan.rotations.push(Rotation {
                from_slot: surplus_slot,
                from_chain_id_known: order.chain_order_id.is_some(),
                to_slot: target_slot,
                size,
            });
            actions_taken += 1;
        } else {
            plan.cancellations.push(surplus_slot);
        }
    }

    // Step 8: place remaining shortages outermost-first from whatever
    // budget is left, one order's worth of the reaction cap at a time.
    let remaining_shortages: Vec<SlotId> = shortage_iter.collect();
    let remaining_orders = remaining_shortages.len().max(1);
    for slot_id in remaining_shortages {
        if actions_taken >= reaction_budget {
            break;
        }
        let per_order_cap = remaining_budget.max(Decimal::ZERO) / Decimal::from(remaining_orders as u64);
        let ideal = *plan.ideal_sizes.get(&slot_id).unwrap_or(&Decimal::ZERO);
        let size = ideal.min(per_order_cap);
        if size > Decimal::ZERO {
            plan.placements.push((slot_id, size));
            remaining_budget -= size;
            actions_taken += 1;
        }
    }

    plan
}

fn adjacent_outward_slot(rail: &[SlotId], side_slots: &[SlotId], slot_id: SlotId, side: Side) -> Option<SlotId> {
    let idx_in_side = side_slots.iter().position(|s| *s == slot_id)?;
    match side {
        Side::Buy => idx_in_side.checked_sub(1).and_then(|i| side_slots.get(i)).copied(),
        Side::Sell => side_slots.get(idx_in_side + 1).copied(),
    }
    .or_else(|| rail.iter().position(|s| *s == slot_id).map(|_| slot_id))
    .filter(|s| *s != slot_id)
}

/// Per-side capital budget after subtracting accrued fee headroom once
/// (never twice — the manager already subtracted it when computing
/// `available`).
pub fn side_budget(available: SideAmounts, side: Side) -> Decimal {
    available.get(side)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use std::collections::BTreeMap;

    fn slot(idx: u64) -> SlotId {
        SlotId(idx)
    }

    fn grid_s1() -> (MasterSnapshot, Vec<SlotId>) {
        let prices = [dec!(0.97), dec!(0.98), dec!(0.99), dec!(1.00), dec!(1.01), dec!(1.02), dec!(1.03), dec!(1.04), dec!(1.05)];
        let mut orders = BTreeMap::new();
        for (i, price) in prices.iter().enumerate() {
            orders.insert(
                slot(i as u64),
                Order {
                    slot_id: slot(i as u64),
                    price: *price,
                    kind: OrderKind::Spread,
                    state: OrderState::Virtual,
                    size: Decimal::ZERO,
                    chain_order_id: None,
                    committed_side: None,
                    raw_on_chain: None,
                },
            );
        }
        let snapshot = MasterSnapshot { orders, indices: Default::default(), boundary_idx: 0, version: 1 };
        let rail: Vec<SlotId> = (0..9).map(|i| slot(i)).collect();
        (snapshot, rail)
    }

    #[test]
    fn initial_boundary_splits_at_start_price() {
        let (master, rail) = grid_s1();
        let boundary = compute_initial_boundary(&master, &rail, dec!(1.00), 3);
        // split_idx = 3 (price 1.00), boundary = 3 - 1 - 1 = 1.
        assert_eq!(boundary, 1);
    }

    #[test]
    fn role_assignment_splits_buy_spread_sell_around_boundary() {
        let (_master, rail) = grid_s1();
        let roles = assign_roles(&rail, 1, 3);
        let kinds: Vec<OrderKind> = roles.iter().map(|(_, k)| *k).collect();
        assert_eq!(kinds[0], OrderKind::Buy);
        assert_eq!(kinds[1], OrderKind::Buy);
        assert_eq!(kinds[2], OrderKind::Spread);
        assert_eq!(kinds[3], OrderKind::Spread);
        assert_eq!(kinds[4], OrderKind::Spread);
        assert_eq!(kinds[5], OrderKind::Sell);
        assert_eq!(kinds[8], OrderKind::Sell);
    }

    #[test]
    fn boundary_crawls_right_on_sell_fill() {
        let fill = FillEvent { side: FillSide::Sell, is_partial: false, is_double_replacement_trigger: false };
        let boundary = shift_boundary(1, 9, &fill);
        assert_eq!(boundary, 2);
    }

    #[test]
    fn boundary_shift_clamps_at_edges() {
        let fill_buy = FillEvent { side: FillSide::Buy, is_partial: false, is_double_replacement_trigger: false };
        assert_eq!(shift_boundary(0, 9, &fill_buy), 0);
        let fill_sell = FillEvent { side: FillSide::Sell, is_partial: false, is_double_replacement_trigger: false };
        assert_eq!(shift_boundary(8, 9, &fill_sell), 8);
    }

    #[test]
    fn reaction_cap_ignores_malformed_fills() {
        let fills = vec![
            FillEvent { side: FillSide::Sell, is_partial: false, is_double_replacement_trigger: false },
            FillEvent { side: FillSide::Buy, is_partial: false, is_double_replacement_trigger: false },
            FillEvent { side: FillSide::Unknown, is_partial: false, is_double_replacement_trigger: false },
            FillEvent { side: FillSide::Unknown, is_partial: true, is_double_replacement_trigger: false },
        ];
        let caps = compute_reaction_caps(&fills);
        assert_eq!(caps.buy, 1);
        assert_eq!(caps.sell, 1);
    }

    #[test]
    fn gap_slots_has_a_floor() {
        let gap = compute_gap_slots(dec!(0.01), dec!(1.0), 2, dec!(2.0));
        assert!(gap >= 2);
    }

    fn buy_grid_three_slots(middle_state: OrderState, middle_chain_id: Option<ChainOrderId>) -> (MasterSnapshot, Vec<SlotId>) {
        let prices = [dec!(0.90), dec!(0.95), dec!(1.00)];
        let mut orders = BTreeMap::new();
        for (i, price) in prices.iter().enumerate() {
            let is_middle = i == 1;
            orders.insert(
                slot(i as u64),
                Order {
                    slot_id: slot(i as u64),
                    price: *price,
                    kind: OrderKind::Buy,
                    state: if is_middle { middle_state } else { OrderState::Virtual },
                    size: if is_middle { dec!(5) } else { Decimal::ZERO },
                    chain_order_id: if is_middle { middle_chain_id.clone() } else { None },
                    committed_side: Some(Side::Buy),
                    raw_on_chain: None,
                },
            );
        }
        let snapshot = MasterSnapshot { orders, indices: Default::default(), boundary_idx: 2, version: 1 };
        let rail: Vec<SlotId> = (0..3).map(|i| slot(i)).collect();
        (snapshot, rail)
    }

    /// With no budget at all, the target window shrinks to zero (step 1:
    /// the window only spans slots the budget can actually fund). A PARTIAL
    /// order that no longer falls inside that window is a hard surplus like
    /// any other on-chain order, not something silently left untouched.
    #[test]
    fn out_of_window_partial_becomes_surplus_and_is_cancelled() {
        let (master, rail) = buy_grid_three_slots(OrderState::Partial, Some(ChainOrderId("partial-1".into())));
        let locked_slots = std::collections::BTreeSet::new();
        let locked_chain_ids = std::collections::BTreeSet::new();

        let plan = plan_side_rebalance(SideRebalanceInput {
            side: Side::Buy,
            rail: &rail,
            master: &master,
            budget: Decimal::ZERO,
            increment_percent: dec!(1.0),
            dust_percent: dec!(10),
            reaction_cap: 5,
            locked_slots: &locked_slots,
            locked_chain_ids: &locked_chain_ids,
            target_spread_percent: dec!(2.0),
            current_spread_percent: None,
            fills_processed: false,
        });

        assert!(plan.target_window.is_empty(), "a zero budget funds nothing, so the window is empty");
        assert!(plan.dust_partial_updates.is_empty());
        assert!(plan.non_dust_partial_updates.is_empty());
        assert_eq!(plan.cancellations, vec![slot(1)], "the out-of-window partial surfaces as a cancellable surplus");
    }

    /// A PARTIAL surplus rotates ahead of a plain ACTIVE surplus at the same
    /// distance from market (step 4: "PARTIALs first").
    #[test]
    fn partial_surplus_sorts_before_active_surplus_at_same_distance() {
        let prices = [dec!(0.90), dec!(0.95), dec!(0.96), dec!(1.00)];
        let mut orders = BTreeMap::new();
        // slot0: outermost ACTIVE surplus. slot1: inner-of-the-two ACTIVE
        // surplus. slot2: PARTIAL surplus, market-closer than slot1's twin
        // at slot3 so the tie is broken only by partial-first, not distance.
        let kinds_states = [
            (OrderKind::Buy, OrderState::Active, None::<ChainOrderId>),
            (OrderKind::Buy, OrderState::Active, Some(ChainOrderId("active-1".into()))),
            (OrderKind::Buy, OrderState::Partial, Some(ChainOrderId("partial-1".into()))),
        ];
        for (i, price) in prices.iter().take(3).enumerate() {
            let (kind, state, chain_id) = kinds_states[i].clone();
            orders.insert(
                slot(i as u64),
                Order {
                    slot_id: slot(i as u64),
                    price: *price,
                    kind,
                    state,
                    size: if state == OrderState::Virtual { Decimal::ZERO } else { dec!(5) },
                    chain_order_id: chain_id,
                    committed_side: Some(Side::Buy),
                    raw_on_chain: None,
                },
            );
        }
        let master = MasterSnapshot { orders, indices: Default::default(), boundary_idx: 3, version: 1 };
        let rail: Vec<SlotId> = (0..3).map(|i| slot(i)).collect();
        let locked_slots = std::collections::BTreeSet::new();
        let locked_chain_ids = std::collections::BTreeSet::new();

        // Zero budget forces an empty window, so both on-chain orders land
        // in the surplus queue regardless of distance from market.
        let plan = plan_side_rebalance(SideRebalanceInput {
            side: Side::Buy,
            rail: &rail,
            master: &master,
            budget: Decimal::ZERO,
            increment_percent: dec!(1.0),
            dust_percent: dec!(10),
            reaction_cap: 1,
            locked_slots: &locked_slots,
            locked_chain_ids: &locked_chain_ids,
            target_spread_percent: dec!(2.0),
            current_spread_percent: None,
            fills_processed: false,
        });

        // reaction_cap of 1 means only the first surplus processed gets a
        // chance at a shortage slot (there are none here, so it still ends
        // up cancelled) — but the PARTIAL must be first in line.
        assert_eq!(plan.cancellations.first(), Some(&slot(2)), "the PARTIAL surplus sorts ahead of plain ACTIVE surpluses");
    }
}
