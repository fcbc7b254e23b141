//! Benchmark: Per-Side Rebalance Planning
//!
//! Purpose: Measure the cost of planning one side's rebalance and
//! reconciling a planned target against the master grid.
//! Target: low-microsecond range per call, since a rebalance plans both
//! sides on every fill before anything is broadcast to the chain.
//!
//! What's Measured:
//! - `plan_side_rebalance` on a grid with no surpluses/shortages (steady
//!   state)
//! - `plan_side_rebalance` on a grid full of shortages (cold start)
//! - `plan_side_rebalance` on a grid with a mix of dust/hard surpluses to
//!   rotate
//! - `reconcile` diffing an unchanged target against the master
//! - `reconcile` diffing a target with a full side's worth of size changes
//! - `compute_gap_slots` (called once per manager construction, cheap but
//!   exercises `Decimal` -> `f64` conversion and two `ln` calls)
//!
//! Why This Matters:
//! Every fill triggers a plan on both sides before any chain RPC is made.
//! Planning cost sits directly on the fill-to-rebalance latency path, so a
//! regression here is a regression in how quickly the grid reacts to a
//! fill.

use std::collections::{BTreeMap, BTreeSet};

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use gridkeep::grid::MasterSnapshot;
use gridkeep::order::{ChainOrderId, Order, OrderIndices, OrderKind, OrderState, Side, SlotId};
use gridkeep::reconciler::reconcile;
use gridkeep::strategy::{compute_gap_slots, plan_side_rebalance, side_budget, SideRebalanceInput};
use gridkeep::accountant::SideAmounts;

const RAIL_LEN: u64 = 60;

fn build_grid(boundary: usize, gap: usize) -> (MasterSnapshot, Vec<SlotId>) {
    let mut orders = BTreeMap::new();
    let mut price = dec!(0.80);
    let step = dec!(1.01);
    for i in 0..RAIL_LEN {
        let slot_id = SlotId(i);
        let kind = if i as usize <= boundary {
            OrderKind::Buy
        } else if i as usize <= boundary + gap {
            OrderKind::Spread
        } else {
            OrderKind::Sell
        };
        let (state, size, chain_order_id) = match kind {
            OrderKind::Spread => (OrderState::Virtual, Decimal::ZERO, None),
            OrderKind::Buy | OrderKind::Sell => (OrderState::Active, dec!(10), Some(ChainOrderId(format!("chain-{i}")))),
        };
        orders.insert(
            slot_id,
            Order {
                slot_id,
                price,
                kind,
                state,
                size,
                chain_order_id,
                committed_side: if kind == OrderKind::Spread { None } else { Some(if kind == OrderKind::Buy { Side::Buy } else { Side::Sell }) },
                raw_on_chain: None,
            },
        );
        price *= step;
    }
    let indices = OrderIndices::repair(&orders);
    let snapshot = MasterSnapshot { orders, indices, boundary_idx: boundary, version: 1 };
    let rail = snapshot.rail();
    (snapshot, rail)
}

fn build_grid_with_shortages(boundary: usize, gap: usize) -> (MasterSnapshot, Vec<SlotId>) {
    let (mut snapshot, rail) = build_grid(boundary, gap);
    for order in snapshot.orders.values_mut() {
        if matches!(order.kind, OrderKind::Buy | OrderKind::Sell) {
            order.state = OrderState::Virtual;
            order.size = Decimal::ZERO;
            order.chain_order_id = None;
        }
    }
    snapshot.indices = OrderIndices::repair(&snapshot.orders);
    (snapshot, rail)
}

fn build_grid_with_surpluses(boundary: usize, gap: usize) -> (MasterSnapshot, Vec<SlotId>) {
    let (mut snapshot, rail) = build_grid(boundary, gap);
    // Push half the BUY side's resting orders outside the planner's target
    // window by shrinking the window artificially: mark every other BUY
    // slot's size down to dust so the planner treats it as a surplus to
    // rotate rather than a steady resting order.
    let mut toggle = false;
    for (slot_id, order) in snapshot.orders.iter_mut() {
        if order.kind == OrderKind::Buy && slot_id.0 % 2 == 0 {
            toggle = !toggle;
            if toggle {
                order.size = dec!(0.01);
            }
        }
    }
    snapshot.indices = OrderIndices::repair(&snapshot.orders);
    (snapshot, rail)
}

fn bench_plan_side_rebalance_steady_state(c: &mut Criterion) {
    let mut group = c.benchmark_group("rebalance");
    group.significance_level(0.01).sample_size(500);

    let (master, rail) = build_grid(29, 2);
    let locked_slots = BTreeSet::new();
    let locked_chain_ids = BTreeSet::new();
    let budget = side_budget(SideAmounts { buy: dec!(1000), sell: dec!(1000) }, Side::Buy);

    group.bench_function("plan_side_rebalance/steady_state", |b| {
        b.iter(|| {
            black_box(plan_side_rebalance(SideRebalanceInput {
                side: Side::Buy,
                rail: black_box(&rail),
                master: black_box(&master),
                budget: black_box(budget),
                increment_percent: dec!(1.0),
                dust_percent: dec!(10),
                reaction_cap: 3,
                locked_slots: &locked_slots,
                locked_chain_ids: &locked_chain_ids,
                target_spread_percent: dec!(2.0),
                current_spread_percent: None,
                fills_processed: false,
            }));
        });
    });

    group.finish();
}

fn bench_plan_side_rebalance_cold_start(c: &mut Criterion) {
    let mut group = c.benchmark_group("rebalance");
    group.significance_level(0.01).sample_size(500);

    let (master, rail) = build_grid_with_shortages(29, 2);
    let locked_slots = BTreeSet::new();
    let locked_chain_ids = BTreeSet::new();
    let budget = side_budget(SideAmounts { buy: dec!(1000), sell: dec!(1000) }, Side::Buy);

    group.bench_function("plan_side_rebalance/cold_start", |b| {
        b.iter(|| {
            black_box(plan_side_rebalance(SideRebalanceInput {
                side: Side::Buy,
                rail: black_box(&rail),
                master: black_box(&master),
                budget: black_box(budget),
                increment_percent: dec!(1.0),
                dust_percent: dec!(10),
                reaction_cap: 3,
                locked_slots: &locked_slots,
                locked_chain_ids: &locked_chain_ids,
                target_spread_percent: dec!(2.0),
                current_spread_percent: None,
                fills_processed: false,
            }));
        });
    });

    group.finish();
}

fn bench_plan_side_rebalance_with_rotations(c: &mut Criterion) {
    let mut group = c.benchmark_group("rebalance");
    group.significance_level(0.01).sample_size(500);

    let (master, rail) = build_grid_with_surpluses(29, 2);
    let locked_slots = BTreeSet::new();
    let locked_chain_ids = BTreeSet::new();
    let budget = side_budget(SideAmounts { buy: dec!(1000), sell: dec!(1000) }, Side::Buy);

    group.bench_function("plan_side_rebalance/dust_rotation", |b| {
        b.iter(|| {
            black_box(plan_side_rebalance(SideRebalanceInput {
                side: Side::Buy,
                rail: black_box(&rail),
                master: black_box(&master),
                budget: black_box(budget),
                increment_percent: dec!(1.0),
                dust_percent: dec!(10),
                reaction_cap: 3,
                locked_slots: &locked_slots,
                locked_chain_ids: &locked_chain_ids,
                target_spread_percent: dec!(2.0),
                current_spread_percent: None,
                fills_processed: false,
            }));
        });
    });

    group.finish();
}

fn bench_reconcile_unchanged(c: &mut Criterion) {
    let mut group = c.benchmark_group("rebalance");
    group.significance_level(0.01).sample_size(1000);

    let (master, _rail) = build_grid(29, 2);
    let target = master.orders.clone();

    group.bench_function("reconcile/unchanged", |b| {
        b.iter(|| {
            black_box(reconcile(black_box(&master), black_box(&target), black_box(master.boundary_idx)));
        });
    });

    group.finish();
}

fn bench_reconcile_full_side_resize(c: &mut Criterion) {
    let mut group = c.benchmark_group("rebalance");
    group.significance_level(0.01).sample_size(1000);

    let (master, _rail) = build_grid(29, 2);
    let mut target = master.orders.clone();
    for order in target.values_mut() {
        if order.kind == OrderKind::Buy {
            order.size += dec!(1);
        }
    }

    group.bench_function("reconcile/full_side_resize", |b| {
        b.iter(|| {
            black_box(reconcile(black_box(&master), black_box(&target), black_box(master.boundary_idx)));
        });
    });

    group.finish();
}

fn bench_compute_gap_slots(c: &mut Criterion) {
    let mut group = c.benchmark_group("rebalance");
    group.significance_level(0.01).sample_size(10000);

    group.bench_function("compute_gap_slots", |b| {
        b.iter(|| {
            black_box(compute_gap_slots(black_box(dec!(2.0)), black_box(dec!(1.0)), black_box(2), black_box(dec!(2.0))));
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_plan_side_rebalance_steady_state,
    bench_plan_side_rebalance_cold_start,
    bench_plan_side_rebalance_with_rotations,
    bench_reconcile_unchanged,
    bench_reconcile_full_side_resize,
    bench_compute_gap_slots,
);

criterion_main!(benches);
