//! Fund accounting: free/committed/virtual/cache tracking, fee accrual, fill
//! accounting, and invariant/drift detection.
//!
//! Every operation here assumes the caller already holds the manager's
//! `fund_lock` — this module has no internal locking of its own, and models
//! the engine as free functions/methods over borrowed state rather than as
//! lock-owning graph nodes.

use rust_decimal::Decimal;
use tracing::{error, warn};

use crate::error::AccountingFailure;
use crate::grid::MasterSnapshot;
use crate::order::{OrderKind, OrderState, Side};

/// A generic per-side pair, used throughout the fund model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SideAmounts {
    pub buy: Decimal,
    pub sell: Decimal,
}

impl SideAmounts {
    pub fn get(&self, side: Side) -> Decimal {
        match side {
            Side::Buy => self.buy,
            Side::Sell => self.sell,
        }
    }

    pub fn set(&mut self, side: Side, value: Decimal) {
        match side {
            Side::Buy => self.buy = value,
            Side::Sell => self.sell = value,
        }
    }

    pub fn add(&mut self, side: Side, delta: Decimal) {
        let v = self.get(side) + delta;
        self.set(side, v);
    }
}

/// Chain-reported totals, the ceiling fund values are never allowed to
/// exceed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AccountTotals {
    pub buy_total: Decimal,
    pub buy_free: Decimal,
    pub sell_total: Decimal,
    pub sell_free: Decimal,
}

impl AccountTotals {
    pub fn total(&self, side: Side) -> Decimal {
        match side {
            Side::Buy => self.buy_total,
            Side::Sell => self.sell_total,
        }
    }

    pub fn free(&self, side: Side) -> Decimal {
        match side {
            Side::Buy => self.buy_free,
            Side::Sell => self.sell_free,
        }
    }

    fn set_total(&mut self, side: Side, value: Decimal) {
        match side {
            Side::Buy => self.buy_total = value,
            Side::Sell => self.sell_total = value,
        }
    }

    fn set_free(&mut self, side: Side, value: Decimal) {
        match side {
            Side::Buy => self.buy_free = value,
            Side::Sell => self.sell_free = value,
        }
    }
}

/// Committed amounts split by source: on-chain resting size vs. the grid's
/// own bookkeeping view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CommittedAmounts {
    pub chain: SideAmounts,
    pub grid: SideAmounts,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TotalAmounts {
    pub chain: SideAmounts,
    pub grid: SideAmounts,
}

/// The engine's own derived fund view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Funds {
    pub available: SideAmounts,
    pub committed: CommittedAmounts,
    pub virtual_amounts: SideAmounts,
    pub total: TotalAmounts,
    pub cache_funds: SideAmounts,
    pub bts_fees_owed: Decimal,
}

/// A settled fill to post through [`Accountant::process_fill_accounting`].
#[derive(Debug, Clone, Copy)]
pub struct FillOp {
    pub pays_side: Side,
    pub pays_amount: Decimal,
    pub receives_side: Side,
    pub receives_amount_gross: Decimal,
    pub fee: Decimal,
    /// `true` if the fee asset is the side that receives proceeds (the
    /// native fee-asset special case).
    pub fee_is_native_asset: bool,
}

/// Tolerance inputs for invariant verification.
#[derive(Debug, Clone, Copy)]
pub struct ToleranceInputs {
    pub precision: u32,
    pub relative_tolerance_bps: Decimal,
}

impl ToleranceInputs {
    pub fn tolerance_for(&self, total: Decimal) -> Decimal {
        let absolute_floor = Decimal::new(2, self.precision);
        let relative = (total.abs() * self.relative_tolerance_bps / Decimal::from(10_000)).abs();
        absolute_floor.max(relative)
    }
}

/// Fund tracking over one market's two sides. Wrapped by the manager in its
/// `fund_lock`; every public method here mutates in place and returns
/// rather than throws for expected domain conditions.
#[derive(Debug, Default)]
pub struct Accountant {
    pub account_totals: AccountTotals,
    pub funds: Funds,
    pub last_accounting_failure: Option<AccountingFailure>,
    recovery_attempted_this_cycle: bool,
}

impl Accountant {
    pub fn new() -> Self {
        Self::default()
    }

    /// Zeros every sub-total; `account_totals` (chain-sourced) is left
    /// alone — it is refreshed separately from a balance fetch.
    pub fn reset_funds(&mut self) {
        self.funds = Funds::default();
        self.last_accounting_failure = None;
    }

    pub fn begin_cycle(&mut self) {
        self.recovery_attempted_this_cycle = false;
    }

    /// Recomputes every derived fund field from the current master grid and
    /// `account_totals`, then verifies the accounting invariants hold within
    /// tolerance. Violations are logged, not thrown; `last_accounting_failure` is set
    /// so orchestration can trigger its single per-cycle recovery attempt.
    pub fn recalculate_funds(
        &mut self,
        master: &MasterSnapshot,
        start_price: Decimal,
        allocated: SideAmounts,
        fee_headroom: SideAmounts,
        tolerance: ToleranceInputs,
    ) {
        let mut committed_grid = SideAmounts::default();
        let mut committed_chain = SideAmounts::default();
        let mut virtual_amounts = SideAmounts::default();

        for order in master.orders.values() {
            match (order.kind, order.state) {
                (OrderKind::Spread, _) => {
                    let side = if order.price < start_price { Side::Buy } else { Side::Sell };
                    // SPREAD orders contribute nothing to chain commitment
                    // (they carry no chain id) but do occupy a grid-side
                    // slot for sizing purposes.
                    committed_grid.add(side, Decimal::ZERO);
                }
                (OrderKind::Buy, OrderState::Active | OrderState::Partial) => {
                    committed_grid.add(Side::Buy, order.size);
                    committed_chain.add(Side::Buy, order.size);
                }
                (OrderKind::Sell, OrderState::Active | OrderState::Partial) => {
                    committed_grid.add(Side::Sell, order.size);
                    committed_chain.add(Side::Sell, order.size);
                }
                (OrderKind::Buy | OrderKind::Sell, OrderState::Virtual) => {
                    let side = if order.kind == OrderKind::Buy { Side::Buy } else { Side::Sell };
                    virtual_amounts.add(side, order.size);
                }
            }
        }

        self.funds.committed.grid = committed_grid;
        self.funds.committed.chain = committed_chain;
        self.funds.virtual_amounts = virtual_amounts;

        let mut total_chain = SideAmounts::default();
        let mut total_grid = SideAmounts::default();
        let mut available = SideAmounts::default();
        for side in [Side::Buy, Side::Sell] {
            let chain_free = self.account_totals.free(side);
            total_chain.set(side, chain_free + self.funds.committed.chain.get(side));
            total_grid.set(side, self.funds.committed.grid.get(side) + self.funds.virtual_amounts.get(side));

            let computed_available = chain_free - self.funds.virtual_amounts.get(side) - fee_headroom.get(side);
            available.set(side, computed_available.min(allocated.get(side)));
        }
        self.funds.total = TotalAmounts { chain: total_chain, grid: total_grid };
        self.funds.available = available;

        self.verify_invariants(tolerance);
    }

    fn verify_invariants(&mut self, tolerance: ToleranceInputs) {
        for side in [Side::Buy, Side::Sell] {
            let total = self.account_totals.total(side);
            let free = self.account_totals.free(side);
            let committed_on_chain = self.funds.committed.chain.get(side);
            let drift = (total - (free + committed_on_chain)).abs();
            let limit = tolerance.tolerance_for(total);
            if drift > limit {
                let description = format!(
                    "fund drift {drift} exceeds tolerance {limit} for {side} (total={total}, free={free}, committed_chain={committed_on_chain})"
                );
                error!(%side, %drift, %limit, "accounting invariant violated");
                self.last_accounting_failure = Some(AccountingFailure { side, description });
            }

            let cache = self.funds.cache_funds.get(side);
            if cache > free + limit {
                warn!(%side, %cache, %free, "cache_funds exceeds chain free balance beyond tolerance");
                self.last_accounting_failure = Some(AccountingFailure {
                    side,
                    description: format!("cache_funds {cache} exceeds free {free} beyond tolerance {limit}"),
                });
            }
        }
    }

    /// True if a recovery attempt (balance fetch + re-sync + re-validate)
    /// should run this cycle; marks it as consumed so a second violation in
    /// the same cycle does not re-trigger it.
    pub fn should_attempt_recovery(&mut self) -> bool {
        if self.last_accounting_failure.is_none() || self.recovery_attempted_this_cycle {
            return false;
        }
        self.recovery_attempted_this_cycle = true;
        true
    }

    /// Atomic deduct-if-sufficient. Returns `false` without mutating state
    /// if `amount` exceeds the side's chain-free balance.
    pub fn try_deduct_from_chain_free(&mut self, side: Side, amount: Decimal, op: &str) -> bool {
        let free = self.account_totals.free(side);
        if amount > free {
            warn!(%side, %amount, %free, op, "insufficient chain free balance");
            return false;
        }
        self.account_totals.set_free(side, free - amount);
        true
    }

    pub fn add_to_chain_free(&mut self, side: Side, amount: Decimal, op: &str) {
        let free = self.account_totals.free(side);
        self.account_totals.set_free(side, free + amount);
        tracing::debug!(%side, %amount, op, "added to chain free balance");
    }

    /// Updates both `total` and `free`. `free` may transiently go negative
    /// (a race between fill detection and order state update); `total` is
    /// always clamped at zero.
    pub fn adjust_total_balance(&mut self, side: Side, delta: Decimal, op: &str, total_only: bool) {
        let new_total = (self.account_totals.total(side) + delta).max(Decimal::ZERO);
        self.account_totals.set_total(side, new_total);
        if !total_only {
            let new_free = self.account_totals.free(side) + delta;
            self.account_totals.set_free(side, new_free);
        }
        tracing::debug!(%side, %delta, op, total_only, "adjusted total balance");
    }

    /// Reconciles the optimistic free balance across a commitment change.
    /// `fee` must only be `Some` for genuine chain operations (create,
    /// update, cancel) — rotation paths that merely reassign a slot's
    /// intent must pass `None` to avoid double-charging.
    pub fn update_optimistic_free_balance(
        &mut self,
        side: Side,
        old_committed: Decimal,
        new_committed: Decimal,
        ctx: &str,
        fee: Option<Decimal>,
    ) {
        let commitment_delta = new_committed - old_committed;
        if commitment_delta > Decimal::ZERO {
            let free = self.account_totals.free(side);
            self.account_totals.set_free(side, free - commitment_delta);
        } else if commitment_delta < Decimal::ZERO {
            let free = self.account_totals.free(side);
            self.account_totals.set_free(side, free - commitment_delta);
        }

        if let Some(fee_amount) = fee {
            let free = self.account_totals.free(side);
            let total = self.account_totals.total(side);
            self.account_totals.set_free(side, free - fee_amount);
            self.account_totals.set_total(side, (total - fee_amount).max(Decimal::ZERO));
        }

        tracing::debug!(%side, %commitment_delta, ?fee, ctx, "optimistic free balance updated");
    }

    /// Settles accrued native fee-asset fees. Deferred (returns without
    /// mutating) when the fee side's chain free balance can't yet cover the
    /// owed amount.
    pub fn deduct_bts_fees(&mut self, fee_side: Side) {
        if self.funds.bts_fees_owed <= Decimal::ZERO {
            return;
        }
        let owed = self.funds.bts_fees_owed;
        let free = self.account_totals.free(fee_side);
        if free < owed {
            warn!(%fee_side, %owed, %free, "deferring bts fee deduction: insufficient free balance");
            return;
        }

        let from_cache = owed.min(self.funds.cache_funds.get(fee_side));
        self.funds.cache_funds.add(fee_side, -from_cache);
        let remaining = owed - from_cache;

        self.account_totals.set_free(fee_side, free - owed);
        let total = self.account_totals.total(fee_side);
        self.account_totals.set_total(fee_side, (total - owed).max(Decimal::ZERO));

        tracing::debug!(%fee_side, %owed, %from_cache, %remaining, "bts fees settled");
        self.funds.bts_fees_owed = Decimal::ZERO;
    }

    /// Adds (or subtracts) `delta` from a side's cache pool, clamping at
    /// zero, and returns the resulting value.
    pub fn modify_cache_funds(&mut self, side: Side, delta: Decimal) -> Decimal {
        let new_value = (self.funds.cache_funds.get(side) + delta).max(Decimal::ZERO);
        self.funds.cache_funds.set(side, new_value);
        new_value
    }

    /// Posts a settled fill: deducts the paying side, credits the
    /// receiving side net of fees, and feeds the receiving side's cache
    /// pool. The native fee asset never receives a "refund" credit here —
    /// its fee settles later via [`Accountant::deduct_bts_fees`].
    pub fn process_fill_accounting(&mut self, fill: FillOp) {
        self.adjust_total_balance(fill.pays_side, -fill.pays_amount, "fill:pays", false);

        let net_proceeds = if fill.fee_is_native_asset {
            self.funds.bts_fees_owed += fill.fee;
            fill.receives_amount_gross
        } else {
            fill.receives_amount_gross - fill.fee
        };

        self.adjust_total_balance(fill.receives_side, net_proceeds, "fill:receives", false);
        self.modify_cache_funds(fill.receives_side, net_proceeds);

        tracing::info!(
            pays_side = %fill.pays_side,
            pays_amount = %fill.pays_amount,
            receives_side = %fill.receives_side,
            net_proceeds = %net_proceeds,
            fee = %fill.fee,
            "fill accounting posted"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn base_accountant() -> Accountant {
        let mut a = Accountant::new();
        a.account_totals = AccountTotals {
            buy_total: dec!(1000),
            buy_free: dec!(1000),
            sell_total: dec!(1000),
            sell_free: dec!(1000),
        };
        a
    }

    #[test]
    fn fill_accounting_posts_pays_and_receives_with_fee() {
        let mut a = base_accountant();
        a.process_fill_accounting(FillOp {
            pays_side: Side::Sell,
            pays_amount: dec!(100),
            receives_side: Side::Buy,
            receives_amount_gross: dec!(100),
            fee: dec!(1),
            fee_is_native_asset: false,
        });

        assert_eq!(a.account_totals.sell_free, dec!(900));
        assert_eq!(a.account_totals.sell_total, dec!(900));
        assert_eq!(a.account_totals.buy_total, dec!(1099));
        assert_eq!(a.account_totals.buy_free, dec!(1099));
        assert_eq!(a.funds.cache_funds.buy, dec!(99));
    }

    #[test]
    fn native_fee_asset_defers_to_bts_fees_owed() {
        let mut a = base_accountant();
        a.process_fill_accounting(FillOp {
            pays_side: Side::Sell,
            pays_amount: dec!(100),
            receives_side: Side::Buy,
            receives_amount_gross: dec!(100),
            fee: dec!(2),
            fee_is_native_asset: true,
        });
        assert_eq!(a.funds.bts_fees_owed, dec!(2));
        // Full gross amount credited, no refund subtracted up front.
        assert_eq!(a.account_totals.buy_total, dec!(1100));
    }

    #[test]
    fn try_deduct_fails_when_insufficient() {
        let mut a = base_accountant();
        assert!(!a.try_deduct_from_chain_free(Side::Buy, dec!(2000), "test"));
        assert_eq!(a.account_totals.buy_free, dec!(1000));
        assert!(a.try_deduct_from_chain_free(Side::Buy, dec!(500), "test"));
        assert_eq!(a.account_totals.buy_free, dec!(500));
    }

    #[test]
    fn adjust_total_balance_clamps_total_but_not_free() {
        let mut a = base_accountant();
        a.adjust_total_balance(Side::Buy, dec!(-1500), "overdraw", false);
        assert_eq!(a.account_totals.buy_total, Decimal::ZERO);
        assert_eq!(a.account_totals.buy_free, dec!(-500));
    }

    #[test]
    fn deduct_bts_fees_defers_when_insufficient_free() {
        let mut a = base_accountant();
        a.funds.bts_fees_owed = dec!(5000);
        a.deduct_bts_fees(Side::Buy);
        assert_eq!(a.funds.bts_fees_owed, dec!(5000));
        a.account_totals.buy_free = dec!(6000);
        a.deduct_bts_fees(Side::Buy);
        assert_eq!(a.funds.bts_fees_owed, Decimal::ZERO);
    }

    #[test]
    fn tolerance_uses_greater_of_absolute_floor_and_relative() {
        let tol = ToleranceInputs { precision: 5, relative_tolerance_bps: dec!(10) };
        // total small enough that 0.1% of it is dwarfed by the absolute floor.
        assert_eq!(tol.tolerance_for(dec!(0.001)), Decimal::new(2, 5));
        assert!(tol.tolerance_for(dec!(100000)) > Decimal::new(2, 5));
    }
}
