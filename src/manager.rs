//! The orchestrator: holds the frozen master, every engine, the lease/lock
//! state, and the commit protocol that turns a planned rebalance into a
//! master-grid swap.
//!
//! This manager is the one genuinely async-orchestrated module in the crate;
//! every engine it calls (`accountant`, `strategy`, `reconciler`, `sync`) is
//! synchronous free functions over borrowed state rather than lock-owning
//! graph nodes, leaving `tokio::sync::Mutex`/`RwLock` as the only async
//! orchestration primitives in the crate.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex as SyncMutex;
use rust_decimal::Decimal;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{info, warn};

use crate::accountant::{Accountant, AccountTotals, FillOp, Funds, SideAmounts, ToleranceInputs};
use crate::assets::AssetMetadata;
use crate::chain::ChainClient;
use crate::config::{Allocation, GridConfig};
use crate::error::{GridError, IllegalStateSignal};
use crate::grid::{MasterGrid, MasterSnapshot, VersionCounter, WorkingGrid};
use crate::order::{ChainOrderId, Order, OrderIndices, OrderKind, OrderState, OrderUpdate, Side, SlotId};
use crate::persistence::{GridSnapshot, PersistenceStore};
use crate::reconciler::{reconcile, Action};
use crate::strategy::{
    assign_roles, compute_gap_slots, compute_initial_boundary, compute_reaction_caps, plan_side_rebalance, shift_boundary, side_budget,
    FillEvent, SideRebalanceInput, SideRebalancePlan,
};
use crate::sync::{sync_from_fill_history, FillHistoryEvent, FillOutcome, LockKey, ShadowLocks};

/// The rebalance pipeline's current phase, as an explicit enum rather than
/// a pair of raw booleans.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RebalancePhase {
    Normal,
    Rebalancing,
    Broadcasting,
}

/// Sub-phase of a broadcast: which action kind is currently in flight. Used
/// only for pipeline-health observability, not for control flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchPhase {
    Idle,
    Cancelling,
    Updating,
    Creating,
}

/// A count-based RAII suppression handle, replacing the source's
/// `_pauseFundRecalc`/`_pauseRecalcLogging` booleans.
#[derive(Debug, Default)]
pub struct PauseHandle {
    count: std::sync::atomic::AtomicU32,
}

impl PauseHandle {
    pub fn pause(&self) -> PauseGuard<'_> {
        self.count.fetch_add(1, Ordering::SeqCst);
        PauseGuard { handle: self }
    }

    pub fn is_paused(&self) -> bool {
        self.count.load(Ordering::SeqCst) > 0
    }
}

pub struct PauseGuard<'a> {
    handle: &'a PauseHandle,
}

impl Drop for PauseGuard<'_> {
    fn drop(&mut self) {
        self.handle.count.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Aggregate pipeline-health signals. `is_empty` decides whether the
/// pipeline is considered healthy.
#[derive(Debug, Clone, Default)]
pub struct PipelineHealth {
    pub fills_queued: usize,
    pub pending_price_corrections: usize,
    pub divergence_side_flags: BTreeSet<Side>,
    pub lock_leases_outstanding: usize,
    pub broadcast_in_flight: bool,
    pub retries: u32,
    pub recovery_in_flight: bool,
    pub blocked_since: Option<Instant>,
}

impl PipelineHealth {
    pub fn is_empty(&self) -> bool {
        self.fills_queued == 0
            && self.pending_price_corrections == 0
            && self.divergence_side_flags.is_empty()
            && self.lock_leases_outstanding == 0
            && !self.broadcast_in_flight
            && self.retries == 0
            && !self.recovery_in_flight
    }

    fn refresh_blocked_marker(&mut self) {
        if self.is_empty() {
            self.blocked_since = None;
        } else if self.blocked_since.is_none() {
            self.blocked_since = Some(Instant::now());
        }
    }

    /// Clears stuck corrections/flags once blocked past `timeout`, logging a
    /// warning, and returns whether it did so.
    pub fn clear_if_timed_out(&mut self, timeout: Duration) -> bool {
        if self.blocked_since.map(|since| since.elapsed() > timeout).unwrap_or(false) {
            warn!(?timeout, "pipeline health stuck beyond timeout, clearing corrections/flags");
            self.pending_price_corrections = 0;
            self.divergence_side_flags.clear();
            self.retries = 0;
            self.blocked_since = None;
            true
        } else {
            false
        }
    }
}

/// The outcome of [`GridManager::perform_safe_rebalance`].
pub struct RebalancePlan {
    pub actions: Vec<Action>,
    pub working_grid: WorkingGrid,
    pub target_boundary: usize,
    pub planning_duration: Duration,
    pub aborted: bool,
    pub reason: Option<String>,
}

/// The outcome of [`GridManager::commit_working_grid`].
#[derive(Debug, Clone)]
pub struct CommitOutcome {
    pub committed: bool,
    pub reason: Option<String>,
    pub new_version: Option<u64>,
    pub changed_slots: usize,
}

/// Orchestrates every other engine behind five non-reentrant mutexes, always
/// acquired in the fixed order `sync_lock -> grid_lock -> fund_lock`
/// (`fill_processing_lock`/`divergence_lock` are leaves).
pub struct GridManager {
    config: GridConfig,
    chain: Arc<dyn ChainClient>,
    store: Arc<dyn PersistenceStore>,

    grid: MasterGrid,
    version_counter: VersionCounter,
    accountant: AsyncMutex<Accountant>,
    shadow_locks: ShadowLocks,

    phase: AsyncMutex<RebalancePhase>,
    batch_phase: AsyncMutex<BatchPhase>,
    working: AsyncMutex<Option<Arc<SyncMutex<WorkingGrid>>>>,
    pipeline: AsyncMutex<PipelineHealth>,
    fund_recalc_pause: PauseHandle,
    side_doubled_flags: SyncMutex<BTreeSet<SlotId>>,

    sync_lock: AsyncMutex<()>,
    grid_lock: AsyncMutex<()>,
    fill_processing_lock: AsyncMutex<()>,
    divergence_lock: AsyncMutex<()>,

    asset_a_symbol: String,
    asset_b_symbol: String,
    fee_headroom: SyncMutex<SideAmounts>,
    bootstrapped: AtomicBool,
}

impl GridManager {
    /// Builds the initial frozen grid from `config`'s price bounds and
    /// `increment_percent`, with an initial boundary/role assignment and
    /// every slot a VIRTUAL SPREAD placeholder — real state is established
    /// by the first [`GridManager::run_open_orders_sync`].
    pub fn new(
        config: GridConfig,
        chain: Arc<dyn ChainClient>,
        store: Arc<dyn PersistenceStore>,
        assets: Arc<dyn AssetMetadata>,
    ) -> Result<Self, GridError> {
        config.validate().map_err(|e| GridError::Internal(e.to_string()))?;
        let asset_a = assets.lookup_asset(&config.market.asset_a_symbol)?;
        let asset_b = assets.lookup_asset(&config.market.asset_b_symbol)?;

        let mut orders = std::collections::BTreeMap::new();
        let mut price = config.market.lower_bound;
        let mut next_id = 0u64;
        let ratio = Decimal::ONE + config.market.increment_percent / Decimal::ONE_HUNDRED;
        while price <= config.market.upper_bound {
            let slot_id = SlotId(next_id);
            orders.insert(slot_id, Order::spread_placeholder(slot_id, price));
            next_id += 1;
            price *= ratio;
        }

        let gap_slots = compute_gap_slots(
            config.strategy.target_spread_percent,
            config.market.increment_percent,
            config.strategy.min_spread_orders,
            config.strategy.min_spread_factor,
        );

        let mut snapshot = MasterSnapshot { orders, indices: OrderIndices::default(), boundary_idx: 0, version: 1 };
        let rail = snapshot.rail();
        let boundary_idx = compute_initial_boundary(&snapshot, &rail, config.market.start_price, gap_slots);
        for (slot_id, kind) in assign_roles(&rail, boundary_idx, gap_slots) {
            if let Some(order) = snapshot.orders.get_mut(&slot_id) {
                order.kind = kind;
            }
        }
        snapshot.boundary_idx = boundary_idx;
        snapshot.indices = OrderIndices::repair(&snapshot.orders);

        info!(slots = snapshot.orders.len(), boundary_idx, gap_slots, "grid initialized");

        let version_counter = VersionCounter::default();
        version_counter.next();

        Ok(Self {
            grid: MasterGrid::new(snapshot),
            version_counter,
            accountant: AsyncMutex::new(Accountant::new()),
            shadow_locks: ShadowLocks::new(),
            phase: AsyncMutex::new(RebalancePhase::Normal),
            batch_phase: AsyncMutex::new(BatchPhase::Idle),
            working: AsyncMutex::new(None),
            pipeline: AsyncMutex::new(PipelineHealth::default()),
            fund_recalc_pause: PauseHandle::default(),
            side_doubled_flags: SyncMutex::new(BTreeSet::new()),
            sync_lock: AsyncMutex::new(()),
            grid_lock: AsyncMutex::new(()),
            fill_processing_lock: AsyncMutex::new(()),
            divergence_lock: AsyncMutex::new(()),
            asset_a_symbol: asset_a.symbol,
            asset_b_symbol: asset_b.symbol,
            fee_headroom: SyncMutex::new(SideAmounts::default()),
            bootstrapped: AtomicBool::new(false),
            config,
        })
    }

    pub fn grid(&self) -> &MasterGrid {
        &self.grid
    }

    pub fn config(&self) -> &GridConfig {
        &self.config
    }

    pub fn set_fee_headroom(&self, headroom: SideAmounts) {
        *self.fee_headroom.lock() = headroom;
    }

    fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.config.sync.lock_timeout_ms)
    }

    async fn acquire_grid_lock(&self) -> Result<tokio::sync::MutexGuard<'_, ()>, GridError> {
        tokio::time::timeout(self.lock_timeout(), self.grid_lock.lock())
            .await
            .map_err(|_| GridError::LockTimeout { lock: "grid_lock", waited_ms: self.lock_timeout().as_millis() as u64 })
    }

    async fn acquire_sync_lock(&self) -> Result<tokio::sync::MutexGuard<'_, ()>, GridError> {
        tokio::time::timeout(self.lock_timeout(), self.sync_lock.lock())
            .await
            .map_err(|_| GridError::LockTimeout { lock: "sync_lock", waited_ms: self.lock_timeout().as_millis() as u64 })
    }

    async fn acquire_fund_lock(&self) -> Result<tokio::sync::MutexGuard<'_, Accountant>, GridError> {
        tokio::time::timeout(self.lock_timeout(), self.accountant.lock())
            .await
            .map_err(|_| GridError::LockTimeout { lock: "fund_lock", waited_ms: self.lock_timeout().as_millis() as u64 })
    }

    async fn acquire_fill_processing_lock(&self) -> Result<tokio::sync::MutexGuard<'_, ()>, GridError> {
        tokio::time::timeout(self.lock_timeout(), self.fill_processing_lock.lock())
            .await
            .map_err(|_| GridError::LockTimeout { lock: "fill_processing_lock", waited_ms: self.lock_timeout().as_millis() as u64 })
    }

    #[allow(dead_code)]
    async fn acquire_divergence_lock(&self) -> Result<tokio::sync::MutexGuard<'_, ()>, GridError> {
        tokio::time::timeout(self.lock_timeout(), self.divergence_lock.lock())
            .await
            .map_err(|_| GridError::LockTimeout { lock: "divergence_lock", waited_ms: self.lock_timeout().as_millis() as u64 })
    }

    fn gap_slots(&self) -> usize {
        compute_gap_slots(
            self.config.strategy.target_spread_percent,
            self.config.market.increment_percent,
            self.config.strategy.min_spread_orders,
            self.config.strategy.min_spread_factor,
        )
    }

    fn allocated_caps(&self, totals: &AccountTotals) -> SideAmounts {
        let cap = |allocation: &Allocation, total: Decimal| match allocation {
            Allocation::Absolute { amount } => *amount,
            Allocation::PercentOfTotal { percent } => total * *percent / Decimal::ONE_HUNDRED,
        };
        SideAmounts {
            buy: cap(&self.config.funds.buy_allocation, totals.buy_total),
            sell: cap(&self.config.funds.sell_allocation, totals.sell_total),
        }
    }

    /// Recomputes the fund view from the current master, unless a
    /// [`PauseHandle::pause`] guard is currently held.
    pub async fn trigger_fund_recalculation(&self) -> Result<(), GridError> {
        if self.fund_recalc_pause.is_paused() {
            return Ok(());
        }
        let master = self.grid.load();
        let precision = self.config.market.asset_a_precision.max(self.config.market.asset_b_precision);
        let tolerance = ToleranceInputs { precision, relative_tolerance_bps: self.config.tolerances.relative_tolerance_bps };
        let fee_headroom = *self.fee_headroom.lock();

        let mut accountant = self.acquire_fund_lock().await?;
        let allocated = self.allocated_caps(&accountant.account_totals);
        accountant.recalculate_funds(&master, self.config.market.start_price, allocated, fee_headroom, tolerance);
        Ok(())
    }

    /// Plans a rebalance on a private working copy without ever mutating
    /// the master. Fills arriving mid-plan apply to
    /// the master directly (via [`GridManager::apply_master_slot_update`])
    /// and mark this working copy stale so the eventual commit is rejected.
    pub async fn perform_safe_rebalance(
        &self,
        fills: &[FillEvent],
        locked_slots: &BTreeSet<SlotId>,
        locked_chain_ids: &BTreeSet<ChainOrderId>,
    ) -> Result<RebalancePlan, GridError> {
        let started = Instant::now();

        let grid_guard = self.acquire_grid_lock().await?;
        *self.phase.lock().await = RebalancePhase::Rebalancing;
        let master = self.grid.load();
        let working_arc = Arc::new(SyncMutex::new(WorkingGrid::clone_from(&master)));
        *self.working.lock().await = Some(working_arc.clone());
        drop(grid_guard);

        let rail = master.rail();
        let gap_slots = self.gap_slots();
        let boundary = fills.iter().fold(master.boundary_idx, |b, f| shift_boundary(b, rail.len(), f));

        {
            let mut working = working_arc.lock();
            for (slot_id, kind) in assign_roles(&rail, boundary, gap_slots) {
                if let Some(existing) = working.get(slot_id) {
                    if existing.kind != kind {
                        let mut updated = existing.clone();
                        updated.kind = kind;
                        if kind == OrderKind::Spread {
                            updated.size = Decimal::ZERO;
                            updated.state = OrderState::Virtual;
                        }
                        working.set(updated);
                    }
                }
            }
        }

        let reaction_caps = compute_reaction_caps(fills);
        let available = { self.acquire_fund_lock().await?.funds.available };
        let current_spread = crate::strategy::current_spread_percent(&master);
        let fills_processed = !fills.is_empty();

        let buy_plan = plan_side_rebalance(SideRebalanceInput {
            side: Side::Buy,
            rail: &rail,
            master: &master,
            budget: side_budget(available, Side::Buy),
            increment_percent: self.config.market.increment_percent,
            dust_percent: self.config.strategy.dust_percent,
            reaction_cap: reaction_caps.buy,
            locked_slots,
            locked_chain_ids,
            target_spread_percent: self.config.strategy.target_spread_percent,
            current_spread_percent: current_spread,
            fills_processed,
        });
        let sell_plan = plan_side_rebalance(SideRebalanceInput {
            side: Side::Sell,
            rail: &rail,
            master: &master,
            budget: side_budget(available, Side::Sell),
            increment_percent: self.config.market.increment_percent,
            dust_percent: self.config.strategy.dust_percent,
            reaction_cap: reaction_caps.sell,
            locked_slots,
            locked_chain_ids,
            target_spread_percent: self.config.strategy.target_spread_percent,
            current_spread_percent: current_spread,
            fills_processed,
        });

        {
            let mut working = working_arc.lock();
            apply_side_plan(&mut working, Side::Buy, &buy_plan);
            apply_side_plan(&mut working, Side::Sell, &sell_plan);
        }

        let (target_map, is_stale) = {
            let working = working_arc.lock();
            (working.to_map(), working.is_stale_against(&self.grid))
        };

        *self.working.lock().await = None;
        if is_stale {
            *self.phase.lock().await = RebalancePhase::Normal;
            let working = Arc::try_unwrap(working_arc).map(|m| m.into_inner()).unwrap_or_else(|arc| arc.lock().clone());
            return Ok(RebalancePlan {
                actions: Vec::new(),
                working_grid: working,
                target_boundary: boundary,
                planning_duration: started.elapsed(),
                aborted: true,
                reason: Some("working grid became stale during planning".into()),
            });
        }

        let reconcile_result = reconcile(&master, &target_map, boundary);

        let mut required_increase = SideAmounts::default();
        for action in &reconcile_result.actions {
            if let Action::Create { side, size, .. } = action {
                required_increase.add(*side, *size);
            }
        }
        if required_increase.buy > available.buy || required_increase.sell > available.sell {
            *self.phase.lock().await = RebalancePhase::Normal;
            let working = Arc::try_unwrap(working_arc).map(|m| m.into_inner()).unwrap_or_else(|arc| arc.lock().clone());
            return Ok(RebalancePlan {
                actions: Vec::new(),
                working_grid: working,
                target_boundary: boundary,
                planning_duration: started.elapsed(),
                aborted: true,
                reason: Some("planned placements exceed available funds".into()),
            });
        }

        let working = Arc::try_unwrap(working_arc).map(|m| m.into_inner()).unwrap_or_else(|arc| arc.lock().clone());
        Ok(RebalancePlan {
            actions: reconcile_result.actions,
            working_grid: working,
            target_boundary: boundary,
            planning_duration: started.elapsed(),
            aborted: false,
            reason: None,
        })
    }

    /// Re-checks staleness under the grid lock, swaps the master, and
    /// recomputes indices fresh from the
    /// working grid rather than any pre-computed snapshot (it may have been
    /// refreshed by a concurrent sync).
    pub async fn commit_working_grid(&self, working: WorkingGrid, boundary: usize) -> Result<CommitOutcome, GridError> {
        if working.is_stale_against(&self.grid) {
            return Ok(CommitOutcome { committed: false, reason: Some("base version stale".into()), new_version: None, changed_slots: 0 });
        }

        let grid_guard = self.acquire_grid_lock().await?;
        if working.is_stale_against(&self.grid) {
            *self.working.lock().await = None;
            return Ok(CommitOutcome { committed: false, reason: Some("base version stale".into()), new_version: None, changed_slots: 0 });
        }

        let master = self.grid.load();
        let delta = working.build_delta(&master);
        if delta.is_empty() {
            return Ok(CommitOutcome { committed: true, reason: None, new_version: Some(master.version), changed_slots: 0 });
        }

        let new_version = self.version_counter.next();
        let orders = working.to_map();
        let indices = OrderIndices::repair(&orders);
        let clamped_boundary = boundary.min(orders.len().saturating_sub(1));
        self.grid.swap(MasterSnapshot { orders, indices, boundary_idx: clamped_boundary, version: new_version });
        drop(grid_guard);

        *self.phase.lock().await = RebalancePhase::Normal;
        *self.working.lock().await = None;
        self.trigger_fund_recalculation().await?;

        Ok(CommitOutcome { committed: true, reason: None, new_version: Some(new_version), changed_slots: delta.len() })
    }

    pub async fn begin_broadcast(&self) {
        *self.phase.lock().await = RebalancePhase::Broadcasting;
        *self.batch_phase.lock().await = BatchPhase::Idle;
        self.pipeline.lock().await.broadcast_in_flight = true;
    }

    pub async fn set_batch_phase(&self, phase: BatchPhase) {
        *self.batch_phase.lock().await = phase;
    }

    pub async fn end_broadcast(&self) {
        *self.batch_phase.lock().await = BatchPhase::Idle;
        self.pipeline.lock().await.broadcast_in_flight = false;
    }

    /// Broadcasts a committed action list against the chain client,
    /// cancellations first, then updates, then creates — so a side-flip's
    /// cancel always lands before its replacement create competes for the
    /// same capital. Each chain
    /// response is folded back into the master through
    /// [`Order::with_update`], which auto-corrects a phantom result rather
    /// than letting it reach the grid.
    pub async fn execute_actions(&self, actions: &[Action]) -> Result<Vec<IllegalStateSignal>, GridError> {
        self.begin_broadcast().await;
        let mut signals = Vec::new();

        self.set_batch_phase(BatchPhase::Cancelling).await;
        for action in actions {
            let Action::Cancel { slot_id, chain_order_id } = action else { continue };
            if let Err(e) = self.chain.cancel_order(chain_order_id).await {
                warn!(%slot_id, error = %e, "cancel_order failed");
                continue;
            }
            self.apply_execution_result(
                *slot_id,
                "cancel",
                OrderUpdate { kind: Some(OrderKind::Spread), state: Some(OrderState::Virtual), size: Some(Decimal::ZERO), clear_chain_id: true, ..Default::default() },
                &mut signals,
            )
            .await?;
        }

        self.set_batch_phase(BatchPhase::Updating).await;
        for action in actions {
            let Action::Update { slot_id, chain_order_id, new_price, new_size } = action else { continue };
            match self.chain.update_order(chain_order_id, *new_price, *new_size).await {
                Ok(_) => {
                    self.apply_execution_result(
                        *slot_id,
                        "update",
                        OrderUpdate { state: Some(OrderState::Active), size: Some(*new_size), ..Default::default() },
                        &mut signals,
                    )
                    .await?;
                }
                Err(e) => warn!(%slot_id, error = %e, "update_order failed"),
            }
        }

        self.set_batch_phase(BatchPhase::Creating).await;
        for action in actions {
            let Action::Create { slot_id, side, price, size } = action else { continue };
            match self.chain.create_order(*price, *size, *side == Side::Buy).await {
                Ok(result) => {
                    self.apply_execution_result(
                        *slot_id,
                        "create",
                        OrderUpdate {
                            state: Some(OrderState::Active),
                            size: Some(*size),
                            chain_order_id: Some(result.chain_order_id),
                            committed_side: Some(*side),
                            ..Default::default()
                        },
                        &mut signals,
                    )
                    .await?;
                }
                Err(e) => warn!(%slot_id, error = %e, "create_order failed"),
            }
        }

        self.end_broadcast().await;
        Ok(signals)
    }

    async fn apply_execution_result(
        &self,
        slot_id: SlotId,
        attempted: &str,
        update: OrderUpdate,
        signals: &mut Vec<IllegalStateSignal>,
    ) -> Result<(), GridError> {
        let Some(order) = self.grid.load().orders.get(&slot_id).cloned() else { return Ok(()) };
        let (updated, illegal) = order.with_update(update);
        if let Some(reason) = illegal {
            signals.push(IllegalStateSignal { slot_id, attempted: attempted.to_string(), reason });
        }
        self.apply_master_slot_update(slot_id, Some(updated)).await
    }

    pub async fn account_totals(&self) -> AccountTotals {
        self.accountant.lock().await.account_totals
    }

    pub async fn funds(&self) -> Funds {
        self.accountant.lock().await.funds
    }

    /// Seeds chain-reported account totals, normally set from an initial
    /// `get_on_chain_asset_balances` call.
    pub async fn seed_account_totals(&self, totals: AccountTotals) {
        self.accountant.lock().await.account_totals = totals;
    }

    /// Applies a single master-slot change outside the plan/commit
    /// pipeline (a confirmed fill, a divergence correction). If a
    /// rebalance is currently planning or broadcasting, marks that working
    /// grid stale and folds the new value into it so the next planning
    /// cycle starts from a correct baseline.
    pub async fn apply_master_slot_update(&self, slot_id: SlotId, new_order: Option<Order>) -> Result<(), GridError> {
        let grid_guard = self.acquire_grid_lock().await?;
        let master = self.grid.load();
        let mut orders = master.orders.clone();
        match &new_order {
            Some(order) => {
                orders.insert(slot_id, order.clone());
            }
            None => {
                orders.remove(&slot_id);
            }
        }
        let indices = OrderIndices::repair(&orders);
        let new_version = self.version_counter.next();
        self.grid.swap(MasterSnapshot { orders, indices, boundary_idx: master.boundary_idx, version: new_version });
        drop(grid_guard);

        let phase = *self.phase.lock().await;
        if phase != RebalancePhase::Normal {
            if let Some(working_arc) = self.working.lock().await.as_ref() {
                let master_after = self.grid.load();
                let mut working = working_arc.lock();
                working.mark_stale(format!("concurrent master mutation at {slot_id} during {phase:?}"));
                working.sync_from_master(&master_after, slot_id, new_version);
            }
        }
        Ok(())
    }

    /// Posts one fill-history event against the grid order it belongs to.
    pub async fn process_fill_history_event(
        &self,
        event: FillHistoryEvent,
        pays_side: Side,
        fee: Decimal,
        fee_is_native_asset: bool,
        other_side_precision: u32,
    ) -> Result<Option<FillOutcome>, GridError> {
        let _fill_guard = self.acquire_fill_processing_lock().await?;

        let master = self.grid.load();
        let found = master.orders.values().find(|o| o.chain_order_id.as_ref() == Some(&event.chain_order_id)).cloned();
        let Some(order) = found else {
            warn!(chain_order_id = %event.chain_order_id, "fill history event referenced unknown chain order");
            return Ok(None);
        };

        let was_doubled = self.side_doubled_flags.lock().contains(&order.slot_id);
        let outcome = sync_from_fill_history(&order, order.slot_id, &event, other_side_precision, was_doubled);

        {
            let mut accountant = self.acquire_fund_lock().await?;
            accountant.process_fill_accounting(FillOp {
                pays_side,
                pays_amount: event.pays_amount,
                receives_side: pays_side.opposite(),
                receives_amount_gross: event.receives_amount,
                fee,
                fee_is_native_asset,
            });
        }

        let mut updated = order.clone();
        if outcome.became_full {
            updated.kind = OrderKind::Spread;
            updated.state = OrderState::Virtual;
            updated.size = Decimal::ZERO;
            updated.chain_order_id = None;
            self.side_doubled_flags.lock().remove(&order.slot_id);
        } else {
            updated.size = outcome.new_size;
            updated.state = OrderState::Partial;
            self.side_doubled_flags.lock().remove(&order.slot_id);
        }
        self.apply_master_slot_update(order.slot_id, Some(updated)).await?;

        Ok(Some(outcome))
    }

    /// Runs the two-pass open-orders reconciliation under `sync_lock`,
    /// installing a shadow-lock lease over every potentially-affected
    /// slot/chain id for the duration, refreshed by a cooperative task at
    /// `lock_lease_ms / 3`.
    pub async fn run_open_orders_sync(
        self: &Arc<Self>,
        chain_orders: Vec<crate::sync::ParsedChainOrder>,
    ) -> Result<crate::sync::OpenOrdersSyncResult, GridError> {
        let _sync_guard = self.acquire_sync_lock().await?;

        let master = self.grid.load();
        let lease_keys: Vec<LockKey> = master
            .orders
            .keys()
            .map(|id| LockKey::Slot(*id))
            .chain(master.orders.values().filter_map(|o| o.chain_order_id.clone()).map(LockKey::Chain))
            .collect();
        let ttl = Duration::from_millis(self.config.sync.lock_lease_ms);
        self.shadow_locks.acquire_many(lease_keys.clone(), ttl);
        self.pipeline.lock().await.lock_leases_outstanding = lease_keys.len();

        let refresh_interval = ttl / 3;
        let refresher_mgr = self.clone();
        let refresher_keys = lease_keys.clone();
        let refresher = tokio::spawn(async move {
            loop {
                tokio::time::sleep(refresh_interval).await;
                for key in &refresher_keys {
                    refresher_mgr.shadow_locks.refresh(key, ttl);
                }
            }
        });

        let precision_a = self.config.market.asset_a_precision;
        let precision_b = self.config.market.asset_b_precision;
        let result = crate::sync::sync_from_open_orders(
            &master.orders,
            &chain_orders,
            |side| if side == Side::Sell { precision_a } else { precision_b },
            |_slot_id| Decimal::ZERO,
            self.config.market.increment_percent,
        );

        refresher.abort();
        for key in &lease_keys {
            self.shadow_locks.release(key);
        }
        self.pipeline.lock().await.lock_leases_outstanding = 0;
        self.pipeline.lock().await.pending_price_corrections = result.orders_needing_price_correction.len();

        for (slot_id, order) in &result.slot_updates {
            self.apply_master_slot_update(*slot_id, Some(order.clone())).await?;
        }
        self.trigger_fund_recalculation().await?;

        Ok(result)
    }

    /// Persistence gate: no phantom orders, account totals initialized,
    /// fund drift within tolerance. Skipped entirely before
    /// the first successful sync (`bootstrapped == false`).
    pub fn validate_grid_for_persistence(&self, master: &MasterSnapshot, accountant: &Accountant) -> Result<(), String> {
        if !self.bootstrapped.load(Ordering::SeqCst) {
            return Ok(());
        }
        for order in master.orders.values() {
            if order.is_phantom() {
                return Err(format!("phantom order present at {}", order.slot_id));
            }
        }
        if accountant.account_totals.buy_total.is_zero() && accountant.account_totals.sell_total.is_zero() {
            return Err("account totals not initialized".into());
        }
        if let Some(failure) = &accountant.last_accounting_failure {
            return Err(format!("fund drift outside tolerance: {}", failure.description));
        }
        Ok(())
    }

    pub async fn persist_snapshot(&self, key: &str) -> Result<(), GridError> {
        let master = self.grid.load();
        let accountant = self.acquire_fund_lock().await?;
        self.validate_grid_for_persistence(&master, &accountant).map_err(GridError::Internal)?;

        let snapshot = GridSnapshot {
            orders: master.orders.clone(),
            boundary_idx: master.boundary_idx,
            cache_funds: accountant.funds.cache_funds,
            bts_fees_owed: accountant.funds.bts_fees_owed,
            asset_a_symbol: self.asset_a_symbol.clone(),
            asset_b_symbol: self.asset_b_symbol.clone(),
            account_totals: accountant.account_totals,
            side_doubled_flags: self.side_doubled_flags.lock().iter().copied().collect(),
        };
        drop(accountant);
        self.store.save_grid_snapshot(key, snapshot).await
    }

    pub fn mark_bootstrapped(&self) {
        self.bootstrapped.store(true, Ordering::SeqCst);
    }

    pub async fn pipeline_health(&self) -> PipelineHealth {
        let mut health = self.pipeline.lock().await;
        health.refresh_blocked_marker();
        health.clone()
    }

    pub async fn clear_stuck_pipeline(&self) -> bool {
        self.pipeline.lock().await.clear_if_timed_out(Duration::from_millis(self.config.sync.pipeline_timeout_ms))
    }

    pub fn chain(&self) -> &Arc<dyn ChainClient> {
        &self.chain
    }
}

/// Installs steps 6-9 of a per-side rebalance plan into the working grid
/// (dust/non-dust partial handling, rotations, placements — cancellations
/// are left to [`reconcile`] comparing master-vs-target, since a slot
/// stays a surplus on chain until its cancel confirms).
fn apply_side_plan(working: &mut WorkingGrid, side: Side, plan: &SideRebalancePlan) {
    for (slot_id, new_size) in &plan.dust_partial_updates {
        if let Some(existing) = working.get(*slot_id).cloned() {
            let mut updated = existing;
            updated.size = *new_size;
            working.set(updated);
        }
    }

    for (slot_id, new_size, adjacent) in &plan.non_dust_partial_updates {
        let old_size = working.get(*slot_id).map(|o| o.size);
        if let (Some(old_size), Some(existing)) = (old_size, working.get(*slot_id).cloned()) {
            let mut updated = existing;
            updated.size = *new_size;
            working.set(updated);

            if let Some(adj_slot) = adjacent {
                if let Some(adj) = working.get(*adj_slot).cloned() {
                    if adj.state == OrderState::Virtual && adj.chain_order_id.is_none() {
                        let mut fresh = adj;
                        fresh.kind = if side == Side::Buy { OrderKind::Buy } else { OrderKind::Sell };
                        fresh.size = old_size;
                        fresh.committed_side = Some(side);
                        working.set(fresh);
                    }
                }
            }
        }
    }

    for rotation in &plan.rotations {
        if let Some(surplus) = working.get(rotation.from_slot).cloned() {
            let mut cleared = surplus;
            cleared.kind = OrderKind::Spread;
            cleared.state = OrderState::Virtual;
            cleared.size = Decimal::ZERO;
            cleared.chain_order_id = None;
            working.set(cleared);
        }
        if let Some(target) = working.get(rotation.to_slot).cloned() {
            let mut intended = target;
            intended.kind = if side == Side::Buy { OrderKind::Buy } else { OrderKind::Sell };
            intended.size = rotation.size;
            intended.state = OrderState::Virtual;
            intended.committed_side = Some(side);
            working.set(intended);
        }
    }

    for (slot_id, size) in &plan.placements {
        if let Some(existing) = working.get(*slot_id).cloned() {
            let mut intended = existing;
            intended.kind = if side == Side::Buy { OrderKind::Buy } else { OrderKind::Sell };
            intended.size = *size;
            intended.state = OrderState::Virtual;
            intended.committed_side = Some(side);
            working.set(intended);
        }
    }
}
