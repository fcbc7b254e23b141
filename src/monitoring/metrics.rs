//! Prometheus metrics for the grid engine.
//!
//! Structured as sub-registries by concern — grid geometry, fund state,
//! sync passes, and rebalance cycles each get their own metric family
//! group under one `gridkeep_` namespace.

use std::sync::Arc;

use prometheus::{Gauge, GaugeVec, Histogram, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry};
use tracing::info;

/// Central registry for all grid-engine Prometheus metrics.
#[derive(Clone)]
pub struct GridMetricsRegistry {
    registry: Arc<Registry>,
    grid: Arc<GridMetrics>,
    fund: Arc<FundMetrics>,
    sync: Arc<SyncMetrics>,
    rebalance: Arc<RebalanceMetrics>,
}

impl GridMetricsRegistry {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Arc::new(Registry::new());
        let grid = Arc::new(GridMetrics::new(&registry)?);
        let fund = Arc::new(FundMetrics::new(&registry)?);
        let sync = Arc::new(SyncMetrics::new(&registry)?);
        let rebalance = Arc::new(RebalanceMetrics::new(&registry)?);

        info!("grid metrics registry initialized");
        Ok(Self { registry, grid, fund, sync, rebalance })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn grid(&self) -> &GridMetrics {
        &self.grid
    }

    pub fn fund(&self) -> &FundMetrics {
        &self.fund
    }

    pub fn sync(&self) -> &SyncMetrics {
        &self.sync
    }

    pub fn rebalance(&self) -> &RebalanceMetrics {
        &self.rebalance
    }
}

impl Default for GridMetricsRegistry {
    fn default() -> Self {
        Self::new().unwrap_or_else(|e| {
            tracing::error!("failed to create grid metrics registry: {}", e);
            panic!("cannot create grid metrics registry")
        })
    }
}

/// Grid geometry and slot-count metrics.
pub struct GridMetrics {
    pub grid_version: IntGauge,
    pub boundary_idx: IntGauge,
    pub orders_by_state_and_side: IntGaugeVec,
}

impl GridMetrics {
    fn new(registry: &Registry) -> Result<Self, prometheus::Error> {
        let grid_version = IntGauge::new("gridkeep_grid_version", "Monotone master grid version counter")?;
        registry.register(Box::new(grid_version.clone()))?;

        let boundary_idx = IntGauge::new("gridkeep_boundary_idx", "Index of the last BUY slot on the rail")?;
        registry.register(Box::new(boundary_idx.clone()))?;

        let orders_by_state_and_side = IntGaugeVec::new(
            Opts::new("gridkeep_orders_by_state_and_side", "Order count by lifecycle state and side").namespace("gridkeep"),
            &["state", "side"],
        )?;
        registry.register(Box::new(orders_by_state_and_side.clone()))?;

        Ok(Self { grid_version, boundary_idx, orders_by_state_and_side })
    }
}

/// Fund-accounting metrics, one gauge family per fund sub-total.
pub struct FundMetrics {
    pub available: GaugeVec,
    pub committed_chain: GaugeVec,
    pub committed_grid: GaugeVec,
    pub virtual_amounts: GaugeVec,
    pub cache_funds: GaugeVec,
    pub bts_fees_owed: Gauge,
    pub fund_drift: GaugeVec,
}

impl FundMetrics {
    fn new(registry: &Registry) -> Result<Self, prometheus::Error> {
        let available = GaugeVec::new(Opts::new("gridkeep_funds_available", "Available capital by side").namespace("gridkeep"), &["side"])?;
        registry.register(Box::new(available.clone()))?;

        let committed_chain = GaugeVec::new(Opts::new("gridkeep_funds_committed_chain", "On-chain committed capital by side").namespace("gridkeep"), &["side"])?;
        registry.register(Box::new(committed_chain.clone()))?;

        let committed_grid = GaugeVec::new(Opts::new("gridkeep_funds_committed_grid", "Grid-view committed capital by side").namespace("gridkeep"), &["side"])?;
        registry.register(Box::new(committed_grid.clone()))?;

        let virtual_amounts = GaugeVec::new(Opts::new("gridkeep_funds_virtual", "Virtual (not on chain) capital by side").namespace("gridkeep"), &["side"])?;
        registry.register(Box::new(virtual_amounts.clone()))?;

        let cache_funds = GaugeVec::new(Opts::new("gridkeep_funds_cache", "Fill-proceeds cache pool by side").namespace("gridkeep"), &["side"])?;
        registry.register(Box::new(cache_funds.clone()))?;

        let bts_fees_owed = Gauge::new("gridkeep_funds_bts_fees_owed", "Accrued native fee-asset fees awaiting settlement")?;
        registry.register(Box::new(bts_fees_owed.clone()))?;

        let fund_drift = GaugeVec::new(Opts::new("gridkeep_funds_drift", "Absolute drift between account totals and grid view, by side").namespace("gridkeep"), &["side"])?;
        registry.register(Box::new(fund_drift.clone()))?;

        Ok(Self { available, committed_chain, committed_grid, virtual_amounts, cache_funds, bts_fees_owed, fund_drift })
    }
}

/// Sync-pass metrics.
pub struct SyncMetrics {
    pub pass_duration_seconds: Histogram,
    pub orders_needing_price_correction: IntGauge,
    pub phantom_orders_corrected_total: IntCounter,
    pub parse_errors_total: IntCounterVec,
}

impl SyncMetrics {
    fn new(registry: &Registry) -> Result<Self, prometheus::Error> {
        let pass_duration_seconds = Histogram::with_opts(
            HistogramOpts::new("gridkeep_sync_pass_duration_seconds", "Open-orders/fill-history sync pass duration")
                .namespace("gridkeep")
                .buckets(vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5]),
        )?;
        registry.register(Box::new(pass_duration_seconds.clone()))?;

        let orders_needing_price_correction = IntGauge::new("gridkeep_sync_orders_needing_price_correction", "Orders currently flagged for a price correction")?;
        registry.register(Box::new(orders_needing_price_correction.clone()))?;

        let phantom_orders_corrected_total = IntCounter::new("gridkeep_sync_phantom_orders_corrected_total", "Phantom orders auto-downgraded to VIRTUAL")?;
        registry.register(Box::new(phantom_orders_corrected_total.clone()))?;

        let parse_errors_total = IntCounterVec::new(
            Opts::new("gridkeep_sync_parse_errors_total", "Malformed chain records skipped during sync").namespace("gridkeep"),
            &["source"],
        )?;
        registry.register(Box::new(parse_errors_total.clone()))?;

        Ok(Self { pass_duration_seconds, orders_needing_price_correction, phantom_orders_corrected_total, parse_errors_total })
    }
}

/// Rebalance-cycle metrics.
pub struct RebalanceMetrics {
    pub duration_seconds: Histogram,
    pub actions_emitted_total: IntCounterVec,
    pub stale_commit_rejected_total: IntCounter,
}

impl RebalanceMetrics {
    fn new(registry: &Registry) -> Result<Self, prometheus::Error> {
        let duration_seconds = Histogram::with_opts(
            HistogramOpts::new("gridkeep_rebalance_duration_seconds", "Plan-to-commit rebalance cycle duration")
                .namespace("gridkeep")
                .buckets(vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0]),
        )?;
        registry.register(Box::new(duration_seconds.clone()))?;

        let actions_emitted_total = IntCounterVec::new(
            Opts::new("gridkeep_rebalance_actions_emitted_total", "Reconciler actions emitted by kind").namespace("gridkeep"),
            &["kind"],
        )?;
        registry.register(Box::new(actions_emitted_total.clone()))?;

        let stale_commit_rejected_total = IntCounter::new("gridkeep_rebalance_stale_commit_rejected_total", "Commits rejected for a stale working grid")?;
        registry.register(Box::new(stale_commit_rejected_total.clone()))?;

        Ok(Self { duration_seconds, actions_emitted_total, stale_commit_rejected_total })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_registers_every_sub_family_without_name_collisions() {
        let registry = GridMetricsRegistry::new().unwrap();
        registry.grid().grid_version.set(5);
        registry.fund().bts_fees_owed.set(1.5);
        registry.sync().phantom_orders_corrected_total.inc();
        registry.rebalance().stale_commit_rejected_total.inc();
        assert!(!registry.registry().gather().is_empty());
    }
}
