//! Grid engine configuration.
//!
//! This crate does not load TOML/env files itself — that's the host
//! binary's job — but it defines the validated, serde-shaped config tree
//! the host is expected to deserialize
//! into and hand to [`crate::manager::GridManager`].

use anyhow::{bail, Result};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Top-level grid engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GridConfig {
    pub market: MarketConfig,
    pub funds: FundsConfig,
    pub strategy: StrategyConfig,
    #[serde(default)]
    pub tolerances: ToleranceConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub monitoring: MonitoringConfig,
}

/// Market pair and precision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketConfig {
    pub asset_a_symbol: String,
    pub asset_b_symbol: String,
    pub asset_a_precision: u32,
    pub asset_b_precision: u32,
    pub start_price: Decimal,
    pub lower_bound: Decimal,
    pub upper_bound: Decimal,
    pub increment_percent: Decimal,
}

/// Per-side fund allocation caps, absolute or percentage-of-total.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FundsConfig {
    #[serde(default)]
    pub buy_allocation: Allocation,
    #[serde(default)]
    pub sell_allocation: Allocation,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Allocation {
    Absolute { amount: Decimal },
    PercentOfTotal { percent: Decimal },
}

impl Default for Allocation {
    fn default() -> Self {
        Allocation::PercentOfTotal { percent: Decimal::ONE_HUNDRED }
    }
}

/// Boundary-crawl strategy parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyConfig {
    pub target_spread_percent: Decimal,
    #[serde(default = "default_dust_percent")]
    pub dust_percent: Decimal,
    #[serde(default = "default_min_spread_orders")]
    pub min_spread_orders: usize,
    #[serde(default = "default_min_spread_factor")]
    pub min_spread_factor: Decimal,
}

fn default_dust_percent() -> Decimal {
    Decimal::new(10, 0) // 10%
}
fn default_min_spread_orders() -> usize {
    2
}
fn default_min_spread_factor() -> Decimal {
    Decimal::new(2, 0)
}

/// Accounting tolerances.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToleranceConfig {
    #[serde(default = "default_relative_tolerance_bps")]
    pub relative_tolerance_bps: Decimal,
}

fn default_relative_tolerance_bps() -> Decimal {
    Decimal::new(10, 0) // 0.1%
}

impl Default for ToleranceConfig {
    fn default() -> Self {
        Self { relative_tolerance_bps: default_relative_tolerance_bps() }
    }
}

/// Sync engine timing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,
    #[serde(default = "default_pipeline_timeout_ms")]
    pub pipeline_timeout_ms: u64,
    /// TTL for a shadow-lock lease held over a sync pass, refreshed at
    /// roughly a third of this interval.
    #[serde(default = "default_lock_lease_ms")]
    pub lock_lease_ms: u64,
}

fn default_lock_timeout_ms() -> u64 {
    5_000
}
fn default_pipeline_timeout_ms() -> u64 {
    30_000
}
fn default_lock_lease_ms() -> u64 {
    15_000
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            lock_timeout_ms: default_lock_timeout_ms(),
            pipeline_timeout_ms: default_pipeline_timeout_ms(),
            lock_lease_ms: default_lock_lease_ms(),
        }
    }
}

/// Metrics/HTTP exporter configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitoringConfig {
    #[serde(default)]
    pub metrics_enabled: bool,
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
}

fn default_listen_addr() -> String {
    "127.0.0.1:9898".to_string()
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self { metrics_enabled: false, listen_addr: default_listen_addr() }
    }
}

impl GridConfig {
    /// Rejects configurations that would violate an engine invariant before
    /// the manager ever touches them.
    pub fn validate(&self) -> Result<()> {
        if self.market.asset_a_symbol.trim().is_empty() || self.market.asset_b_symbol.trim().is_empty() {
            bail!("market asset symbols must not be empty");
        }
        if self.market.asset_a_symbol == self.market.asset_b_symbol {
            bail!("asset_a_symbol and asset_b_symbol must differ");
        }
        if self.market.lower_bound <= Decimal::ZERO || self.market.upper_bound <= Decimal::ZERO {
            bail!("grid price bounds must be positive");
        }
        if self.market.lower_bound >= self.market.upper_bound {
            bail!("lower_bound must be strictly less than upper_bound");
        }
        if !(self.market.lower_bound..=self.market.upper_bound).contains(&self.market.start_price) {
            bail!("start_price must fall within [lower_bound, upper_bound]");
        }
        if self.market.increment_percent <= Decimal::ZERO {
            bail!("increment_percent must be positive");
        }
        if self.strategy.target_spread_percent <= Decimal::ZERO {
            bail!("target_spread_percent must be positive");
        }
        if self.strategy.dust_percent <= Decimal::ZERO || self.strategy.dust_percent >= Decimal::ONE_HUNDRED {
            bail!("dust_percent must be in (0, 100)");
        }
        if self.strategy.min_spread_orders == 0 {
            bail!("min_spread_orders must be at least 1");
        }
        if self.tolerances.relative_tolerance_bps < Decimal::ZERO {
            bail!("relative_tolerance_bps must not be negative");
        }
        if let Allocation::PercentOfTotal { percent } = &self.funds.buy_allocation {
            if *percent <= Decimal::ZERO || *percent > Decimal::ONE_HUNDRED {
                bail!("buy_allocation percent must be in (0, 100]");
            }
        }
        if let Allocation::PercentOfTotal { percent } = &self.funds.sell_allocation {
            if *percent <= Decimal::ZERO || *percent > Decimal::ONE_HUNDRED {
                bail!("sell_allocation percent must be in (0, 100]");
            }
        }
        Ok(())
    }

    /// A minimal, valid configuration for unit and scenario tests.
    #[cfg(any(test, feature = "test-util"))]
    pub fn for_testing() -> Self {
        use rust_decimal_macros::dec;
        Self {
            market: MarketConfig {
                asset_a_symbol: "A".into(),
                asset_b_symbol: "B".into(),
                asset_a_precision: 5,
                asset_b_precision: 5,
                start_price: dec!(1.00),
                lower_bound: dec!(0.90),
                upper_bound: dec!(1.10),
                increment_percent: dec!(1.0),
            },
            funds: FundsConfig {
                buy_allocation: Allocation::PercentOfTotal { percent: Decimal::ONE_HUNDRED },
                sell_allocation: Allocation::PercentOfTotal { percent: Decimal::ONE_HUNDRED },
            },
            strategy: StrategyConfig {
                target_spread_percent: dec!(2.0),
                dust_percent: default_dust_percent(),
                min_spread_orders: default_min_spread_orders(),
                min_spread_factor: default_min_spread_factor(),
            },
            tolerances: ToleranceConfig::default(),
            sync: SyncConfig::default(),
            monitoring: MonitoringConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_test_config_validates() {
        assert!(GridConfig::for_testing().validate().is_ok());
    }

    #[test]
    fn rejects_inverted_bounds() {
        let mut cfg = GridConfig::for_testing();
        cfg.market.lower_bound = cfg.market.upper_bound;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_same_asset_on_both_sides() {
        let mut cfg = GridConfig::for_testing();
        cfg.market.asset_b_symbol = cfg.market.asset_a_symbol.clone();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_zero_dust_percent() {
        let mut cfg = GridConfig::for_testing();
        cfg.strategy.dust_percent = Decimal::ZERO;
        assert!(cfg.validate().is_err());
    }
}
