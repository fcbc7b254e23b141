//! The grid snapshot persistence store interface. The
//! concrete implementation — a database, a file, an object store — is an
//! external collaborator out of scope for this crate.

use std::collections::BTreeMap;

use async_trait::async_trait;
use rust_decimal::Decimal;

use crate::accountant::SideAmounts;
use crate::error::GridError;
use crate::order::{Order, SlotId};

/// Everything the manager needs restored to resume a grid across a restart.
#[derive(Debug, Clone)]
pub struct GridSnapshot {
    pub orders: BTreeMap<SlotId, Order>,
    pub boundary_idx: usize,
    pub cache_funds: SideAmounts,
    pub bts_fees_owed: Decimal,
    pub asset_a_symbol: String,
    pub asset_b_symbol: String,
    pub account_totals: crate::accountant::AccountTotals,
    /// Slots currently flagged "doubled" by a dust-partial rotation.
    pub side_doubled_flags: Vec<SlotId>,
}

/// Asset symbols persisted alongside a snapshot, used as a fallback when
/// live asset-metadata lookup fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistedAssets {
    pub asset_a: String,
    pub asset_b: String,
}

/// Persistence surface consumed by the manager's persistence gate.
#[async_trait]
pub trait PersistenceStore: Send + Sync {
    async fn save_grid_snapshot(&self, key: &str, snapshot: GridSnapshot) -> Result<(), GridError>;

    async fn load_persisted_assets(&self, key: &str) -> Result<Option<PersistedAssets>, GridError>;

    async fn update_cache_funds(&self, key: &str, cache_funds: SideAmounts) -> Result<(), GridError>;

    async fn update_bts_fees_owed(&self, key: &str, amount: Decimal) -> Result<(), GridError>;
}
