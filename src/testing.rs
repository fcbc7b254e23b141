//! In-memory mock implementations of the external collaborator traits,
//! used by the manager/strategy/sync-engine test suites. Plain structs
//! over `parking_lot`-guarded state with builder-style setup methods,
//! programmed before the system under test runs rather than stubbed
//! per-call.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use rust_decimal::Decimal;

use crate::assets::{AssetInfo, AssetMetadata};
use crate::chain::{AssetBalance, ChainClient, CreateOrderResult, UpdateOrderResult};
use crate::error::GridError;
use crate::order::ChainOrderId;
use crate::persistence::{GridSnapshot, PersistedAssets, PersistenceStore};
use crate::sync::{FillHistoryEvent, ParsedChainOrder};

/// A programmable [`ChainClient`]. Open orders, balances, and fill-history
/// events are queued up front; `create_order` assigns ids from a counter so
/// tests can assert on deterministic handles.
#[derive(Default)]
pub struct MockChainClient {
    open_orders: Mutex<Vec<ParsedChainOrder>>,
    balances: Mutex<HashMap<String, AssetBalance>>,
    fill_queue: Mutex<VecDeque<FillHistoryEvent>>,
    next_order_id: AtomicU64,
    created: Mutex<Vec<(Decimal, Decimal, bool)>>,
    updated: Mutex<Vec<(ChainOrderId, Decimal, Decimal)>>,
    cancelled: Mutex<Vec<ChainOrderId>>,
    fail_next_create: Mutex<bool>,
}

impl MockChainClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_open_orders(&self, orders: Vec<ParsedChainOrder>) {
        *self.open_orders.lock() = orders;
    }

    pub fn set_balance(&self, asset_id: &str, total: Decimal, free: Decimal) {
        self.balances.lock().insert(asset_id.to_string(), AssetBalance { total, free });
    }

    pub fn push_fill(&self, event: FillHistoryEvent) {
        self.fill_queue.lock().push_back(event);
    }

    pub fn fail_next_create_order(&self) {
        *self.fail_next_create.lock() = true;
    }

    pub fn created_orders(&self) -> Vec<(Decimal, Decimal, bool)> {
        self.created.lock().clone()
    }

    pub fn updated_orders(&self) -> Vec<(ChainOrderId, Decimal, Decimal)> {
        self.updated.lock().clone()
    }

    pub fn cancelled_orders(&self) -> Vec<ChainOrderId> {
        self.cancelled.lock().clone()
    }
}

#[async_trait]
impl ChainClient for MockChainClient {
    async fn read_open_orders(&self, _account: &str, _asset_a_id: &str, _asset_b_id: &str) -> Result<Vec<ParsedChainOrder>, GridError> {
        Ok(self.open_orders.lock().clone())
    }

    async fn get_on_chain_asset_balances(&self, _account: &str, asset_ids: &[String]) -> Result<HashMap<String, AssetBalance>, GridError> {
        let balances = self.balances.lock();
        Ok(asset_ids
            .iter()
            .filter_map(|id| balances.get(id).map(|b| (id.clone(), *b)))
            .collect())
    }

    async fn create_order(&self, price: Decimal, size: Decimal, is_buy: bool) -> Result<CreateOrderResult, GridError> {
        if std::mem::take(&mut *self.fail_next_create.lock()) {
            return Err(GridError::ChainRpc("mock create_order configured to fail".into()));
        }
        self.created.lock().push((price, size, is_buy));
        let id = self.next_order_id.fetch_add(1, Ordering::SeqCst);
        Ok(CreateOrderResult {
            chain_order_id: ChainOrderId(format!("mock-{id}")),
            create_fee: Decimal::ZERO,
            partial_placement: false,
        })
    }

    async fn update_order(&self, chain_order_id: &ChainOrderId, new_price: Decimal, new_size: Decimal) -> Result<UpdateOrderResult, GridError> {
        self.updated.lock().push((chain_order_id.clone(), new_price, new_size));
        Ok(UpdateOrderResult { update_fee: Decimal::ZERO })
    }

    async fn cancel_order(&self, chain_order_id: &ChainOrderId) -> Result<(), GridError> {
        self.cancelled.lock().push(chain_order_id.clone());
        Ok(())
    }

    async fn poll_fill_history(&self, _since_id: Option<&str>) -> Result<(Vec<FillHistoryEvent>, Option<String>), GridError> {
        let mut queue = self.fill_queue.lock();
        let batch: Vec<FillHistoryEvent> = queue.drain(..).collect();
        let cursor = batch.last().map(|e| e.history_id.clone());
        Ok((batch, cursor))
    }
}

/// An in-memory [`PersistenceStore`] that records the last snapshot saved
/// under each key, for assertions in manager-level tests.
#[derive(Default)]
pub struct MockPersistenceStore {
    snapshots: Mutex<BTreeMap<String, GridSnapshot>>,
    persisted_assets: Mutex<BTreeMap<String, PersistedAssets>>,
}

impl MockPersistenceStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seed_persisted_assets(&self, key: &str, assets: PersistedAssets) {
        self.persisted_assets.lock().insert(key.to_string(), assets);
    }

    pub fn last_snapshot(&self, key: &str) -> Option<GridSnapshot> {
        self.snapshots.lock().get(key).cloned()
    }
}

#[async_trait]
impl PersistenceStore for MockPersistenceStore {
    async fn save_grid_snapshot(&self, key: &str, snapshot: GridSnapshot) -> Result<(), GridError> {
        self.snapshots.lock().insert(key.to_string(), snapshot);
        Ok(())
    }

    async fn load_persisted_assets(&self, key: &str) -> Result<Option<PersistedAssets>, GridError> {
        Ok(self.persisted_assets.lock().get(key).cloned())
    }

    async fn update_cache_funds(&self, key: &str, cache_funds: crate::accountant::SideAmounts) -> Result<(), GridError> {
        if let Some(snapshot) = self.snapshots.lock().get_mut(key) {
            snapshot.cache_funds = cache_funds;
        }
        Ok(())
    }

    async fn update_bts_fees_owed(&self, key: &str, amount: Decimal) -> Result<(), GridError> {
        if let Some(snapshot) = self.snapshots.lock().get_mut(key) {
            snapshot.bts_fees_owed = amount;
        }
        Ok(())
    }
}

/// A static [`AssetMetadata`] backed by a fixed table, seeded up front.
#[derive(Default)]
pub struct StaticAssetMetadata {
    table: HashMap<String, AssetInfo>,
}

impl StaticAssetMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_asset(mut self, symbol: &str, id: &str, precision: u32) -> Self {
        self.table.insert(symbol.to_string(), AssetInfo { id: id.to_string(), symbol: symbol.to_string(), precision });
        self
    }
}

impl AssetMetadata for StaticAssetMetadata {
    fn lookup_asset(&self, symbol: &str) -> Result<AssetInfo, GridError> {
        self.table
            .get(symbol)
            .cloned()
            .ok_or_else(|| GridError::Parse { context: "asset lookup", reason: format!("unknown symbol {symbol}") })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn mock_chain_client_records_created_orders() {
        let client = MockChainClient::new();
        let result = client.create_order(dec!(1.0), dec!(10), true).await.unwrap();
        assert_eq!(result.chain_order_id, ChainOrderId("mock-0".into()));
        assert_eq!(client.created_orders(), vec![(dec!(1.0), dec!(10), true)]);
    }

    #[tokio::test]
    async fn mock_chain_client_honors_scripted_failure() {
        let client = MockChainClient::new();
        client.fail_next_create_order();
        assert!(client.create_order(dec!(1.0), dec!(10), true).await.is_err());
        // The failure is consumed; the next call succeeds.
        assert!(client.create_order(dec!(1.0), dec!(10), true).await.is_ok());
    }

    #[test]
    fn static_asset_metadata_resolves_seeded_symbols() {
        let metadata = StaticAssetMetadata::new().with_asset("A", "1.3.100", 5);
        let info = metadata.lookup_asset("A").unwrap();
        assert_eq!(info.precision, 5);
        assert!(metadata.lookup_asset("Z").is_err());
    }
}
