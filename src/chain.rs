//! The blockchain RPC client interface. The concrete
//! implementation — submitting transactions, streaming fills — is an
//! external collaborator out of scope for this crate.

use async_trait::async_trait;
use rust_decimal::Decimal;

use crate::error::GridError;
use crate::order::ChainOrderId;
use crate::sync::{FillHistoryEvent, ParsedChainOrder};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AssetBalance {
    pub total: Decimal,
    pub free: Decimal,
}

#[derive(Debug, Clone)]
pub struct CreateOrderResult {
    pub chain_order_id: ChainOrderId,
    pub create_fee: Decimal,
    /// Set if the chain only partially placed the requested size.
    pub partial_placement: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct UpdateOrderResult {
    pub update_fee: Decimal,
}

/// Chain RPC surface consumed by the sync engine and reconciler execution.
/// Implementors are expected to translate transport
/// failures into [`GridError::ChainRpc`].
#[async_trait]
pub trait ChainClient: Send + Sync {
    async fn read_open_orders(&self, account: &str, asset_a_id: &str, asset_b_id: &str) -> Result<Vec<ParsedChainOrder>, GridError>;

    async fn get_on_chain_asset_balances(&self, account: &str, asset_ids: &[String]) -> Result<std::collections::HashMap<String, AssetBalance>, GridError>;

    async fn create_order(&self, price: Decimal, size: Decimal, is_buy: bool) -> Result<CreateOrderResult, GridError>;

    async fn update_order(&self, chain_order_id: &ChainOrderId, new_price: Decimal, new_size: Decimal) -> Result<UpdateOrderResult, GridError>;

    async fn cancel_order(&self, chain_order_id: &ChainOrderId) -> Result<(), GridError>;

    /// Pulls the next batch of fill-history events since the last cursor,
    /// returning the opaque cursor to resume from on the next call.
    async fn poll_fill_history(&self, since_id: Option<&str>) -> Result<(Vec<FillHistoryEvent>, Option<String>), GridError>;
}
