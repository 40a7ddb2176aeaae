use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::domain::PlacedOrder;
use crate::error::Result;

/// Available and reserved balance for one asset on an exchange.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Balance {
    pub ticker: String,
    pub available: Decimal,
    pub locked: Decimal,
}

impl Balance {
    pub fn new(ticker: impl Into<String>, available: Decimal) -> Self {
        Self {
            ticker: ticker.into(),
            available,
            locked: Decimal::ZERO,
        }
    }
}

/// Narrow contract over one exchange.
///
/// Transport details (REST/WebSocket, signing) live behind this trait; the
/// pipeline only sees canonical `PlacedOrder` results. `client_ref` is passed
/// through on placements so the exchange can correlate and deduplicate on its
/// side.
#[async_trait]
pub trait ExchangeClient: Send + Sync {
    /// Exchange name used in configuration and order records
    fn name(&self) -> &str;

    /// Ticker of the reserve/quote asset orders are denominated in
    fn quote_asset_ticker(&self) -> &str;

    async fn place_market_buy(
        &self,
        symbol: &str,
        quote_qty: Decimal,
        client_ref: &str,
    ) -> Result<PlacedOrder>;

    async fn place_market_sell(
        &self,
        symbol: &str,
        quote_qty: Decimal,
        client_ref: &str,
    ) -> Result<PlacedOrder>;

    /// Current status of an order by its exchange-assigned id
    async fn get_order(&self, exchange_order_id: &str) -> Result<PlacedOrder>;

    async fn get_balance(&self, ticker: &str) -> Result<Balance>;

    /// Smallest quote order size the exchange accepts for this asset
    async fn get_min_notional(&self, ticker: &str) -> Result<Decimal>;

    async fn get_asset_price(&self, ticker: &str) -> Result<Decimal>;
}
