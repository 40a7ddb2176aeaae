//! Paper exchange — simulates order execution in memory.
//!
//! Drop-in [`ExchangeClient`] used in dry-run mode and tests: balances,
//! prices and min-notionals are configured up front, market orders fill
//! instantly at the configured price, and fill behavior can be scripted
//! per ticker to exercise partial fills and rejections.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use rust_decimal::Decimal;
use tokio::sync::RwLock;
use tracing::debug;

use crate::domain::{OrderSide, OrderStatus, PlacedOrder};
use crate::error::{CoinvestError, Result};

use super::{Balance, ExchangeClient};

/// Scripted behavior for the next placements on a ticker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FillBehavior {
    /// Fill the full quote quantity
    Full,
    /// Fill the given percentage of the quote quantity (0-100)
    Partial(u32),
    /// Return a terminal Failed placement
    Reject,
    /// Return a transport error
    Error,
    /// Accept the order but report it still Pending
    Unfilled,
}

struct PaperState {
    balances: HashMap<String, Decimal>,
    prices: HashMap<String, Decimal>,
    min_notionals: HashMap<String, Decimal>,
    behaviors: HashMap<String, Vec<FillBehavior>>,
    orders: HashMap<String, PlacedOrder>,
    balance_calls: u64,
}

/// In-memory exchange simulator.
pub struct PaperExchange {
    name: String,
    quote_ticker: String,
    state: RwLock<PaperState>,
    next_id: AtomicU64,
}

impl PaperExchange {
    pub fn new(name: impl Into<String>, quote_ticker: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            quote_ticker: quote_ticker.into(),
            state: RwLock::new(PaperState {
                balances: HashMap::new(),
                prices: HashMap::new(),
                min_notionals: HashMap::new(),
                behaviors: HashMap::new(),
                orders: HashMap::new(),
                balance_calls: 0,
            }),
            next_id: AtomicU64::new(1),
        }
    }

    pub async fn set_balance(&self, ticker: &str, available: Decimal) {
        self.state
            .write()
            .await
            .balances
            .insert(ticker.to_string(), available);
    }

    pub async fn set_price(&self, ticker: &str, price: Decimal) {
        self.state
            .write()
            .await
            .prices
            .insert(ticker.to_string(), price);
    }

    pub async fn set_min_notional(&self, ticker: &str, min: Decimal) {
        self.state
            .write()
            .await
            .min_notionals
            .insert(ticker.to_string(), min);
    }

    /// Queue fill behaviors for a ticker; consumed in order, defaulting to
    /// full fills once exhausted.
    pub async fn script_fills(&self, ticker: &str, behaviors: Vec<FillBehavior>) {
        self.state
            .write()
            .await
            .behaviors
            .insert(ticker.to_string(), behaviors);
    }

    /// Overwrite the stored status of an exchange order, simulating state
    /// changes observed later by reconciliation.
    pub async fn set_order_state(
        &self,
        exchange_order_id: &str,
        status: OrderStatus,
        filled_quote: Decimal,
    ) {
        let mut state = self.state.write().await;
        if let Some(order) = state.orders.get_mut(exchange_order_id) {
            order.status = status;
            order.filled_quote_qty = filled_quote;
        }
    }

    /// Number of `get_balance` calls observed (cache behavior assertions).
    pub async fn balance_calls(&self) -> u64 {
        self.state.read().await.balance_calls
    }

    fn next_order_id(&self) -> String {
        let n = self.next_id.fetch_add(1, Ordering::Relaxed);
        format!("PAPER-{}-{}", self.name.to_uppercase(), n)
    }

    fn ticker_of(symbol: &str, quote: &str) -> String {
        symbol
            .strip_suffix(quote)
            .unwrap_or(symbol)
            .to_string()
    }

    async fn place(
        &self,
        symbol: &str,
        quote_qty: Decimal,
        side: OrderSide,
        client_ref: &str,
    ) -> Result<PlacedOrder> {
        let ticker = Self::ticker_of(symbol, &self.quote_ticker);
        let mut state = self.state.write().await;

        let behavior = match state.behaviors.get_mut(&ticker) {
            Some(queue) if !queue.is_empty() => queue.remove(0),
            _ => FillBehavior::Full,
        };

        let price = state.prices.get(&ticker).copied().unwrap_or(Decimal::ONE);
        let exchange_order_id = self.next_order_id();

        let (status, filled_quote) = match behavior {
            FillBehavior::Error => {
                return Err(CoinvestError::ExchangeApi(format!(
                    "simulated transport failure for {symbol}"
                )));
            }
            FillBehavior::Full => (OrderStatus::Filled, quote_qty),
            FillBehavior::Partial(pct) => (
                OrderStatus::PartiallyFilled,
                quote_qty * Decimal::from(pct) / Decimal::from(100),
            ),
            FillBehavior::Reject => (OrderStatus::Failed, Decimal::ZERO),
            FillBehavior::Unfilled => (OrderStatus::Pending, Decimal::ZERO),
        };

        let filled_base = if price.is_zero() {
            Decimal::ZERO
        } else {
            filled_quote / price
        };

        // Spend the quote balance on buys
        if side == OrderSide::Buy && !filled_quote.is_zero() {
            let quote = self.quote_ticker.clone();
            if let Some(balance) = state.balances.get_mut(&quote) {
                *balance -= filled_quote;
            }
        }

        let order = PlacedOrder {
            exchange_order_id: exchange_order_id.clone(),
            symbol: symbol.to_string(),
            side,
            requested_quote_qty: quote_qty,
            filled_quote_qty: filled_quote,
            filled_base_qty: filled_base,
            price: Some(price),
            status,
        };
        state.orders.insert(exchange_order_id.clone(), order.clone());

        debug!(
            "Paper {} {} {} for {} ({}): {}",
            self.name, side, symbol, quote_qty, client_ref, status
        );
        Ok(order)
    }
}

#[async_trait]
impl ExchangeClient for PaperExchange {
    fn name(&self) -> &str {
        &self.name
    }

    fn quote_asset_ticker(&self) -> &str {
        &self.quote_ticker
    }

    async fn place_market_buy(
        &self,
        symbol: &str,
        quote_qty: Decimal,
        client_ref: &str,
    ) -> Result<PlacedOrder> {
        self.place(symbol, quote_qty, OrderSide::Buy, client_ref).await
    }

    async fn place_market_sell(
        &self,
        symbol: &str,
        quote_qty: Decimal,
        client_ref: &str,
    ) -> Result<PlacedOrder> {
        self.place(symbol, quote_qty, OrderSide::Sell, client_ref).await
    }

    async fn get_order(&self, exchange_order_id: &str) -> Result<PlacedOrder> {
        self.state
            .read()
            .await
            .orders
            .get(exchange_order_id)
            .cloned()
            .ok_or(CoinvestError::NotFound {
                entity: "order",
                id: exchange_order_id.to_string(),
            })
    }

    async fn get_balance(&self, ticker: &str) -> Result<Balance> {
        let mut state = self.state.write().await;
        state.balance_calls += 1;
        let available = state.balances.get(ticker).copied().unwrap_or(Decimal::ZERO);
        Ok(Balance::new(ticker, available))
    }

    async fn get_min_notional(&self, ticker: &str) -> Result<Decimal> {
        Ok(self
            .state
            .read()
            .await
            .min_notionals
            .get(ticker)
            .copied()
            .unwrap_or(Decimal::ONE))
    }

    async fn get_asset_price(&self, ticker: &str) -> Result<Decimal> {
        self.state
            .read()
            .await
            .prices
            .get(ticker)
            .copied()
            .ok_or_else(|| CoinvestError::ExchangeApi(format!("no price for {ticker}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn market_buy_fills_at_configured_price() {
        let exchange = PaperExchange::new("paper", "EUR");
        exchange.set_price("BTC", dec!(50000)).await;
        exchange.set_balance("EUR", dec!(1000)).await;

        let placed = exchange
            .place_market_buy("BTCEUR", dec!(100), "ref-1")
            .await
            .unwrap();

        assert_eq!(placed.status, OrderStatus::Filled);
        assert_eq!(placed.filled_quote_qty, dec!(100));
        assert_eq!(placed.filled_base_qty, dec!(0.002));

        let balance = exchange.get_balance("EUR").await.unwrap();
        assert_eq!(balance.available, dec!(900));
    }

    #[tokio::test]
    async fn scripted_behaviors_apply_in_order() {
        let exchange = PaperExchange::new("paper", "EUR");
        exchange.set_price("ETH", dec!(2000)).await;
        exchange
            .script_fills("ETH", vec![FillBehavior::Partial(30), FillBehavior::Full])
            .await;

        let first = exchange
            .place_market_buy("ETHEUR", dec!(100), "ref-1")
            .await
            .unwrap();
        assert_eq!(first.status, OrderStatus::PartiallyFilled);
        assert_eq!(first.filled_quote_qty, dec!(30));

        let second = exchange
            .place_market_buy("ETHEUR", dec!(70), "ref-2")
            .await
            .unwrap();
        assert_eq!(second.status, OrderStatus::Filled);
    }

    #[tokio::test]
    async fn rejected_orders_are_queryable() {
        let exchange = PaperExchange::new("paper", "EUR");
        exchange.script_fills("BTC", vec![FillBehavior::Reject]).await;

        let placed = exchange
            .place_market_buy("BTCEUR", dec!(50), "ref-1")
            .await
            .unwrap();
        assert_eq!(placed.status, OrderStatus::Failed);

        let fetched = exchange.get_order(&placed.exchange_order_id).await.unwrap();
        assert_eq!(fetched.status, OrderStatus::Failed);
    }
}
