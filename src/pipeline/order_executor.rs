//! Market order placement
//!
//! Validates inputs, builds the trading symbol, delegates to the exchange
//! client under the exchange resilience policy and maps the response to a
//! canonical placement. Terminal rejections from the exchange are hard
//! failures here; transient transport errors are retried by the resilience
//! wrapper around the exchange call.

use std::sync::Arc;

use rust_decimal::Decimal;
use tracing::{debug, warn};

use crate::domain::{OrderSide, OrderStatus, PlacedOrder};
use crate::error::{CoinvestError, Result};
use crate::exchange::ExchangeClient;
use crate::resilience::{ResilienceExecutor, ResiliencePolicy};
use crate::services::Metrics;
use crate::validation::{validate_amount, validate_ticker};

pub struct OrderExecutor {
    executor: Arc<ResilienceExecutor>,
    metrics: Arc<Metrics>,
    place_policy: ResiliencePolicy,
}

impl OrderExecutor {
    pub fn new(executor: Arc<ResilienceExecutor>, metrics: Arc<Metrics>) -> Self {
        Self {
            executor,
            metrics,
            place_policy: ResiliencePolicy::exchange_api("exchange.place_order"),
        }
    }

    /// Place a market order for `quote_qty` of `ticker` against `exchange`.
    ///
    /// `client_ref` is passed through so the exchange can correlate and
    /// deduplicate the placement on its side.
    pub async fn place_order(
        &self,
        exchange: Arc<dyn ExchangeClient>,
        ticker: &str,
        quote_qty: Decimal,
        client_ref: &str,
        side: OrderSide,
    ) -> Result<PlacedOrder> {
        validate_ticker(ticker)?;
        validate_amount(quote_qty, "quote_qty")?;
        if client_ref.is_empty() {
            return Err(CoinvestError::Validation(
                "client_ref cannot be empty".to_string(),
            ));
        }

        let symbol = format!("{}{}", ticker, exchange.quote_asset_ticker());
        debug!(
            "Placing {} market order: {} {} on {} (ref {})",
            side, quote_qty, symbol, exchange.name(), client_ref
        );

        let placed = self
            .executor
            .execute(&self.place_policy, || {
                let exchange = exchange.clone();
                let symbol = symbol.clone();
                let client_ref = client_ref.to_string();
                async move {
                    match side {
                        OrderSide::Buy => {
                            exchange
                                .place_market_buy(&symbol, quote_qty, &client_ref)
                                .await
                        }
                        OrderSide::Sell => {
                            exchange
                                .place_market_sell(&symbol, quote_qty, &client_ref)
                                .await
                        }
                    }
                }
            })
            .await
            .map_err(CoinvestError::from)?;

        self.metrics.inc_orders_submitted();

        // A terminal failure in the response is a rejection, not a
        // transport fault, so it is not retried here.
        if placed.status == OrderStatus::Failed {
            return Err(CoinvestError::OrderRejected(format!(
                "exchange {} rejected order {} for {}",
                exchange.name(),
                placed.exchange_order_id,
                symbol
            )));
        }

        if placed.status == OrderStatus::Filled {
            self.metrics.inc_orders_filled();
            self.handle_dust(&placed, exchange.name());
        }

        Ok(placed)
    }

    /// Record the residual of a filled order whose fill came up short. The
    /// residual stays recoverable from the persisted order record; failures
    /// here must never fail the parent order.
    fn handle_dust(&self, placed: &PlacedOrder, exchange_name: &str) {
        let residual = placed.requested_quote_qty - placed.filled_quote_qty;
        if residual <= Decimal::ZERO {
            return;
        }
        self.metrics.inc_dust_detected();
        warn!(
            "Dust on {} order {}: requested {}, filled {} (residual {})",
            exchange_name,
            placed.exchange_order_id,
            placed.requested_quote_qty,
            placed.filled_quote_qty,
            residual
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::{FillBehavior, PaperExchange};
    use rust_decimal_macros::dec;

    fn executor() -> OrderExecutor {
        OrderExecutor::new(
            Arc::new(ResilienceExecutor::new()),
            Arc::new(Metrics::new()),
        )
    }

    async fn paper() -> Arc<PaperExchange> {
        let exchange = Arc::new(PaperExchange::new("paper", "EUR"));
        exchange.set_price("BTC", dec!(50000)).await;
        exchange
    }

    #[tokio::test]
    async fn validates_before_any_io() {
        let executor = executor();
        let exchange = paper().await;

        let err = executor
            .place_order(exchange.clone(), "BTC", dec!(0), "ref", OrderSide::Buy)
            .await
            .unwrap_err();
        assert!(matches!(err, CoinvestError::Validation(_)));

        let err = executor
            .place_order(exchange.clone(), "", dec!(10), "ref", OrderSide::Buy)
            .await
            .unwrap_err();
        assert!(matches!(err, CoinvestError::Validation(_)));

        let err = executor
            .place_order(exchange, "BTC", dec!(10), "", OrderSide::Buy)
            .await
            .unwrap_err();
        assert!(matches!(err, CoinvestError::Validation(_)));
    }

    #[tokio::test]
    async fn builds_symbol_from_ticker_and_quote_asset() {
        let executor = executor();
        let exchange = paper().await;

        let placed = executor
            .place_order(exchange, "BTC", dec!(100), "ref-1", OrderSide::Buy)
            .await
            .unwrap();

        assert_eq!(placed.symbol, "BTCEUR");
        assert_eq!(placed.status, OrderStatus::Filled);
        assert_eq!(placed.filled_quote_qty, dec!(100));
    }

    #[tokio::test]
    async fn terminal_rejection_is_a_hard_failure() {
        let executor = executor();
        let exchange = paper().await;
        exchange.script_fills("BTC", vec![FillBehavior::Reject]).await;

        let err = executor
            .place_order(exchange, "BTC", dec!(100), "ref-1", OrderSide::Buy)
            .await
            .unwrap_err();
        assert!(matches!(err, CoinvestError::OrderRejected(_)));
    }

    #[tokio::test]
    async fn transport_errors_are_retried() {
        let executor = executor();
        let exchange = paper().await;
        exchange
            .script_fills("BTC", vec![FillBehavior::Error, FillBehavior::Full])
            .await;

        let placed = executor
            .place_order(exchange, "BTC", dec!(100), "ref-1", OrderSide::Buy)
            .await
            .unwrap();
        assert_eq!(placed.status, OrderStatus::Filled);
    }
}
