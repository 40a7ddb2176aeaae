use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::FailureReason;

/// Order side (buy or sell)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderSide::Buy => "BUY",
            OrderSide::Sell => "SELL",
        }
    }
}

impl std::fmt::Display for OrderSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for OrderSide {
    type Err = String;

    fn from_str(raw: &str) -> std::result::Result<Self, Self::Err> {
        match raw.to_ascii_uppercase().as_str() {
            "BUY" => Ok(Self::Buy),
            "SELL" => Ok(Self::Sell),
            other => Err(format!("unknown order side: {other}")),
        }
    }
}

/// Order status
///
/// `Queued → Pending → {Filled, PartiallyFilled, Failed}`. Queued is the
/// initial state for retry/continuation orders created before submission.
/// Filled and Failed are terminal. PartiallyFilled spawns exactly one
/// continuation order and is then closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderStatus {
    /// Order created by retry/continuation logic, not yet submitted
    Queued,
    /// Order submitted to the exchange, outcome not yet observed
    Pending,
    /// Order partially filled; a continuation order covers the remainder
    PartiallyFilled,
    /// Order fully filled
    Filled,
    /// Order rejected, cancelled or expired
    Failed,
}

impl OrderStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, OrderStatus::Filled | OrderStatus::Failed)
    }

    pub fn is_active(&self) -> bool {
        matches!(self, OrderStatus::Queued | OrderStatus::Pending)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Queued => "QUEUED",
            OrderStatus::Pending => "PENDING",
            OrderStatus::PartiallyFilled => "PARTIALLY_FILLED",
            OrderStatus::Filled => "FILLED",
            OrderStatus::Failed => "FAILED",
        }
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for OrderStatus {
    type Err = String;

    fn from_str(raw: &str) -> std::result::Result<Self, Self::Err> {
        match raw.to_ascii_uppercase().as_str() {
            "QUEUED" => Ok(Self::Queued),
            "PENDING" => Ok(Self::Pending),
            "PARTIALLY_FILLED" => Ok(Self::PartiallyFilled),
            "FILLED" => Ok(Self::Filled),
            "FAILED" => Ok(Self::Failed),
            other => Err(format!("unknown order status: {other}")),
        }
    }
}

/// An exchange order tracked by the pipeline.
///
/// Never deleted; a retry or partial-fill continuation supersedes an order by
/// referencing it through `previous_order_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangeOrder {
    pub id: Uuid,
    pub user_id: Uuid,
    pub payment_id: Uuid,
    pub subscription_id: Uuid,
    pub exchange_name: String,
    pub asset_id: Uuid,
    pub ticker: String,
    pub side: OrderSide,
    /// Order id assigned by the exchange once submitted
    pub exchange_order_id: Option<String>,
    pub requested_quote_qty: Decimal,
    pub filled_quote_qty: Decimal,
    pub filled_base_qty: Decimal,
    pub price: Option<Decimal>,
    pub status: OrderStatus,
    pub retry_count: u32,
    pub previous_order_id: Option<Uuid>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ExchangeOrder {
    /// Create a fresh Queued order for one allocation of a payment.
    pub fn for_allocation(
        user_id: Uuid,
        payment_id: Uuid,
        subscription_id: Uuid,
        exchange_name: &str,
        asset_id: Uuid,
        ticker: &str,
        side: OrderSide,
        requested_quote_qty: Decimal,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            user_id,
            payment_id,
            subscription_id,
            exchange_name: exchange_name.to_string(),
            asset_id,
            ticker: ticker.to_string(),
            side,
            exchange_order_id: None,
            requested_quote_qty,
            filled_quote_qty: Decimal::ZERO,
            filled_base_qty: Decimal::ZERO,
            price: None,
            status: OrderStatus::Queued,
            retry_count: 0,
            previous_order_id: None,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Queued retry for a failed order: same requested quantity, bumped
    /// retry count, chained via `previous_order_id`.
    pub fn retry_of(failed: &ExchangeOrder) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            exchange_order_id: None,
            requested_quote_qty: failed.requested_quote_qty,
            filled_quote_qty: Decimal::ZERO,
            filled_base_qty: Decimal::ZERO,
            price: None,
            status: OrderStatus::Queued,
            retry_count: failed.retry_count + 1,
            previous_order_id: Some(failed.id),
            error: None,
            created_at: now,
            updated_at: now,
            ..failed.clone()
        }
    }

    /// Queued continuation covering the unfilled remainder of a partially
    /// filled order.
    pub fn continuation_of(partial: &ExchangeOrder, remaining: Decimal) -> Self {
        let mut order = Self::retry_of(partial);
        order.requested_quote_qty = remaining;
        order
    }

    /// Unfilled quote quantity of this order.
    pub fn remaining_quote_qty(&self) -> Decimal {
        (self.requested_quote_qty - self.filled_quote_qty).max(Decimal::ZERO)
    }

    pub fn is_fully_filled(&self) -> bool {
        self.status == OrderStatus::Filled && self.filled_quote_qty >= self.requested_quote_qty
    }
}

/// Canonical result of a single exchange placement, mapped from whatever the
/// exchange client returned.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlacedOrder {
    /// Order id assigned by the exchange
    pub exchange_order_id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub requested_quote_qty: Decimal,
    pub filled_quote_qty: Decimal,
    pub filled_base_qty: Decimal,
    pub price: Option<Decimal>,
    pub status: OrderStatus,
}

/// Ephemeral per-allocation outcome of one payment-processing run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderResult {
    pub exchange_name: String,
    pub order_id: Option<Uuid>,
    pub asset_id: Uuid,
    pub requested_qty: Decimal,
    pub filled_qty: Decimal,
    pub status: OrderOutcome,
    pub success: bool,
    pub error: Option<String>,
    pub failure_reason: Option<FailureReason>,
}

/// Outcome label for an allocation within one processing run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderOutcome {
    Executed,
    /// Allocation already satisfied by prior fills (idempotent resume)
    AlreadyProcessed,
    Failed,
}

impl OrderResult {
    pub fn executed(
        exchange_name: &str,
        order_id: Uuid,
        asset_id: Uuid,
        requested_qty: Decimal,
        filled_qty: Decimal,
    ) -> Self {
        Self {
            exchange_name: exchange_name.to_string(),
            order_id: Some(order_id),
            asset_id,
            requested_qty,
            filled_qty,
            status: OrderOutcome::Executed,
            success: true,
            error: None,
            failure_reason: None,
        }
    }

    pub fn already_processed(exchange_name: &str, asset_id: Uuid) -> Self {
        Self {
            exchange_name: exchange_name.to_string(),
            order_id: None,
            asset_id,
            requested_qty: Decimal::ZERO,
            filled_qty: Decimal::ZERO,
            status: OrderOutcome::AlreadyProcessed,
            success: true,
            error: None,
            failure_reason: None,
        }
    }

    pub fn failed(
        exchange_name: &str,
        asset_id: Uuid,
        requested_qty: Decimal,
        reason: FailureReason,
        error: impl Into<String>,
    ) -> Self {
        Self {
            exchange_name: exchange_name.to_string(),
            order_id: None,
            asset_id,
            requested_qty,
            filled_qty: Decimal::ZERO,
            status: OrderOutcome::Failed,
            success: false,
            error: Some(error.into()),
            failure_reason: Some(reason),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn order() -> ExchangeOrder {
        ExchangeOrder::for_allocation(
            Uuid::new_v4(),
            Uuid::new_v4(),
            Uuid::new_v4(),
            "binance",
            Uuid::new_v4(),
            "BTC",
            OrderSide::Buy,
            dec!(100),
        )
    }

    #[test]
    fn terminal_and_active_states() {
        assert!(OrderStatus::Filled.is_terminal());
        assert!(OrderStatus::Failed.is_terminal());
        assert!(!OrderStatus::PartiallyFilled.is_terminal());
        assert!(OrderStatus::Queued.is_active());
        assert!(OrderStatus::Pending.is_active());
        assert!(!OrderStatus::PartiallyFilled.is_active());
    }

    #[test]
    fn retry_chains_previous_order() {
        let mut failed = order();
        failed.status = OrderStatus::Failed;
        failed.retry_count = 1;

        let retry = ExchangeOrder::retry_of(&failed);
        assert_eq!(retry.status, OrderStatus::Queued);
        assert_eq!(retry.retry_count, 2);
        assert_eq!(retry.previous_order_id, Some(failed.id));
        assert_eq!(retry.requested_quote_qty, failed.requested_quote_qty);
        assert_eq!(retry.filled_quote_qty, Decimal::ZERO);
        assert!(retry.exchange_order_id.is_none());
    }

    #[test]
    fn continuation_requests_remainder_only() {
        let mut partial = order();
        partial.status = OrderStatus::PartiallyFilled;
        partial.filled_quote_qty = dec!(30);

        let remaining = partial.remaining_quote_qty();
        assert_eq!(remaining, dec!(70));

        let continuation = ExchangeOrder::continuation_of(&partial, remaining);
        assert_eq!(continuation.requested_quote_qty, dec!(70));
        assert_eq!(continuation.retry_count, 1);
        assert_eq!(continuation.previous_order_id, Some(partial.id));
    }

    #[test]
    fn remaining_never_negative() {
        let mut o = order();
        o.filled_quote_qty = dec!(120);
        assert_eq!(o.remaining_quote_qty(), Decimal::ZERO);
    }

    #[test]
    fn status_round_trips_through_str() {
        for status in [
            OrderStatus::Queued,
            OrderStatus::Pending,
            OrderStatus::PartiallyFilled,
            OrderStatus::Filled,
            OrderStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<OrderStatus>().unwrap(), status);
        }
    }
}
