//! Domain events and the durable event-log record
//!
//! Payment-received events are consumed from a durable log with
//! at-least-once delivery; funding and completion events are published back
//! onto the same bus.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::Payment;

/// Event kinds stored in the durable log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    PaymentReceived,
    FundingRequested,
    OrderCompleted,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::PaymentReceived => "payment_received",
            EventKind::FundingRequested => "funding_requested",
            EventKind::OrderCompleted => "order_completed",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for EventKind {
    type Err = String;

    fn from_str(raw: &str) -> std::result::Result<Self, Self::Err> {
        match raw {
            "payment_received" => Ok(Self::PaymentReceived),
            "funding_requested" => Ok(Self::FundingRequested),
            "order_completed" => Ok(Self::OrderCompleted),
            other => Err(format!("unknown event kind: {other}")),
        }
    }
}

/// Processing status of a durable event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    Unprocessed,
    Processed,
    Failed,
}

impl EventStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventStatus::Unprocessed => "unprocessed",
            EventStatus::Processed => "processed",
            EventStatus::Failed => "failed",
        }
    }
}

impl std::str::FromStr for EventStatus {
    type Err = String;

    fn from_str(raw: &str) -> std::result::Result<Self, Self::Err> {
        match raw {
            "unprocessed" => Ok(Self::Unprocessed),
            "processed" => Ok(Self::Processed),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown event status: {other}")),
        }
    }
}

/// A durable event-log record.
///
/// Events are never deleted: a failed event keeps its payload and error so
/// it stays eligible for manual or scheduled reprocessing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredEvent {
    pub id: Uuid,
    pub kind: EventKind,
    pub payload: serde_json::Value,
    pub status: EventStatus,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

impl StoredEvent {
    pub fn new(kind: EventKind, payload: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            payload,
            status: EventStatus::Unprocessed,
            error: None,
            created_at: Utc::now(),
            processed_at: None,
        }
    }
}

/// Payload of a payment-received event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentReceivedEvent {
    /// Id of the durable event, the idempotency key of the delivery
    pub event_id: Uuid,
    pub payment: Payment,
}

impl PaymentReceivedEvent {
    pub fn new(payment: Payment) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            payment,
        }
    }
}

/// Payload of a funding-requested event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FundingRequestedEvent {
    pub exchange_name: String,
    pub reserve_ticker: String,
    pub amount: Decimal,
    pub requested_at: DateTime<Utc>,
}

/// Payload of an order-completed event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderCompletedEvent {
    pub order_id: Uuid,
    pub payment_id: Uuid,
    pub user_id: Uuid,
    pub asset_id: Uuid,
    pub exchange_name: String,
    pub requested_quote_qty: Decimal,
    pub filled_quote_qty: Decimal,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn stored_event_starts_unprocessed() {
        let event = StoredEvent::new(
            EventKind::PaymentReceived,
            serde_json::json!({"payment_id": "p-1"}),
        );
        assert_eq!(event.status, EventStatus::Unprocessed);
        assert!(event.error.is_none());
        assert!(event.processed_at.is_none());
    }

    #[test]
    fn payment_event_serialization_round_trip() {
        let payment = Payment::new(
            Uuid::new_v4(),
            Uuid::new_v4(),
            "tx-123",
            dec!(100.50),
            "EUR",
        );
        let event = PaymentReceivedEvent::new(payment.clone());

        let json = serde_json::to_string(&event).unwrap();
        let parsed: PaymentReceivedEvent = serde_json::from_str(&json).unwrap();

        assert_eq!(parsed.event_id, event.event_id);
        assert_eq!(parsed.payment.id, payment.id);
        assert_eq!(parsed.payment.net_amount, dec!(100.50));
    }

    #[test]
    fn event_kind_round_trips_through_str() {
        for kind in [
            EventKind::PaymentReceived,
            EventKind::FundingRequested,
            EventKind::OrderCompleted,
        ] {
            assert_eq!(kind.as_str().parse::<EventKind>().unwrap(), kind);
        }
    }
}
