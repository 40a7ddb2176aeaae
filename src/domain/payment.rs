use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Immutable record of a confirmed external payment.
///
/// Created by the payment collaborator and only referenced here; the pipeline
/// never mutates or owns it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Payment {
    pub id: Uuid,
    pub user_id: Uuid,
    pub subscription_id: Uuid,
    /// Transaction id assigned by the payment provider
    pub provider_tx_id: String,
    /// Net amount after provider fees, strictly positive
    pub net_amount: Decimal,
    pub currency: String,
    pub received_at: DateTime<Utc>,
}

impl Payment {
    pub fn new(
        user_id: Uuid,
        subscription_id: Uuid,
        provider_tx_id: impl Into<String>,
        net_amount: Decimal,
        currency: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id,
            subscription_id,
            provider_tx_id: provider_tx_id.into(),
            net_amount,
            currency: currency.into(),
            received_at: Utc::now(),
        }
    }
}

/// Persisted record of value movement for an executed order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: Uuid,
    pub user_id: Uuid,
    pub payment_id: Uuid,
    pub order_id: Uuid,
    pub asset_id: Uuid,
    /// Quote-currency amount spent
    pub quote_amount: Decimal,
    /// Base-asset amount acquired
    pub base_amount: Decimal,
    pub price: Option<Decimal>,
    pub entry_type: LedgerEntryType,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerEntryType {
    /// Value exchanged for an asset purchase
    Purchase,
    /// Residual quote amount left unfilled on a filled order
    Dust,
}

impl LedgerEntryType {
    pub fn as_str(&self) -> &'static str {
        match self {
            LedgerEntryType::Purchase => "purchase",
            LedgerEntryType::Dust => "dust",
        }
    }
}

impl std::str::FromStr for LedgerEntryType {
    type Err = String;

    fn from_str(raw: &str) -> std::result::Result<Self, Self::Err> {
        match raw {
            "purchase" => Ok(Self::Purchase),
            "dust" => Ok(Self::Dust),
            other => Err(format!("unknown ledger entry type: {other}")),
        }
    }
}
