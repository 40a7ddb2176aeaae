use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::Serialize;
use uuid::Uuid;

use crate::domain::{
    EventKind, ExchangeOrder, FundingRequestedEvent, LedgerEntry, OrderCompletedEvent,
    OrderStatus, StoredEvent,
};
use crate::error::Result;

/// Explicit typed patch for `ExchangeOrder` updates.
///
/// Only the fields that are `Some` are written; everything else is left
/// untouched. `updated_at` is always bumped.
#[derive(Debug, Clone, Default)]
pub struct OrderPatch {
    pub status: Option<OrderStatus>,
    pub exchange_order_id: Option<String>,
    pub filled_quote_qty: Option<Decimal>,
    pub filled_base_qty: Option<Decimal>,
    pub price: Option<Decimal>,
    pub error: Option<String>,
}

impl OrderPatch {
    pub fn status(status: OrderStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn with_exchange_order_id(mut self, id: impl Into<String>) -> Self {
        self.exchange_order_id = Some(id.into());
        self
    }

    pub fn with_fill(mut self, quote: Decimal, base: Decimal, price: Option<Decimal>) -> Self {
        self.filled_quote_qty = Some(quote);
        self.filled_base_qty = Some(base);
        self.price = price;
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.status.is_none()
            && self.exchange_order_id.is_none()
            && self.filled_quote_qty.is_none()
            && self.filled_base_qty.is_none()
            && self.price.is_none()
            && self.error.is_none()
    }
}

/// Store for exchange orders. Orders are never deleted, only superseded.
#[async_trait]
pub trait OrderStore: Send + Sync {
    async fn insert_order(&self, order: &ExchangeOrder) -> Result<()>;

    async fn update_order(&self, id: Uuid, patch: OrderPatch) -> Result<()>;

    async fn get_order(&self, id: Uuid) -> Result<Option<ExchangeOrder>>;

    /// Orders currently in the given status, oldest first
    async fn orders_with_status(
        &self,
        status: OrderStatus,
        limit: usize,
    ) -> Result<Vec<ExchangeOrder>>;

    /// All orders ever created for one (payment, asset) allocation,
    /// including retry/continuation chains
    async fn orders_for_payment_asset(
        &self,
        payment_id: Uuid,
        asset_id: Uuid,
    ) -> Result<Vec<ExchangeOrder>>;
}

/// Read side of subscription allocation configuration.
#[async_trait]
pub trait AllocationSource: Send + Sync {
    /// Configured allocations for one subscription, in configured order
    async fn allocations_for_subscription(
        &self,
        subscription_id: Uuid,
    ) -> Result<Vec<crate::domain::Allocation>>;
}

/// Store for ledger entries.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    async fn insert_entry(&self, entry: &LedgerEntry) -> Result<()>;

    async fn entries_for_payment(&self, payment_id: Uuid) -> Result<Vec<LedgerEntry>>;
}

/// Durable event bus: publish plus an at-least-once event log.
///
/// Events are never deleted; failed events keep their payload and stay
/// eligible for reprocessing.
#[async_trait]
pub trait EventBus: Send + Sync {
    async fn publish(&self, event: &StoredEvent) -> Result<()>;

    async fn unprocessed(&self, kind: EventKind, limit: i64) -> Result<Vec<StoredEvent>>;

    async fn mark_processed(&self, event_id: Uuid) -> Result<()>;

    async fn mark_failed(&self, event_id: Uuid, reason: &str) -> Result<()>;
}

/// Concurrent key-value cache with per-entry TTL.
///
/// Values are JSON so one store serves balances, decisions, idempotency
/// records and dedup markers. Last-writer-wins per key.
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get_raw(&self, key: &str) -> Option<serde_json::Value>;

    async fn set_raw(&self, key: &str, value: serde_json::Value, ttl: Duration);

    /// Atomic check-and-set: stores the value only when the key is absent
    /// (or expired) and reports whether this caller won.
    async fn set_if_absent(&self, key: &str, value: serde_json::Value, ttl: Duration) -> bool;

    async fn invalidate(&self, key: &str);
}

/// Typed read helper over the raw JSON cache.
pub async fn cache_get<T: DeserializeOwned>(cache: &dyn CacheStore, key: &str) -> Option<T> {
    let value = cache.get_raw(key).await?;
    serde_json::from_value(value).ok()
}

/// Typed write helper over the raw JSON cache. Serialization failures are
/// logged and dropped; a cache write must never fail the caller.
pub async fn cache_set<T: Serialize>(cache: &dyn CacheStore, key: &str, value: &T, ttl: Duration) {
    match serde_json::to_value(value) {
        Ok(json) => cache.set_raw(key, json, ttl).await,
        Err(e) => tracing::warn!("Failed to serialize cache value for {}: {}", key, e),
    }
}

/// Return the cached value for `key` or compute, cache and return it.
pub async fn get_or_compute<T, F, Fut>(
    cache: &dyn CacheStore,
    key: &str,
    ttl: Duration,
    compute: F,
) -> Result<T>
where
    T: Serialize + DeserializeOwned,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    if let Some(value) = cache_get::<T>(cache, key).await {
        return Ok(value);
    }
    let value = compute().await?;
    cache_set(cache, key, &value, ttl).await;
    Ok(value)
}

/// Best-effort push notifications. Failures are logged by callers and never
/// fail the pipeline.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn notify_funding_request(&self, event: &FundingRequestedEvent) -> Result<()>;

    async fn notify_order_completed(&self, event: &OrderCompletedEvent) -> Result<()>;
}
