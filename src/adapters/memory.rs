//! In-memory store implementations for tests and dry-run mode
//!
//! Same contracts as the Postgres adapter, backed by maps behind RwLocks.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::domain::{
    Allocation, EventKind, EventStatus, ExchangeOrder, LedgerEntry, OrderStatus, StoredEvent,
};
use crate::error::{CoinvestError, Result};
use crate::persistence::{AllocationSource, EventBus, LedgerStore, OrderPatch, OrderStore};

#[derive(Default)]
pub struct MemoryOrderStore {
    orders: RwLock<HashMap<Uuid, ExchangeOrder>>,
}

impl MemoryOrderStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn count(&self) -> usize {
        self.orders.read().await.len()
    }

    pub async fn all(&self) -> Vec<ExchangeOrder> {
        self.orders.read().await.values().cloned().collect()
    }
}

#[async_trait]
impl OrderStore for MemoryOrderStore {
    async fn insert_order(&self, order: &ExchangeOrder) -> Result<()> {
        let mut orders = self.orders.write().await;
        if orders.contains_key(&order.id) {
            return Err(CoinvestError::IdempotencyConflict(format!(
                "order {} already exists",
                order.id
            )));
        }
        orders.insert(order.id, order.clone());
        Ok(())
    }

    async fn update_order(&self, id: Uuid, patch: OrderPatch) -> Result<()> {
        let mut orders = self.orders.write().await;
        let order = orders.get_mut(&id).ok_or(CoinvestError::NotFound {
            entity: "order",
            id: id.to_string(),
        })?;

        if let Some(status) = patch.status {
            order.status = status;
        }
        if let Some(exchange_order_id) = patch.exchange_order_id {
            order.exchange_order_id = Some(exchange_order_id);
        }
        if let Some(filled_quote_qty) = patch.filled_quote_qty {
            order.filled_quote_qty = filled_quote_qty;
        }
        if let Some(filled_base_qty) = patch.filled_base_qty {
            order.filled_base_qty = filled_base_qty;
        }
        if let Some(price) = patch.price {
            order.price = Some(price);
        }
        if let Some(error) = patch.error {
            order.error = Some(error);
        }
        order.updated_at = Utc::now();
        Ok(())
    }

    async fn get_order(&self, id: Uuid) -> Result<Option<ExchangeOrder>> {
        Ok(self.orders.read().await.get(&id).cloned())
    }

    async fn orders_with_status(
        &self,
        status: OrderStatus,
        limit: usize,
    ) -> Result<Vec<ExchangeOrder>> {
        let orders = self.orders.read().await;
        let mut matching: Vec<ExchangeOrder> = orders
            .values()
            .filter(|o| o.status == status)
            .cloned()
            .collect();
        matching.sort_by_key(|o| o.created_at);
        matching.truncate(limit);
        Ok(matching)
    }

    async fn orders_for_payment_asset(
        &self,
        payment_id: Uuid,
        asset_id: Uuid,
    ) -> Result<Vec<ExchangeOrder>> {
        let orders = self.orders.read().await;
        let mut matching: Vec<ExchangeOrder> = orders
            .values()
            .filter(|o| o.payment_id == payment_id && o.asset_id == asset_id)
            .cloned()
            .collect();
        matching.sort_by_key(|o| o.created_at);
        Ok(matching)
    }
}

#[derive(Default)]
pub struct MemoryLedgerStore {
    entries: RwLock<Vec<LedgerEntry>>,
}

impl MemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn count(&self) -> usize {
        self.entries.read().await.len()
    }
}

#[async_trait]
impl LedgerStore for MemoryLedgerStore {
    async fn insert_entry(&self, entry: &LedgerEntry) -> Result<()> {
        self.entries.write().await.push(entry.clone());
        Ok(())
    }

    async fn entries_for_payment(&self, payment_id: Uuid) -> Result<Vec<LedgerEntry>> {
        Ok(self
            .entries
            .read()
            .await
            .iter()
            .filter(|e| e.payment_id == payment_id)
            .cloned()
            .collect())
    }
}

#[derive(Default)]
pub struct MemoryAllocationSource {
    allocations: RwLock<HashMap<Uuid, Vec<Allocation>>>,
}

impl MemoryAllocationSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set(&self, subscription_id: Uuid, allocations: Vec<Allocation>) {
        self.allocations
            .write()
            .await
            .insert(subscription_id, allocations);
    }
}

#[async_trait]
impl AllocationSource for MemoryAllocationSource {
    async fn allocations_for_subscription(
        &self,
        subscription_id: Uuid,
    ) -> Result<Vec<Allocation>> {
        Ok(self
            .allocations
            .read()
            .await
            .get(&subscription_id)
            .cloned()
            .unwrap_or_default())
    }
}

#[derive(Default)]
pub struct MemoryEventBus {
    events: RwLock<HashMap<Uuid, StoredEvent>>,
}

impl MemoryEventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, event_id: Uuid) -> Option<StoredEvent> {
        self.events.read().await.get(&event_id).cloned()
    }

    pub async fn events_of_kind(&self, kind: EventKind) -> Vec<StoredEvent> {
        self.events
            .read()
            .await
            .values()
            .filter(|e| e.kind == kind)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl EventBus for MemoryEventBus {
    async fn publish(&self, event: &StoredEvent) -> Result<()> {
        self.events.write().await.insert(event.id, event.clone());
        Ok(())
    }

    async fn unprocessed(&self, kind: EventKind, limit: i64) -> Result<Vec<StoredEvent>> {
        let events = self.events.read().await;
        let mut matching: Vec<StoredEvent> = events
            .values()
            .filter(|e| e.kind == kind && e.status == EventStatus::Unprocessed)
            .cloned()
            .collect();
        matching.sort_by_key(|e| e.created_at);
        matching.truncate(limit.max(0) as usize);
        Ok(matching)
    }

    async fn mark_processed(&self, event_id: Uuid) -> Result<()> {
        let mut events = self.events.write().await;
        let event = events.get_mut(&event_id).ok_or(CoinvestError::NotFound {
            entity: "event",
            id: event_id.to_string(),
        })?;
        event.status = EventStatus::Processed;
        event.processed_at = Some(Utc::now());
        Ok(())
    }

    async fn mark_failed(&self, event_id: Uuid, reason: &str) -> Result<()> {
        let mut events = self.events.write().await;
        let event = events.get_mut(&event_id).ok_or(CoinvestError::NotFound {
            entity: "event",
            id: event_id.to_string(),
        })?;
        event.status = EventStatus::Failed;
        event.error = Some(reason.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::OrderSide;
    use rust_decimal_macros::dec;

    fn order(status: OrderStatus) -> ExchangeOrder {
        let mut o = ExchangeOrder::for_allocation(
            Uuid::new_v4(),
            Uuid::new_v4(),
            Uuid::new_v4(),
            "binance",
            Uuid::new_v4(),
            "BTC",
            OrderSide::Buy,
            dec!(50),
        );
        o.status = status;
        o
    }

    #[tokio::test]
    async fn insert_is_rejected_for_duplicate_id() {
        let store = MemoryOrderStore::new();
        let o = order(OrderStatus::Pending);
        store.insert_order(&o).await.unwrap();
        assert!(store.insert_order(&o).await.is_err());
    }

    #[tokio::test]
    async fn patch_only_touches_set_fields() {
        let store = MemoryOrderStore::new();
        let o = order(OrderStatus::Pending);
        store.insert_order(&o).await.unwrap();

        store
            .update_order(
                o.id,
                OrderPatch::status(OrderStatus::Filled).with_fill(
                    dec!(50),
                    dec!(0.001),
                    Some(dec!(50000)),
                ),
            )
            .await
            .unwrap();

        let updated = store.get_order(o.id).await.unwrap().unwrap();
        assert_eq!(updated.status, OrderStatus::Filled);
        assert_eq!(updated.filled_quote_qty, dec!(50));
        assert_eq!(updated.requested_quote_qty, dec!(50));
        assert!(updated.error.is_none());
    }

    #[tokio::test]
    async fn status_query_orders_oldest_first() {
        let store = MemoryOrderStore::new();
        for _ in 0..3 {
            store.insert_order(&order(OrderStatus::Pending)).await.unwrap();
        }
        store.insert_order(&order(OrderStatus::Filled)).await.unwrap();

        let pending = store
            .orders_with_status(OrderStatus::Pending, 10)
            .await
            .unwrap();
        assert_eq!(pending.len(), 3);
        assert!(pending.windows(2).all(|w| w[0].created_at <= w[1].created_at));
    }

    #[tokio::test]
    async fn event_bus_marks_and_filters() {
        let bus = MemoryEventBus::new();
        let event = StoredEvent::new(EventKind::PaymentReceived, serde_json::json!({}));
        bus.publish(&event).await.unwrap();

        let unprocessed = bus.unprocessed(EventKind::PaymentReceived, 10).await.unwrap();
        assert_eq!(unprocessed.len(), 1);

        bus.mark_failed(event.id, "boom").await.unwrap();
        assert!(bus
            .unprocessed(EventKind::PaymentReceived, 10)
            .await
            .unwrap()
            .is_empty());

        let stored = bus.get(event.id).await.unwrap();
        assert_eq!(stored.status, EventStatus::Failed);
        assert_eq!(stored.error.as_deref(), Some("boom"));
    }
}
