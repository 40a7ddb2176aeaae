use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Row;
use tracing::{debug, info};
use uuid::Uuid;

use crate::domain::{
    Allocation, EventKind, EventStatus, ExchangeOrder, LedgerEntry, LedgerEntryType, OrderSide,
    OrderStatus, StoredEvent,
};
use crate::error::{CoinvestError, Result};
use crate::persistence::{
    AllocationSource, EventBus, LedgerStore, OrderPatch, OrderStore,
};

/// PostgreSQL storage adapter
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Create a new PostgreSQL store
    pub async fn new(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;

        info!("Connected to PostgreSQL");
        Ok(Self { pool })
    }

    /// Create a PostgreSQL store from an existing connection pool
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run migrations
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        info!("Database migrations completed");
        Ok(())
    }

    /// Get the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn row_to_order(row: &sqlx::postgres::PgRow) -> Result<ExchangeOrder> {
        let side: String = row.get("side");
        let status: String = row.get("status");
        Ok(ExchangeOrder {
            id: row.get("id"),
            user_id: row.get("user_id"),
            payment_id: row.get("payment_id"),
            subscription_id: row.get("subscription_id"),
            exchange_name: row.get("exchange_name"),
            asset_id: row.get("asset_id"),
            ticker: row.get("ticker"),
            side: side
                .parse::<OrderSide>()
                .map_err(CoinvestError::Internal)?,
            exchange_order_id: row.get("exchange_order_id"),
            requested_quote_qty: row.get("requested_quote_qty"),
            filled_quote_qty: row.get("filled_quote_qty"),
            filled_base_qty: row.get("filled_base_qty"),
            price: row.get("price"),
            status: status
                .parse::<OrderStatus>()
                .map_err(CoinvestError::Internal)?,
            retry_count: row.get::<i32, _>("retry_count") as u32,
            previous_order_id: row.get("previous_order_id"),
            error: row.get("error"),
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
        })
    }

    fn row_to_event(row: &sqlx::postgres::PgRow) -> Result<StoredEvent> {
        let kind: String = row.get("kind");
        let status: String = row.get("status");
        Ok(StoredEvent {
            id: row.get("id"),
            kind: kind.parse::<EventKind>().map_err(CoinvestError::Internal)?,
            payload: row.get("payload"),
            status: status
                .parse::<EventStatus>()
                .map_err(CoinvestError::Internal)?,
            error: row.get("error"),
            created_at: row.get("created_at"),
            processed_at: row.get("processed_at"),
        })
    }
}

#[async_trait]
impl OrderStore for PostgresStore {
    async fn insert_order(&self, order: &ExchangeOrder) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO exchange_orders (
                id, user_id, payment_id, subscription_id, exchange_name,
                asset_id, ticker, side, exchange_order_id,
                requested_quote_qty, filled_quote_qty, filled_base_qty,
                price, status, retry_count, previous_order_id, error,
                created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19)
            "#,
        )
        .bind(order.id)
        .bind(order.user_id)
        .bind(order.payment_id)
        .bind(order.subscription_id)
        .bind(&order.exchange_name)
        .bind(order.asset_id)
        .bind(&order.ticker)
        .bind(order.side.as_str())
        .bind(&order.exchange_order_id)
        .bind(order.requested_quote_qty)
        .bind(order.filled_quote_qty)
        .bind(order.filled_base_qty)
        .bind(order.price)
        .bind(order.status.as_str())
        .bind(order.retry_count as i32)
        .bind(order.previous_order_id)
        .bind(&order.error)
        .bind(order.created_at)
        .bind(order.updated_at)
        .execute(&self.pool)
        .await?;

        debug!("Inserted order {} ({})", order.id, order.status);
        Ok(())
    }

    async fn update_order(&self, id: Uuid, patch: OrderPatch) -> Result<()> {
        if patch.is_empty() {
            return Ok(());
        }

        let result = sqlx::query(
            r#"
            UPDATE exchange_orders SET
                status = COALESCE($2, status),
                exchange_order_id = COALESCE($3, exchange_order_id),
                filled_quote_qty = COALESCE($4, filled_quote_qty),
                filled_base_qty = COALESCE($5, filled_base_qty),
                price = COALESCE($6, price),
                error = COALESCE($7, error),
                updated_at = $8
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(patch.status.map(|s| s.as_str()))
        .bind(patch.exchange_order_id)
        .bind(patch.filled_quote_qty)
        .bind(patch.filled_base_qty)
        .bind(patch.price)
        .bind(patch.error)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(CoinvestError::NotFound {
                entity: "order",
                id: id.to_string(),
            });
        }
        Ok(())
    }

    async fn get_order(&self, id: Uuid) -> Result<Option<ExchangeOrder>> {
        let row = sqlx::query(
            r#"
            SELECT id, user_id, payment_id, subscription_id, exchange_name,
                   asset_id, ticker, side, exchange_order_id,
                   requested_quote_qty, filled_quote_qty, filled_base_qty,
                   price, status, retry_count, previous_order_id, error,
                   created_at, updated_at
            FROM exchange_orders WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::row_to_order).transpose()
    }

    async fn orders_with_status(
        &self,
        status: OrderStatus,
        limit: usize,
    ) -> Result<Vec<ExchangeOrder>> {
        let rows = sqlx::query(
            r#"
            SELECT id, user_id, payment_id, subscription_id, exchange_name,
                   asset_id, ticker, side, exchange_order_id,
                   requested_quote_qty, filled_quote_qty, filled_base_qty,
                   price, status, retry_count, previous_order_id, error,
                   created_at, updated_at
            FROM exchange_orders
            WHERE status = $1
            ORDER BY created_at ASC
            LIMIT $2
            "#,
        )
        .bind(status.as_str())
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::row_to_order).collect()
    }

    async fn orders_for_payment_asset(
        &self,
        payment_id: Uuid,
        asset_id: Uuid,
    ) -> Result<Vec<ExchangeOrder>> {
        let rows = sqlx::query(
            r#"
            SELECT id, user_id, payment_id, subscription_id, exchange_name,
                   asset_id, ticker, side, exchange_order_id,
                   requested_quote_qty, filled_quote_qty, filled_base_qty,
                   price, status, retry_count, previous_order_id, error,
                   created_at, updated_at
            FROM exchange_orders
            WHERE payment_id = $1 AND asset_id = $2
            ORDER BY created_at ASC
            "#,
        )
        .bind(payment_id)
        .bind(asset_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::row_to_order).collect()
    }
}

#[async_trait]
impl LedgerStore for PostgresStore {
    async fn insert_entry(&self, entry: &LedgerEntry) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO ledger_entries (
                id, user_id, payment_id, order_id, asset_id,
                quote_amount, base_amount, price, entry_type, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(entry.id)
        .bind(entry.user_id)
        .bind(entry.payment_id)
        .bind(entry.order_id)
        .bind(entry.asset_id)
        .bind(entry.quote_amount)
        .bind(entry.base_amount)
        .bind(entry.price)
        .bind(entry.entry_type.as_str())
        .bind(entry.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn entries_for_payment(&self, payment_id: Uuid) -> Result<Vec<LedgerEntry>> {
        let rows = sqlx::query(
            r#"
            SELECT id, user_id, payment_id, order_id, asset_id,
                   quote_amount, base_amount, price, entry_type, created_at
            FROM ledger_entries
            WHERE payment_id = $1
            ORDER BY created_at ASC
            "#,
        )
        .bind(payment_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let entry_type: String = row.get("entry_type");
                Ok(LedgerEntry {
                    id: row.get("id"),
                    user_id: row.get("user_id"),
                    payment_id: row.get("payment_id"),
                    order_id: row.get("order_id"),
                    asset_id: row.get("asset_id"),
                    quote_amount: row.get("quote_amount"),
                    base_amount: row.get("base_amount"),
                    price: row.get::<Option<Decimal>, _>("price"),
                    entry_type: entry_type
                        .parse::<LedgerEntryType>()
                        .map_err(CoinvestError::Internal)?,
                    created_at: row.get("created_at"),
                })
            })
            .collect()
    }
}

#[async_trait]
impl AllocationSource for PostgresStore {
    async fn allocations_for_subscription(
        &self,
        subscription_id: Uuid,
    ) -> Result<Vec<Allocation>> {
        let rows = sqlx::query(
            r#"
            SELECT asset_id, ticker, exchange_name, percent
            FROM subscription_allocations
            WHERE subscription_id = $1
            ORDER BY position ASC
            "#,
        )
        .bind(subscription_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| Allocation {
                asset_id: row.get("asset_id"),
                ticker: row.get("ticker"),
                exchange_name: row.get("exchange_name"),
                percent: row.get("percent"),
            })
            .collect())
    }
}

#[async_trait]
impl EventBus for PostgresStore {
    async fn publish(&self, event: &StoredEvent) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO events (id, kind, payload, status, error, created_at, processed_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(event.id)
        .bind(event.kind.as_str())
        .bind(&event.payload)
        .bind(event.status.as_str())
        .bind(&event.error)
        .bind(event.created_at)
        .bind(event.processed_at)
        .execute(&self.pool)
        .await?;

        debug!("Published {} event {}", event.kind, event.id);
        Ok(())
    }

    async fn unprocessed(&self, kind: EventKind, limit: i64) -> Result<Vec<StoredEvent>> {
        let rows = sqlx::query(
            r#"
            SELECT id, kind, payload, status, error, created_at, processed_at
            FROM events
            WHERE kind = $1 AND status = 'unprocessed'
            ORDER BY created_at ASC
            LIMIT $2
            "#,
        )
        .bind(kind.as_str())
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::row_to_event).collect()
    }

    async fn mark_processed(&self, event_id: Uuid) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE events SET status = 'processed', processed_at = $2
            WHERE id = $1
            "#,
        )
        .bind(event_id)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(CoinvestError::NotFound {
                entity: "event",
                id: event_id.to_string(),
            });
        }
        Ok(())
    }

    async fn mark_failed(&self, event_id: Uuid, reason: &str) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE events SET status = 'failed', error = $2
            WHERE id = $1
            "#,
        )
        .bind(event_id)
        .bind(reason)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(CoinvestError::NotFound {
                entity: "event",
                id: event_id.to_string(),
            });
        }
        Ok(())
    }
}
