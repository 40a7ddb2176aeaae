//! Concrete adapters behind the persistence and notification traits
//!
//! Postgres for production, in-memory stores for tests and dry-run, a
//! dashmap-backed TTL cache, and a log-only notification sink.

pub mod cache;
pub mod memory;
pub mod postgres;
pub mod sinks;

pub use cache::MemoryCache;
pub use memory::{
    MemoryAllocationSource, MemoryEventBus, MemoryLedgerStore, MemoryOrderStore,
};
pub use postgres::PostgresStore;
pub use sinks::LoggingNotificationSink;
