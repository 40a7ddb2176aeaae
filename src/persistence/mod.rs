//! Persistence capability traits
//!
//! Each entity gets its own narrow store trait implemented by composition
//! (Postgres for production, in-memory for tests and dry-run). Updates go
//! through explicit typed patch structs so partial updates are compile-time
//! checked.

mod traits;

pub use traits::{
    cache_get, cache_set, get_or_compute, AllocationSource, CacheStore, EventBus, LedgerStore,
    NotificationSink, OrderPatch, OrderStore,
};
