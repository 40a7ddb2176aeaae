pub mod adapters;
pub mod cli;
pub mod config;
pub mod domain;
pub mod error;
pub mod exchange;
pub mod persistence;
pub mod pipeline;
pub mod resilience;
pub mod services;
pub mod validation;

pub use adapters::{
    LoggingNotificationSink, MemoryAllocationSource, MemoryCache, MemoryEventBus,
    MemoryLedgerStore, MemoryOrderStore, PostgresStore,
};
pub use config::AppConfig;
pub use domain::{
    Allocation, ExchangeOrder, OrderResult, OrderSide, OrderStatus, Payment,
    PaymentReceivedEvent,
};
pub use error::{CoinvestError, FailureReason, OpFailure, Result};
pub use exchange::{ExchangeClient, ExchangeRegistry, PaperExchange};
pub use pipeline::{
    AdmissionDecision, AllocationProcessor, BalanceAdmissionGate, FundingHandle, FundingWorker,
    IdempotencyGuard, OrderExecutor, PaymentOrchestrator,
};
pub use resilience::{Backoff, ExecutionHooks, ResilienceExecutor, ResiliencePolicy};
pub use services::{Metrics, Reconciler};
