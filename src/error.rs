use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Main error type for the auto-invest engine
#[derive(Error, Debug)]
pub enum CoinvestError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    // Database errors
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    // Serialization errors
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    // Validation errors
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    // Admission / balance errors
    #[error("Insufficient balance on {exchange}: required {required}, available {available}")]
    InsufficientBalance {
        exchange: String,
        required: rust_decimal::Decimal,
        available: rust_decimal::Decimal,
    },

    // Exchange errors
    #[error("Exchange API error: {0}")]
    ExchangeApi(String),

    #[error("Rate limited: {0}")]
    RateLimited(String),

    // Order execution errors
    #[error("Order execution failed: {0}")]
    OrderExecution(String),

    #[error("Order rejected: {0}")]
    OrderRejected(String),

    // Resilience errors
    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("Operation timed out after {elapsed_ms}ms")]
    Timeout { elapsed_ms: u64 },

    #[error("Circuit breaker open: {0}")]
    CircuitOpen(String),

    // Idempotency errors
    #[error("Duplicate processing detected for key: {0}")]
    IdempotencyConflict(String),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Generic errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

/// Result type alias for CoinvestError
pub type Result<T> = std::result::Result<T, CoinvestError>;

/// Finite failure taxonomy surfaced to callers.
///
/// Every terminating error is classified into exactly one reason so the
/// pipeline can decide between retry, isolation and terminal failure without
/// string matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    Validation,
    NotFound,
    InsufficientBalance,
    ExchangeApi,
    OrderExecution,
    Database,
    ServiceUnavailable,
    IdempotencyConflict,
    Unknown,
}

impl FailureReason {
    /// Validation and not-found failures are terminal for the unit of work
    /// that raised them and must never be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            FailureReason::ExchangeApi
                | FailureReason::Database
                | FailureReason::ServiceUnavailable
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FailureReason::Validation => "validation_error",
            FailureReason::NotFound => "not_found",
            FailureReason::InsufficientBalance => "insufficient_balance",
            FailureReason::ExchangeApi => "exchange_api_error",
            FailureReason::OrderExecution => "order_execution_failed",
            FailureReason::Database => "database_error",
            FailureReason::ServiceUnavailable => "service_unavailable",
            FailureReason::IdempotencyConflict => "idempotency_conflict",
            FailureReason::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl CoinvestError {
    /// Classify this error into the failure taxonomy.
    pub fn reason(&self) -> FailureReason {
        match self {
            CoinvestError::Validation(_) | CoinvestError::Config(_) => FailureReason::Validation,
            CoinvestError::NotFound { .. } => FailureReason::NotFound,
            CoinvestError::InsufficientBalance { .. } => FailureReason::InsufficientBalance,
            CoinvestError::ExchangeApi(_) | CoinvestError::RateLimited(_) => {
                FailureReason::ExchangeApi
            }
            CoinvestError::OrderExecution(_) | CoinvestError::OrderRejected(_) => {
                FailureReason::OrderExecution
            }
            CoinvestError::Database(_) | CoinvestError::Migration(_) => FailureReason::Database,
            CoinvestError::ServiceUnavailable(_)
            | CoinvestError::Timeout { .. }
            | CoinvestError::CircuitOpen(_) => FailureReason::ServiceUnavailable,
            CoinvestError::IdempotencyConflict(_) => FailureReason::IdempotencyConflict,
            CoinvestError::Json(_)
            | CoinvestError::Io(_)
            | CoinvestError::Internal(_)
            | CoinvestError::Other(_) => FailureReason::Unknown,
        }
    }

    /// Optional machine error code for callers that need one.
    pub fn code(&self) -> Option<&'static str> {
        match self {
            CoinvestError::InsufficientBalance { .. } => Some("BALANCE_INSUFFICIENT"),
            CoinvestError::OrderRejected(_) => Some("ORDER_REJECTED"),
            CoinvestError::CircuitOpen(_) => Some("CIRCUIT_OPEN"),
            CoinvestError::Timeout { .. } => Some("TIMEOUT"),
            CoinvestError::RateLimited(_) => Some("RATE_LIMITED"),
            CoinvestError::IdempotencyConflict(_) => Some("DUPLICATE"),
            _ => None,
        }
    }
}

/// Structured failure handed to callers of the resilience layer and the
/// payment pipeline. Stack traces are never included; `field_errors` is only
/// populated for validation failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpFailure {
    pub reason: FailureReason,
    pub message: String,
    pub code: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub field_errors: HashMap<String, String>,
}

impl OpFailure {
    pub fn new(reason: FailureReason, message: impl Into<String>) -> Self {
        Self {
            reason,
            message: message.into(),
            code: None,
            field_errors: HashMap::new(),
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn with_field(mut self, field: impl Into<String>, error: impl Into<String>) -> Self {
        self.field_errors.insert(field.into(), error.into());
        self
    }
}

impl From<&CoinvestError> for OpFailure {
    fn from(err: &CoinvestError) -> Self {
        Self {
            reason: err.reason(),
            message: err.to_string(),
            code: err.code().map(str::to_string),
            field_errors: HashMap::new(),
        }
    }
}

impl From<CoinvestError> for OpFailure {
    fn from(err: CoinvestError) -> Self {
        OpFailure::from(&err)
    }
}

impl From<OpFailure> for CoinvestError {
    fn from(failure: OpFailure) -> Self {
        match failure.reason {
            FailureReason::Validation => CoinvestError::Validation(failure.message),
            FailureReason::NotFound => CoinvestError::Internal(failure.message),
            FailureReason::InsufficientBalance => CoinvestError::OrderExecution(failure.message),
            FailureReason::ExchangeApi => CoinvestError::ExchangeApi(failure.message),
            FailureReason::OrderExecution => CoinvestError::OrderExecution(failure.message),
            FailureReason::Database => CoinvestError::Internal(failure.message),
            FailureReason::ServiceUnavailable => CoinvestError::ServiceUnavailable(failure.message),
            FailureReason::IdempotencyConflict => {
                CoinvestError::IdempotencyConflict(failure.message)
            }
            FailureReason::Unknown => CoinvestError::Internal(failure.message),
        }
    }
}

impl std::fmt::Display for OpFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.reason, self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn classifies_validation_as_non_retryable() {
        let err = CoinvestError::Validation("percent out of range".to_string());
        assert_eq!(err.reason(), FailureReason::Validation);
        assert!(!err.reason().is_retryable());
    }

    #[test]
    fn classifies_timeout_as_service_unavailable() {
        let err = CoinvestError::Timeout { elapsed_ms: 5000 };
        assert_eq!(err.reason(), FailureReason::ServiceUnavailable);
        assert!(err.reason().is_retryable());
    }

    #[test]
    fn insufficient_balance_carries_code() {
        let err = CoinvestError::InsufficientBalance {
            exchange: "binance".to_string(),
            required: dec!(100),
            available: dec!(40),
        };
        assert_eq!(err.reason(), FailureReason::InsufficientBalance);
        assert_eq!(err.code(), Some("BALANCE_INSUFFICIENT"));
        assert!(!err.reason().is_retryable());
    }

    #[test]
    fn op_failure_from_error_keeps_reason_and_code() {
        let err = CoinvestError::OrderRejected("filter failure".to_string());
        let failure = OpFailure::from(&err);
        assert_eq!(failure.reason, FailureReason::OrderExecution);
        assert_eq!(failure.code.as_deref(), Some("ORDER_REJECTED"));
    }

    #[test]
    fn op_failure_field_errors_round_trip() {
        let failure = OpFailure::new(FailureReason::Validation, "bad input")
            .with_field("percent", "must be in (0, 100]");
        let json = serde_json::to_string(&failure).unwrap();
        let parsed: OpFailure = serde_json::from_str(&json).unwrap();
        assert_eq!(
            parsed.field_errors.get("percent").map(String::as_str),
            Some("must be in (0, 100]")
        );
    }
}
