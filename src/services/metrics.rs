use chrono::Utc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::RwLock;
use tracing::info;

/// Metrics collector for observability
pub struct Metrics {
    /// Payments fully processed (marked processed)
    pub payments_processed: AtomicU64,
    /// Payments that ended in a failed event
    pub payments_failed: AtomicU64,
    /// Allocations that produced an executed order
    pub allocations_executed: AtomicU64,
    /// Allocations skipped as already processed
    pub allocations_skipped: AtomicU64,
    /// Allocations that failed (isolated)
    pub allocations_failed: AtomicU64,
    /// Orders submitted to an exchange
    pub orders_submitted: AtomicU64,
    /// Orders observed filled
    pub orders_filled: AtomicU64,
    /// Dust residuals detected on filled orders
    pub dust_detected: AtomicU64,
    /// Reconciliation cycles completed
    pub reconciliation_cycles: AtomicU64,
    /// Retry/continuation orders enqueued by reconciliation
    pub orders_requeued: AtomicU64,
    /// Last update timestamp
    last_update: RwLock<i64>,
}

impl Metrics {
    /// Create a new metrics instance
    pub fn new() -> Self {
        Self {
            payments_processed: AtomicU64::new(0),
            payments_failed: AtomicU64::new(0),
            allocations_executed: AtomicU64::new(0),
            allocations_skipped: AtomicU64::new(0),
            allocations_failed: AtomicU64::new(0),
            orders_submitted: AtomicU64::new(0),
            orders_filled: AtomicU64::new(0),
            dust_detected: AtomicU64::new(0),
            reconciliation_cycles: AtomicU64::new(0),
            orders_requeued: AtomicU64::new(0),
            last_update: RwLock::new(Utc::now().timestamp()),
        }
    }

    pub fn inc_payments_processed(&self) {
        self.payments_processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_payments_failed(&self) {
        self.payments_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_allocations_executed(&self) {
        self.allocations_executed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_allocations_skipped(&self) {
        self.allocations_skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_allocations_failed(&self) {
        self.allocations_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_orders_submitted(&self) {
        self.orders_submitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_orders_filled(&self) {
        self.orders_filled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_dust_detected(&self) {
        self.dust_detected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_reconciliation_cycles(&self) {
        self.reconciliation_cycles.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_orders_requeued(&self) {
        self.orders_requeued.fetch_add(1, Ordering::Relaxed);
    }

    pub async fn touch(&self) {
        *self.last_update.write().await = Utc::now().timestamp();
    }

    /// Get current metrics as a formatted string
    pub fn summary(&self) -> String {
        format!(
            r#"
=== COINVEST ENGINE STATUS ===
Payments: {} processed / {} failed
Allocations: {} executed / {} skipped / {} failed
Orders: {} submitted / {} filled / {} requeued
Dust events: {} | Reconciliation cycles: {}
==============================
"#,
            self.payments_processed.load(Ordering::Relaxed),
            self.payments_failed.load(Ordering::Relaxed),
            self.allocations_executed.load(Ordering::Relaxed),
            self.allocations_skipped.load(Ordering::Relaxed),
            self.allocations_failed.load(Ordering::Relaxed),
            self.orders_submitted.load(Ordering::Relaxed),
            self.orders_filled.load(Ordering::Relaxed),
            self.orders_requeued.load(Ordering::Relaxed),
            self.dust_detected.load(Ordering::Relaxed),
            self.reconciliation_cycles.load(Ordering::Relaxed),
        )
    }

    /// Export metrics in Prometheus format
    pub fn prometheus(&self) -> String {
        format!(
            r#"# HELP coinvest_payments_processed_total Payments fully processed
# TYPE coinvest_payments_processed_total counter
coinvest_payments_processed_total {}

# HELP coinvest_payments_failed_total Payments marked failed
# TYPE coinvest_payments_failed_total counter
coinvest_payments_failed_total {}

# HELP coinvest_allocations_executed_total Allocations that produced an order
# TYPE coinvest_allocations_executed_total counter
coinvest_allocations_executed_total {}

# HELP coinvest_allocations_skipped_total Allocations skipped as already processed
# TYPE coinvest_allocations_skipped_total counter
coinvest_allocations_skipped_total {}

# HELP coinvest_allocations_failed_total Allocations that failed
# TYPE coinvest_allocations_failed_total counter
coinvest_allocations_failed_total {}

# HELP coinvest_orders_submitted_total Orders submitted to exchanges
# TYPE coinvest_orders_submitted_total counter
coinvest_orders_submitted_total {}

# HELP coinvest_orders_filled_total Orders observed filled
# TYPE coinvest_orders_filled_total counter
coinvest_orders_filled_total {}

# HELP coinvest_orders_requeued_total Retry and continuation orders enqueued
# TYPE coinvest_orders_requeued_total counter
coinvest_orders_requeued_total {}

# HELP coinvest_dust_detected_total Dust residuals on filled orders
# TYPE coinvest_dust_detected_total counter
coinvest_dust_detected_total {}

# HELP coinvest_reconciliation_cycles_total Reconciliation cycles completed
# TYPE coinvest_reconciliation_cycles_total counter
coinvest_reconciliation_cycles_total {}
"#,
            self.payments_processed.load(Ordering::Relaxed),
            self.payments_failed.load(Ordering::Relaxed),
            self.allocations_executed.load(Ordering::Relaxed),
            self.allocations_skipped.load(Ordering::Relaxed),
            self.allocations_failed.load(Ordering::Relaxed),
            self.orders_submitted.load(Ordering::Relaxed),
            self.orders_filled.load(Ordering::Relaxed),
            self.orders_requeued.load(Ordering::Relaxed),
            self.dust_detected.load(Ordering::Relaxed),
            self.reconciliation_cycles.load(Ordering::Relaxed),
        )
    }

    /// Log periodic status
    pub fn log_status(&self) {
        info!("{}", self.summary());
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
