//! Funding request work queue
//!
//! Shortfall and low-balance funding requests flow through a bounded channel
//! consumed by one background worker, so failures and backpressure stay
//! observable instead of disappearing into detached tasks. The underlying
//! funding mechanism is slow and not idempotency-safe, so requests are
//! deduplicated by rounded amount within a cooldown window before anything
//! is published.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rust_decimal::{Decimal, RoundingStrategy};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::domain::{EventKind, FundingRequestedEvent, StoredEvent};
use crate::persistence::{CacheStore, EventBus, NotificationSink};

/// Sender half handed to the balance gate.
#[derive(Clone)]
pub struct FundingHandle {
    tx: mpsc::Sender<FundingRequestedEvent>,
}

impl FundingHandle {
    /// Enqueue a funding request, waiting for queue capacity. Used on the
    /// shortfall path where the request must be on the queue before the
    /// admission failure is returned.
    pub async fn request(&self, event: FundingRequestedEvent) {
        if self.tx.send(event).await.is_err() {
            error!("Funding worker is gone; dropping funding request");
        }
    }

    /// Enqueue without blocking the caller. Used on the low-balance path;
    /// a full queue drops the request with a warning.
    pub fn request_background(&self, event: FundingRequestedEvent) {
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(event)) => {
                warn!(
                    "Funding queue full, dropping background request for {} on {}",
                    event.amount, event.exchange_name
                );
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                error!("Funding worker is gone; dropping funding request");
            }
        }
    }
}

/// Funding worker statistics
#[derive(Debug, Clone, Copy, Default)]
pub struct FundingStats {
    pub issued: u64,
    pub deduplicated: u64,
    pub publish_errors: u64,
}

struct Counters {
    issued: AtomicU64,
    deduplicated: AtomicU64,
    publish_errors: AtomicU64,
}

/// Background consumer of the funding queue.
pub struct FundingWorker {
    rx: mpsc::Receiver<FundingRequestedEvent>,
    cache: Arc<dyn CacheStore>,
    bus: Arc<dyn EventBus>,
    sink: Arc<dyn NotificationSink>,
    dedup_window: Duration,
    counters: Arc<Counters>,
}

/// Shared view of the worker counters, usable after the worker is spawned.
#[derive(Clone)]
pub struct FundingStatsHandle {
    counters: Arc<Counters>,
}

impl FundingStatsHandle {
    pub fn snapshot(&self) -> FundingStats {
        FundingStats {
            issued: self.counters.issued.load(Ordering::Relaxed),
            deduplicated: self.counters.deduplicated.load(Ordering::Relaxed),
            publish_errors: self.counters.publish_errors.load(Ordering::Relaxed),
        }
    }
}

impl FundingWorker {
    /// Build the queue; the returned worker must be driven via [`run`].
    pub fn channel(
        capacity: usize,
        cache: Arc<dyn CacheStore>,
        bus: Arc<dyn EventBus>,
        sink: Arc<dyn NotificationSink>,
        dedup_window: Duration,
    ) -> (FundingHandle, FundingWorker, FundingStatsHandle) {
        let (tx, rx) = mpsc::channel(capacity);
        let counters = Arc::new(Counters {
            issued: AtomicU64::new(0),
            deduplicated: AtomicU64::new(0),
            publish_errors: AtomicU64::new(0),
        });
        let stats = FundingStatsHandle {
            counters: counters.clone(),
        };
        (
            FundingHandle { tx },
            FundingWorker {
                rx,
                cache,
                bus,
                sink,
                dedup_window,
                counters,
            },
            stats,
        )
    }

    /// Consume the queue until every sender is dropped.
    pub async fn run(mut self) {
        info!("Funding worker started");
        while let Some(event) = self.rx.recv().await {
            self.process(event).await;
        }
        info!("Funding worker stopped");
    }

    /// Dedup key: exchange plus the amount rounded to whole units, so
    /// near-identical requests within the cooldown collapse into one.
    fn dedup_key(event: &FundingRequestedEvent) -> String {
        let rounded = event
            .amount
            .round_dp_with_strategy(0, RoundingStrategy::AwayFromZero);
        format!("funding:{}:{}:{}", event.exchange_name, event.reserve_ticker, rounded)
    }

    async fn process(&self, event: FundingRequestedEvent) {
        let key = Self::dedup_key(&event);
        let first = self
            .cache
            .set_if_absent(&key, serde_json::Value::Bool(true), self.dedup_window)
            .await;

        if !first {
            debug!(
                "Suppressing duplicate funding request for {} {} on {}",
                event.amount, event.reserve_ticker, event.exchange_name
            );
            self.counters.deduplicated.fetch_add(1, Ordering::Relaxed);
            return;
        }

        let payload = match serde_json::to_value(&event) {
            Ok(payload) => payload,
            Err(e) => {
                error!("Failed to serialize funding request: {}", e);
                self.counters.publish_errors.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };

        let stored = StoredEvent::new(EventKind::FundingRequested, payload);
        if let Err(e) = self.bus.publish(&stored).await {
            error!("Failed to publish funding request event: {}", e);
            self.counters.publish_errors.fetch_add(1, Ordering::Relaxed);
            // Allow a retry of the same amount before the cooldown expires
            self.cache.invalidate(&key).await;
            return;
        }

        if let Err(e) = self.sink.notify_funding_request(&event).await {
            warn!("Funding notification failed (ignored): {}", e);
        }

        info!(
            "Funding requested: {} {} on {}",
            event.amount, event.reserve_ticker, event.exchange_name
        );
        self.counters.issued.fetch_add(1, Ordering::Relaxed);
    }
}
