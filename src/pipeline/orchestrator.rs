//! Payment orchestration entry point
//!
//! Consumes payment-received events under idempotency and resilience,
//! fans out to the allocation processor and settles the originating event
//! as processed or failed. Events are never deleted, so no payment can
//! silently vanish.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::config::PipelineConfig;
use crate::domain::{EventKind, OrderResult, Payment, PaymentReceivedEvent, StoredEvent};
use crate::error::{FailureReason, OpFailure, Result};
use crate::persistence::{AllocationSource, EventBus};
use crate::pipeline::allocations::AllocationProcessor;
use crate::pipeline::idempotency::IdempotencyGuard;
use crate::resilience::{Backoff, ResilienceExecutor, ResiliencePolicy};
use crate::services::Metrics;
use crate::validation::{validate_amount, FieldValidator};

pub struct PaymentOrchestrator {
    idempotency: IdempotencyGuard,
    allocation_source: Arc<dyn AllocationSource>,
    processor: Arc<AllocationProcessor>,
    bus: Arc<dyn EventBus>,
    executor: Arc<ResilienceExecutor>,
    metrics: Arc<Metrics>,
    config: PipelineConfig,
    pipeline_policy: ResiliencePolicy,
}

impl PaymentOrchestrator {
    pub fn new(
        idempotency: IdempotencyGuard,
        allocation_source: Arc<dyn AllocationSource>,
        processor: Arc<AllocationProcessor>,
        bus: Arc<dyn EventBus>,
        executor: Arc<ResilienceExecutor>,
        metrics: Arc<Metrics>,
        config: PipelineConfig,
    ) -> Self {
        // Retrying the whole pipeline is safe: completed allocations are
        // netted out on resume via the already-processed short-circuit.
        let pipeline_policy = ResiliencePolicy::builder("payment.pipeline")
            .max_attempts(2)
            .backoff(Backoff::Fixed(Duration::from_millis(500)))
            .attempt_timeout(Duration::from_secs(120))
            .build();
        Self {
            idempotency,
            allocation_source,
            processor,
            bus,
            executor,
            metrics,
            config,
            pipeline_policy,
        }
    }

    /// Handle one payment-received event. Repeat deliveries return the
    /// stored result without re-executing anything.
    pub async fn handle(
        &self,
        event: &PaymentReceivedEvent,
    ) -> std::result::Result<Vec<OrderResult>, OpFailure> {
        let event_key = IdempotencyGuard::event_key(event.event_id);
        let payment_key = IdempotencyGuard::payment_key(event.payment.id);

        if let Some(results) = self.idempotency.get::<Vec<OrderResult>>(&event_key).await {
            debug!(
                "Event {} already processed; returning stored result",
                event.event_id
            );
            return Ok(results);
        }

        // Same payment may arrive under a different delivery event
        if let Some(results) = self.idempotency.get::<Vec<OrderResult>>(&payment_key).await {
            debug!(
                "Payment {} already processed under another event; storing alias",
                event.payment.id
            );
            self.idempotency.store(&event_key, &results).await;
            self.settle_processed(event.event_id).await;
            return Ok(results);
        }

        if !self.idempotency.try_begin(&payment_key).await {
            let failure = OpFailure::new(
                FailureReason::IdempotencyConflict,
                format!("payment {} is already being processed", event.payment.id),
            )
            .with_code("DUPLICATE");
            return Err(failure);
        }

        let outcome = self.run_pipeline(&event.payment).await;
        match outcome {
            Ok(results) => {
                self.idempotency.store(&event_key, &results).await;
                self.idempotency.store(&payment_key, &results).await;
                self.idempotency.release(&payment_key).await;
                self.settle_processed(event.event_id).await;
                self.metrics.inc_payments_processed();
                info!(
                    "Payment {} processed: {} allocation results",
                    event.payment.id,
                    results.len()
                );
                Ok(results)
            }
            Err(failure) => {
                self.idempotency.release(&payment_key).await;
                // The event stays in the log for reprocessing
                if let Err(e) = self
                    .bus
                    .mark_failed(event.event_id, &failure.message)
                    .await
                {
                    warn!("Failed to mark event {} failed: {}", event.event_id, e);
                }
                self.metrics.inc_payments_failed();
                error!("Payment {} failed: {}", event.payment.id, failure);
                Err(failure)
            }
        }
    }

    async fn run_pipeline(
        &self,
        payment: &Payment,
    ) -> std::result::Result<Vec<OrderResult>, OpFailure> {
        Self::validate_payment(payment)?;

        let allocations = self
            .allocation_source
            .allocations_for_subscription(payment.subscription_id)
            .await
            .map_err(|e| OpFailure::from(&e))?;

        self.executor
            .execute(&self.pipeline_policy, || {
                let payment = payment.clone();
                let allocations = allocations.clone();
                let processor = self.processor.clone();
                async move { processor.process(&payment, &allocations).await }
            })
            .await
    }

    /// Field-level payment validation, run before any I/O.
    fn validate_payment(payment: &Payment) -> std::result::Result<(), OpFailure> {
        let mut validator = FieldValidator::new();
        validator
            .check(
                "net_amount",
                validate_amount(payment.net_amount, "net_amount"),
            )
            .check(
                "currency",
                if payment.currency.trim().is_empty() {
                    Err(crate::error::CoinvestError::Validation(
                        "currency cannot be empty".to_string(),
                    ))
                } else {
                    Ok(())
                },
            )
            .check(
                "provider_tx_id",
                if payment.provider_tx_id.trim().is_empty() {
                    Err(crate::error::CoinvestError::Validation(
                        "provider_tx_id cannot be empty".to_string(),
                    ))
                } else {
                    Ok(())
                },
            );
        validator.finish()
    }

    async fn settle_processed(&self, event_id: uuid::Uuid) {
        if let Err(e) = self.bus.mark_processed(event_id).await {
            debug!("Could not mark event {} processed: {}", event_id, e);
        }
    }

    /// Drain a batch of unprocessed payment events from the durable log.
    /// Returns how many were handled successfully.
    pub async fn drain(&self) -> Result<usize> {
        let events = self
            .bus
            .unprocessed(EventKind::PaymentReceived, self.config.event_batch_size)
            .await?;

        if events.is_empty() {
            return Ok(0);
        }

        debug!("Draining {} unprocessed payment events", events.len());
        let mut handled = 0usize;
        for stored in events {
            match Self::parse_event(&stored) {
                Ok(event) => {
                    if self.handle(&event).await.is_ok() {
                        handled += 1;
                    }
                }
                Err(e) => {
                    error!("Malformed payment event {}: {}", stored.id, e);
                    if let Err(mark_err) =
                        self.bus.mark_failed(stored.id, &e.to_string()).await
                    {
                        error!(
                            "Failed to mark malformed event {} failed: {}",
                            stored.id, mark_err
                        );
                    }
                }
            }
        }
        Ok(handled)
    }

    fn parse_event(stored: &StoredEvent) -> Result<PaymentReceivedEvent> {
        let payment: Payment = serde_json::from_value(stored.payload.clone())?;
        Ok(PaymentReceivedEvent {
            event_id: stored.id,
            payment,
        })
    }
}
