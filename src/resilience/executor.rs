//! Resilience execution wrapper
//!
//! Every external call goes through [`ResilienceExecutor::execute`]: retry
//! with backoff and optional jitter, per-attempt timeout, circuit breaker,
//! sliding-window rate limit and a concurrency bulkhead, composed according
//! to the policy. Runtime state is shared per policy name, so all callers of
//! one operation class see the same circuit and budget.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use rand::Rng;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::error::{CoinvestError, FailureReason, OpFailure, Result};
use crate::resilience::circuit_breaker::CircuitBreaker;
use crate::resilience::policy::ResiliencePolicy;
use crate::resilience::rate_limiter::SlidingWindowRateLimiter;

/// Per-operation-class counters.
#[derive(Default)]
pub struct OperationStats {
    pub calls: AtomicU64,
    pub successes: AtomicU64,
    pub failures: AtomicU64,
    pub retries: AtomicU64,
    pub short_circuits: AtomicU64,
    pub timeouts: AtomicU64,
    pub total_latency_ms: AtomicU64,
}

/// Plain-value snapshot for metrics export.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub calls: u64,
    pub successes: u64,
    pub failures: u64,
    pub retries: u64,
    pub short_circuits: u64,
    pub timeouts: u64,
    pub total_latency_ms: u64,
}

impl OperationStats {
    fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            calls: self.calls.load(Ordering::Relaxed),
            successes: self.successes.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            short_circuits: self.short_circuits.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            total_latency_ms: self.total_latency_ms.load(Ordering::Relaxed),
        }
    }
}

struct PolicyRuntime {
    breaker: Option<CircuitBreaker>,
    limiter: Option<SlidingWindowRateLimiter>,
    bulkhead: Option<Semaphore>,
    stats: OperationStats,
}

impl PolicyRuntime {
    fn from_policy(policy: &ResiliencePolicy) -> Self {
        Self {
            breaker: policy
                .breaker
                .map(|settings| CircuitBreaker::new(policy.name.clone(), settings)),
            limiter: policy.rate_limit.map(SlidingWindowRateLimiter::new),
            bulkhead: policy.max_in_flight.map(Semaphore::new),
            stats: OperationStats::default(),
        }
    }
}

/// Best-effort success/error callbacks. Panics inside a hook are caught,
/// logged and swallowed; they never override the primary result.
pub struct ExecutionHooks<T> {
    on_success: Option<Box<dyn Fn(&T) + Send + Sync>>,
    on_error: Option<Box<dyn Fn(&OpFailure) + Send + Sync>>,
}

impl<T> Default for ExecutionHooks<T> {
    fn default() -> Self {
        Self {
            on_success: None,
            on_error: None,
        }
    }
}

impl<T> ExecutionHooks<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_success(mut self, hook: impl Fn(&T) + Send + Sync + 'static) -> Self {
        self.on_success = Some(Box::new(hook));
        self
    }

    pub fn on_error(mut self, hook: impl Fn(&OpFailure) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Box::new(hook));
        self
    }

    fn fire_success(&self, value: &T) {
        if let Some(hook) = &self.on_success {
            if catch_unwind(AssertUnwindSafe(|| hook(value))).is_err() {
                warn!("Success callback panicked; ignoring");
            }
        }
    }

    fn fire_error(&self, failure: &OpFailure) {
        if let Some(hook) = &self.on_error {
            if catch_unwind(AssertUnwindSafe(|| hook(failure))).is_err() {
                warn!("Error callback panicked; ignoring");
            }
        }
    }
}

/// Shared executor applying resilience policies to async operations.
#[derive(Default)]
pub struct ResilienceExecutor {
    runtimes: DashMap<String, Arc<PolicyRuntime>>,
}

impl ResilienceExecutor {
    pub fn new() -> Self {
        Self {
            runtimes: DashMap::new(),
        }
    }

    fn runtime(&self, policy: &ResiliencePolicy) -> Arc<PolicyRuntime> {
        self.runtimes
            .entry(policy.name.clone())
            .or_insert_with(|| Arc::new(PolicyRuntime::from_policy(policy)))
            .clone()
    }

    /// Counter snapshot for one operation class, if it has run.
    pub fn stats(&self, name: &str) -> Option<StatsSnapshot> {
        self.runtimes.get(name).map(|r| r.stats.snapshot())
    }

    /// Snapshots for all operation classes seen so far.
    pub fn all_stats(&self) -> Vec<(String, StatsSnapshot)> {
        self.runtimes
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().stats.snapshot()))
            .collect()
    }

    /// Execute `op` under `policy`.
    pub async fn execute<T, F, Fut>(
        &self,
        policy: &ResiliencePolicy,
        op: F,
    ) -> std::result::Result<T, OpFailure>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        self.execute_with_hooks(policy, op, ExecutionHooks::new())
            .await
    }

    /// Execute `op` under `policy` with best-effort callbacks.
    pub async fn execute_with_hooks<T, F, Fut>(
        &self,
        policy: &ResiliencePolicy,
        op: F,
        hooks: ExecutionHooks<T>,
    ) -> std::result::Result<T, OpFailure>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let runtime = self.runtime(policy);
        runtime.stats.calls.fetch_add(1, Ordering::Relaxed);
        let started = Instant::now();

        // Bulkhead permit is held for the whole call, retries included.
        let _permit = match &runtime.bulkhead {
            Some(semaphore) => match semaphore.acquire().await {
                Ok(permit) => Some(permit),
                Err(_) => {
                    let failure = OpFailure::new(
                        FailureReason::ServiceUnavailable,
                        format!("bulkhead closed for {}", policy.name),
                    );
                    runtime.stats.failures.fetch_add(1, Ordering::Relaxed);
                    hooks.fire_error(&failure);
                    return Err(failure);
                }
            },
            None => None,
        };

        let mut last_error: Option<CoinvestError> = None;

        for attempt in 1..=policy.max_attempts {
            if let Some(breaker) = &runtime.breaker {
                if !breaker.try_acquire().await {
                    runtime.stats.short_circuits.fetch_add(1, Ordering::Relaxed);
                    runtime.stats.failures.fetch_add(1, Ordering::Relaxed);
                    let failure = OpFailure::new(
                        FailureReason::ServiceUnavailable,
                        format!("circuit open for {}", policy.name),
                    )
                    .with_code("CIRCUIT_OPEN");
                    hooks.fire_error(&failure);
                    return Err(failure);
                }
            }

            if let Some(limiter) = &runtime.limiter {
                limiter.acquire().await;
            }

            let outcome = tokio::time::timeout(policy.attempt_timeout, op()).await;

            match outcome {
                Ok(Ok(value)) => {
                    if let Some(breaker) = &runtime.breaker {
                        breaker.record_success().await;
                    }
                    runtime.stats.successes.fetch_add(1, Ordering::Relaxed);
                    if !policy.lightweight {
                        let elapsed = started.elapsed().as_millis() as u64;
                        runtime
                            .stats
                            .total_latency_ms
                            .fetch_add(elapsed, Ordering::Relaxed);
                        debug!(
                            "{} succeeded on attempt {}/{} in {}ms",
                            policy.name, attempt, policy.max_attempts, elapsed
                        );
                    }
                    hooks.fire_success(&value);
                    return Ok(value);
                }
                Ok(Err(err)) => {
                    let reason = err.reason();
                    if reason.is_retryable() {
                        if let Some(breaker) = &runtime.breaker {
                            breaker.record_failure().await;
                        }
                    }
                    if !reason.is_retryable() {
                        runtime.stats.failures.fetch_add(1, Ordering::Relaxed);
                        let failure = OpFailure::from(&err);
                        hooks.fire_error(&failure);
                        return Err(failure);
                    }
                    if !policy.lightweight {
                        debug!(
                            "{} attempt {}/{} failed: {}",
                            policy.name, attempt, policy.max_attempts, err
                        );
                    }
                    last_error = Some(err);
                }
                Err(_elapsed) => {
                    runtime.stats.timeouts.fetch_add(1, Ordering::Relaxed);
                    if let Some(breaker) = &runtime.breaker {
                        breaker.record_failure().await;
                    }
                    let err = CoinvestError::Timeout {
                        elapsed_ms: policy.attempt_timeout.as_millis() as u64,
                    };
                    if !policy.lightweight {
                        debug!(
                            "{} attempt {}/{} timed out after {:?}",
                            policy.name, attempt, policy.max_attempts, policy.attempt_timeout
                        );
                    }
                    last_error = Some(err);
                }
            }

            if attempt < policy.max_attempts {
                runtime.stats.retries.fetch_add(1, Ordering::Relaxed);
                tokio::time::sleep(self.delay_for(policy, attempt)).await;
            }
        }

        runtime.stats.failures.fetch_add(1, Ordering::Relaxed);
        let failure = match last_error {
            Some(err) => {
                // Exhausted timeouts surface as service unavailable
                let mut failure = OpFailure::from(&err);
                failure.message = format!(
                    "{} failed after {} attempts: {}",
                    policy.name, policy.max_attempts, failure.message
                );
                failure
            }
            None => OpFailure::new(
                FailureReason::Unknown,
                format!("{} failed without error detail", policy.name),
            ),
        };
        warn!("{}", failure.message);
        hooks.fire_error(&failure);
        Err(failure)
    }

    fn delay_for(&self, policy: &ResiliencePolicy, failed_attempt: u32) -> std::time::Duration {
        let base = policy.backoff.delay(failed_attempt);
        if !policy.jitter {
            return base;
        }
        // Equal jitter: half deterministic, half random
        let half = base / 2;
        let jitter_ms = rand::thread_rng().gen_range(0..=half.as_millis().max(1) as u64);
        half + std::time::Duration::from_millis(jitter_ms)
    }
}
