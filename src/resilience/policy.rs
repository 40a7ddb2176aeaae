use std::time::Duration;

/// Backoff strategy between retry attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// Same delay every attempt
    Fixed(Duration),
    /// Delay grows linearly with the attempt number
    Linear(Duration),
    /// Delay doubles per attempt, capped
    Exponential { base: Duration, cap: Duration },
}

impl Backoff {
    /// Delay before the next attempt, given the number of the attempt that
    /// just failed (1-based).
    pub fn delay(&self, failed_attempt: u32) -> Duration {
        match self {
            Backoff::Fixed(delay) => *delay,
            Backoff::Linear(step) => step.saturating_mul(failed_attempt),
            Backoff::Exponential { base, cap } => {
                let exp = failed_attempt.saturating_sub(1).min(16);
                let delay = base.saturating_mul(2u32.saturating_pow(exp));
                delay.min(*cap)
            }
        }
    }
}

/// Circuit breaker thresholds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BreakerSettings {
    /// Failure ratio over the sampling window that trips the circuit
    pub failure_ratio: f64,
    /// Width of the sampling window
    pub sampling_window: Duration,
    /// Minimum calls observed in the window before the ratio is evaluated
    pub min_throughput: u32,
    /// How long the circuit stays open before probing
    pub break_duration: Duration,
}

/// Sliding-window rate limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitSettings {
    pub permits: u32,
    pub window: Duration,
}

/// Immutable resilience policy applied to an operation class.
///
/// Built once via [`PolicyBuilder`] and shared by value; runtime state
/// (breaker, limiter, bulkhead) is keyed by `name` inside the executor, so
/// two policies with the same name share one circuit.
#[derive(Debug, Clone)]
pub struct ResiliencePolicy {
    pub name: String,
    pub max_attempts: u32,
    pub backoff: Backoff,
    pub jitter: bool,
    pub attempt_timeout: Duration,
    pub breaker: Option<BreakerSettings>,
    pub rate_limit: Option<RateLimitSettings>,
    /// Concurrency bulkhead: maximum in-flight executions
    pub max_in_flight: Option<usize>,
    /// Skip per-attempt tracing/latency metrics on hot paths
    pub lightweight: bool,
}

impl ResiliencePolicy {
    pub fn builder(name: impl Into<String>) -> PolicyBuilder {
        PolicyBuilder::new(name)
    }

    /// Short-lived internal operations: one retry, tight timeout.
    pub fn quick(name: impl Into<String>) -> Self {
        Self::builder(name)
            .max_attempts(2)
            .backoff(Backoff::Fixed(Duration::from_millis(100)))
            .attempt_timeout(Duration::from_secs(3))
            .build()
    }

    /// Database reads: few retries, short timeout, tolerant breaker.
    pub fn database_read(name: impl Into<String>) -> Self {
        Self::builder(name)
            .max_attempts(2)
            .backoff(Backoff::Fixed(Duration::from_millis(200)))
            .attempt_timeout(Duration::from_secs(5))
            .breaker(BreakerSettings {
                failure_ratio: 0.8,
                sampling_window: Duration::from_secs(30),
                min_throughput: 10,
                break_duration: Duration::from_secs(10),
            })
            .build()
    }

    /// Database writes: more retries, longer timeout, stricter breaker.
    pub fn database_write(name: impl Into<String>) -> Self {
        Self::builder(name)
            .max_attempts(4)
            .backoff(Backoff::Exponential {
                base: Duration::from_millis(250),
                cap: Duration::from_secs(5),
            })
            .jitter(true)
            .attempt_timeout(Duration::from_secs(15))
            .breaker(BreakerSettings {
                failure_ratio: 0.5,
                sampling_window: Duration::from_secs(30),
                min_throughput: 5,
                break_duration: Duration::from_secs(30),
            })
            .build()
    }

    /// External exchange calls: retry + breaker + timeout plus a sliding
    /// window rate limiter and a concurrency bulkhead. External partners are
    /// scarce, so the break duration is the longest of the presets.
    pub fn exchange_api(name: impl Into<String>) -> Self {
        Self::builder(name)
            .max_attempts(3)
            .backoff(Backoff::Exponential {
                base: Duration::from_millis(500),
                cap: Duration::from_secs(10),
            })
            .jitter(true)
            .attempt_timeout(Duration::from_secs(30))
            .breaker(BreakerSettings {
                failure_ratio: 0.5,
                sampling_window: Duration::from_secs(60),
                min_throughput: 5,
                break_duration: Duration::from_secs(60),
            })
            .rate_limit(RateLimitSettings {
                permits: 10,
                window: Duration::from_secs(1),
            })
            .max_in_flight(10)
            .build()
    }
}

/// Builder producing an immutable [`ResiliencePolicy`].
#[derive(Debug, Clone)]
pub struct PolicyBuilder {
    policy: ResiliencePolicy,
}

impl PolicyBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            policy: ResiliencePolicy {
                name: name.into(),
                max_attempts: 1,
                backoff: Backoff::Fixed(Duration::from_millis(100)),
                jitter: false,
                attempt_timeout: Duration::from_secs(10),
                breaker: None,
                rate_limit: None,
                max_in_flight: None,
                lightweight: false,
            },
        }
    }

    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.policy.max_attempts = attempts.max(1);
        self
    }

    pub fn backoff(mut self, backoff: Backoff) -> Self {
        self.policy.backoff = backoff;
        self
    }

    pub fn jitter(mut self, jitter: bool) -> Self {
        self.policy.jitter = jitter;
        self
    }

    pub fn attempt_timeout(mut self, timeout: Duration) -> Self {
        self.policy.attempt_timeout = timeout;
        self
    }

    pub fn breaker(mut self, settings: BreakerSettings) -> Self {
        self.policy.breaker = Some(settings);
        self
    }

    pub fn rate_limit(mut self, settings: RateLimitSettings) -> Self {
        self.policy.rate_limit = Some(settings);
        self
    }

    pub fn max_in_flight(mut self, max: usize) -> Self {
        self.policy.max_in_flight = Some(max.max(1));
        self
    }

    pub fn lightweight(mut self, lightweight: bool) -> Self {
        self.policy.lightweight = lightweight;
        self
    }

    pub fn build(self) -> ResiliencePolicy {
        self.policy
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_backoff_is_constant() {
        let backoff = Backoff::Fixed(Duration::from_millis(100));
        assert_eq!(backoff.delay(1), Duration::from_millis(100));
        assert_eq!(backoff.delay(5), Duration::from_millis(100));
    }

    #[test]
    fn linear_backoff_grows_with_attempts() {
        let backoff = Backoff::Linear(Duration::from_millis(100));
        assert_eq!(backoff.delay(1), Duration::from_millis(100));
        assert_eq!(backoff.delay(3), Duration::from_millis(300));
    }

    #[test]
    fn exponential_backoff_doubles_and_caps() {
        let backoff = Backoff::Exponential {
            base: Duration::from_secs(1),
            cap: Duration::from_secs(8),
        };
        assert_eq!(backoff.delay(1), Duration::from_secs(1));
        assert_eq!(backoff.delay(2), Duration::from_secs(2));
        assert_eq!(backoff.delay(3), Duration::from_secs(4));
        assert_eq!(backoff.delay(4), Duration::from_secs(8));
        assert_eq!(backoff.delay(10), Duration::from_secs(8)); // capped
    }

    #[test]
    fn builder_enforces_minimums() {
        let policy = ResiliencePolicy::builder("test")
            .max_attempts(0)
            .max_in_flight(0)
            .build();
        assert_eq!(policy.max_attempts, 1);
        assert_eq!(policy.max_in_flight, Some(1));
    }

    #[test]
    fn exchange_preset_carries_limiter_and_bulkhead() {
        let policy = ResiliencePolicy::exchange_api("exchange");
        assert!(policy.rate_limit.is_some());
        assert_eq!(policy.max_in_flight, Some(10));
        let breaker = policy.breaker.unwrap();
        assert_eq!(breaker.break_duration, Duration::from_secs(60));
    }
}
