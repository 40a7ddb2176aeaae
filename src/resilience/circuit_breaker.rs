//! Circuit breaker for operation classes
//!
//! Trips when the failure ratio over a sampling window crosses the
//! configured threshold (once minimum throughput is reached), stays open for
//! the break duration, then probes through a half-open state.

use std::time::{Duration, Instant};

use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::resilience::policy::BreakerSettings;

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation - calls allowed
    Closed,
    /// Failure threshold exceeded - calls short-circuited
    Open,
    /// Recovery probe - a single call allowed through
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half-open"),
        }
    }
}

struct Window {
    started_at: Instant,
    successes: u32,
    failures: u32,
}

impl Window {
    fn new() -> Self {
        Self {
            started_at: Instant::now(),
            successes: 0,
            failures: 0,
        }
    }

    fn total(&self) -> u32 {
        self.successes + self.failures
    }

    fn failure_ratio(&self) -> f64 {
        if self.total() == 0 {
            return 0.0;
        }
        f64::from(self.failures) / f64::from(self.total())
    }
}

struct BreakerState {
    state: CircuitState,
    window: Window,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
}

/// Windowed failure-ratio circuit breaker.
pub struct CircuitBreaker {
    name: String,
    settings: BreakerSettings,
    inner: RwLock<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, settings: BreakerSettings) -> Self {
        Self {
            name: name.into(),
            settings,
            inner: RwLock::new(BreakerState {
                state: CircuitState::Closed,
                window: Window::new(),
                opened_at: None,
                probe_in_flight: false,
            }),
        }
    }

    pub async fn state(&self) -> CircuitState {
        self.inner.read().await.state
    }

    /// Whether a call may proceed. Transitions Open → HalfOpen once the
    /// break duration has elapsed; in HalfOpen only one probe is let through
    /// at a time.
    pub async fn try_acquire(&self) -> bool {
        let mut inner = self.inner.write().await;
        match inner.state {
            CircuitState::Closed => {
                if inner.window.started_at.elapsed() >= self.settings.sampling_window {
                    inner.window = Window::new();
                }
                true
            }
            CircuitState::Open => {
                let elapsed = inner
                    .opened_at
                    .map(|t| t.elapsed())
                    .unwrap_or(Duration::ZERO);
                if elapsed >= self.settings.break_duration {
                    inner.state = CircuitState::HalfOpen;
                    inner.probe_in_flight = true;
                    info!("Circuit {} transitioning to HALF-OPEN", self.name);
                    true
                } else {
                    false
                }
            }
            CircuitState::HalfOpen => {
                if inner.probe_in_flight {
                    false
                } else {
                    inner.probe_in_flight = true;
                    true
                }
            }
        }
    }

    pub async fn record_success(&self) {
        let mut inner = self.inner.write().await;
        match inner.state {
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Closed;
                inner.window = Window::new();
                inner.opened_at = None;
                inner.probe_in_flight = false;
                info!("Circuit {} CLOSED - normal operation resumed", self.name);
            }
            _ => {
                inner.window.successes += 1;
            }
        }
    }

    pub async fn record_failure(&self) {
        let mut inner = self.inner.write().await;
        match inner.state {
            CircuitState::HalfOpen => {
                // Probe failed, back to open for another break period
                inner.state = CircuitState::Open;
                inner.opened_at = Some(Instant::now());
                inner.probe_in_flight = false;
                warn!("Circuit {} probe failed, re-OPENED", self.name);
            }
            CircuitState::Closed => {
                inner.window.failures += 1;
                let total = inner.window.total();
                let ratio = inner.window.failure_ratio();
                if total >= self.settings.min_throughput && ratio >= self.settings.failure_ratio {
                    inner.state = CircuitState::Open;
                    inner.opened_at = Some(Instant::now());
                    warn!(
                        "Circuit {} TRIPPED: {}/{} calls failed in window",
                        self.name, inner.window.failures, total
                    );
                } else {
                    debug!(
                        "Circuit {} failure recorded ({}/{} in window)",
                        self.name, inner.window.failures, total
                    );
                }
            }
            CircuitState::Open => {}
        }
    }

    /// Force the circuit closed (manual reset).
    pub async fn force_close(&self) {
        let mut inner = self.inner.write().await;
        inner.state = CircuitState::Closed;
        inner.window = Window::new();
        inner.opened_at = None;
        inner.probe_in_flight = false;
        warn!("Circuit {} force-closed", self.name);
    }
}
