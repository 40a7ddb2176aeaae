use std::collections::VecDeque;
use std::time::Instant;

use tokio::sync::Mutex;
use tracing::trace;

use crate::resilience::policy::RateLimitSettings;

/// Sliding-window rate limiter.
///
/// Tracks the timestamps of recent acquisitions; when the window is full,
/// `acquire` sleeps until the oldest permit slides out. Fair enough for the
/// handful of operation classes that use it.
pub struct SlidingWindowRateLimiter {
    settings: RateLimitSettings,
    timestamps: Mutex<VecDeque<Instant>>,
}

impl SlidingWindowRateLimiter {
    pub fn new(settings: RateLimitSettings) -> Self {
        Self {
            settings,
            timestamps: Mutex::new(VecDeque::with_capacity(settings.permits as usize)),
        }
    }

    /// Wait until a permit is available inside the window.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut timestamps = self.timestamps.lock().await;
                let now = Instant::now();

                while let Some(front) = timestamps.front() {
                    if now.duration_since(*front) >= self.settings.window {
                        timestamps.pop_front();
                    } else {
                        break;
                    }
                }

                match timestamps.front().copied() {
                    Some(front) if (timestamps.len() as u32) >= self.settings.permits => {
                        // Window full; sleep until the oldest permit expires
                        self.settings.window - now.duration_since(front)
                    }
                    _ => {
                        timestamps.push_back(now);
                        return;
                    }
                }
            };

            trace!("Rate limit reached, waiting {:?}", wait);
            tokio::time::sleep(wait).await;
        }
    }

    /// Non-blocking variant: take a permit if one is free.
    pub async fn try_acquire(&self) -> bool {
        let mut timestamps = self.timestamps.lock().await;
        let now = Instant::now();

        while let Some(front) = timestamps.front() {
            if now.duration_since(*front) >= self.settings.window {
                timestamps.pop_front();
            } else {
                break;
            }
        }

        if (timestamps.len() as u32) < self.settings.permits {
            timestamps.push_back(now);
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn limiter(permits: u32, window_ms: u64) -> SlidingWindowRateLimiter {
        SlidingWindowRateLimiter::new(RateLimitSettings {
            permits,
            window: Duration::from_millis(window_ms),
        })
    }

    #[tokio::test]
    async fn permits_up_to_capacity() {
        let limiter = limiter(3, 1000);
        assert!(limiter.try_acquire().await);
        assert!(limiter.try_acquire().await);
        assert!(limiter.try_acquire().await);
        assert!(!limiter.try_acquire().await);
    }

    #[tokio::test]
    async fn permits_return_after_window() {
        let limiter = limiter(1, 20);
        assert!(limiter.try_acquire().await);
        assert!(!limiter.try_acquire().await);

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(limiter.try_acquire().await);
    }

    #[tokio::test]
    async fn acquire_blocks_until_free() {
        let limiter = limiter(1, 30);
        limiter.acquire().await;

        let start = Instant::now();
        limiter.acquire().await;
        assert!(start.elapsed() >= Duration::from_millis(20));
    }
}
