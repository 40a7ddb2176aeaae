use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use uuid::Uuid;

use crate::persistence::{cache_get, cache_set, CacheStore};

/// Records "operation X already completed with result Y" so repeat
/// deliveries become no-ops returning the stored result.
///
/// Two independent key domains exist: payment id and event id, because a
/// payment can be resubmitted by id even when its delivery event differs.
/// `try_begin`/`release` bound (not eliminate) the concurrent-delivery race
/// with an atomic set-if-absent marker; the narrow remaining window is
/// covered by duplicate-key detection at the persistence boundary.
pub struct IdempotencyGuard {
    cache: Arc<dyn CacheStore>,
    result_ttl: Duration,
}

/// TTL of the in-progress marker; long enough to cover one full pipeline
/// run, short enough that a crashed worker does not block reprocessing.
const IN_PROGRESS_TTL: Duration = Duration::from_secs(300);

impl IdempotencyGuard {
    pub fn new(cache: Arc<dyn CacheStore>, result_ttl: Duration) -> Self {
        Self { cache, result_ttl }
    }

    pub fn payment_key(payment_id: Uuid) -> String {
        format!("idempotency:payment:{payment_id}")
    }

    pub fn event_key(event_id: Uuid) -> String {
        format!("idempotency:event:{event_id}")
    }

    /// Stored result for a key, if the operation already completed.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        cache_get(self.cache.as_ref(), key).await
    }

    /// Store the result of a completed operation.
    pub async fn store<T: Serialize>(&self, key: &str, value: &T) {
        cache_set(self.cache.as_ref(), key, value, self.result_ttl).await;
    }

    /// Claim the in-progress marker for a key. Returns false when another
    /// caller is currently executing the same logical operation.
    pub async fn try_begin(&self, key: &str) -> bool {
        self.cache
            .set_if_absent(
                &Self::lock_key(key),
                serde_json::Value::Bool(true),
                IN_PROGRESS_TTL,
            )
            .await
    }

    /// Release the in-progress marker (after success or failure).
    pub async fn release(&self, key: &str) {
        self.cache.invalidate(&Self::lock_key(key)).await;
    }

    fn lock_key(key: &str) -> String {
        format!("{key}:in_progress")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::MemoryCache;

    fn guard() -> IdempotencyGuard {
        IdempotencyGuard::new(Arc::new(MemoryCache::new()), Duration::from_secs(60))
    }

    #[tokio::test]
    async fn stored_result_is_returned() {
        let guard = guard();
        let key = IdempotencyGuard::payment_key(Uuid::new_v4());

        assert_eq!(guard.get::<Vec<String>>(&key).await, None);
        guard.store(&key, &vec!["a".to_string()]).await;
        assert_eq!(
            guard.get::<Vec<String>>(&key).await,
            Some(vec!["a".to_string()])
        );
    }

    #[tokio::test]
    async fn second_begin_loses_until_release() {
        let guard = guard();
        let key = IdempotencyGuard::event_key(Uuid::new_v4());

        assert!(guard.try_begin(&key).await);
        assert!(!guard.try_begin(&key).await);

        guard.release(&key).await;
        assert!(guard.try_begin(&key).await);
    }

    #[tokio::test]
    async fn payment_and_event_domains_are_independent() {
        let id = Uuid::new_v4();
        assert_ne!(
            IdempotencyGuard::payment_key(id),
            IdempotencyGuard::event_key(id)
        );
    }
}
