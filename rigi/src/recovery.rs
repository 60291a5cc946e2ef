use std::{
    any::Any,
    collections::HashMap,
    fmt::Display,
    future::Future,
    sync::Mutex,
    time::Duration,
};

use tracing::{debug, error, info, warn};

use crate::broker::{EventId, SubscriptionId, ValidationOutcome};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub initial_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            initial_delay: Duration::from_millis(100),
        }
    }
}

/// Central fault handler: classifies failures, retries transient storage
/// operations with exponential backoff and keeps the last successful result
/// per operation signature for graceful degradation.
///
/// Validation and subscriber failures are terminal and only reported here;
/// the cache never holds them.
#[derive(Default)]
pub struct Recovery {
    cache: Mutex<HashMap<String, Box<dyn Any + Send + Sync>>>,
    policy: RetryPolicy,
}

impl Recovery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_policy(policy: RetryPolicy) -> Self {
        Self {
            cache: Default::default(),
            policy,
        }
    }

    /// Runs a transient operation with retry. On success the result is
    /// cached under `operation`; once all attempts are exhausted the last
    /// cached result is returned instead, absent that `None`.
    ///
    /// The operation signature must include its parameters (e.g.
    /// `cameras_by_direction(forward)`), otherwise unrelated queries would
    /// degrade into each other's cached results.
    pub async fn run_cached<T, E, F, TFut>(&self, operation: &str, mut op: F) -> Option<T>
    where
        T: Clone + Send + Sync + 'static,
        E: Display,
        F: FnMut() -> TFut,
        TFut: Future<Output = Result<T, E>>,
    {
        let mut delay = self.policy.initial_delay;
        for attempt in 1..=self.policy.attempts {
            match op().await {
                Ok(result) => {
                    if attempt > 1 {
                        info!(operation, "Operation succeeded on attempt {attempt}");
                    }
                    self.cache
                        .lock()
                        .expect("Not poisoned")
                        .insert(operation.to_owned(), Box::new(result.clone()));
                    return Some(result);
                }
                Err(e) if attempt == self.policy.attempts => {
                    error!(
                        operation,
                        "Operation failed after {attempt} attempts: {e}"
                    );
                }
                Err(e) => {
                    warn!(
                        operation,
                        "Attempt {attempt} failed, next try in {delay:?}: {e}"
                    );
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
            }
        }
        self.cached(operation)
    }

    /// Last successful result for the given operation signature.
    pub fn cached<T: Clone + Send + Sync + 'static>(&self, operation: &str) -> Option<T> {
        let lock = self.cache.lock().expect("Not poisoned");
        match lock.get(operation).and_then(|x| x.downcast_ref::<T>()) {
            Some(x) => {
                info!(operation, "Returning cached result");
                Some(x.clone())
            }
            None => {
                warn!(operation, "No cached result available");
                None
            }
        }
    }

    pub fn clear_cache(&self) {
        self.cache.lock().expect("Not poisoned").clear();
        debug!("Recovery cache cleared");
    }

    /// Validation failures are rejected without retry; the publisher sees
    /// them in the publish result, this is just the log trail.
    pub fn report_validation_failure(
        &self,
        event_id: EventId,
        channel: &str,
        outcome: &ValidationOutcome,
    ) {
        error!(
            message_id = %event_id,
            message_type = channel,
            "Validation failed: {:?} (warnings: {:?})",
            outcome.errors,
            outcome.warnings
        );
    }

    /// A failing subscriber must not affect the remaining subscribers; the
    /// broker continues and only this record remains.
    pub fn report_subscriber_failure(
        &self,
        subscription_id: SubscriptionId,
        event_id: EventId,
        detail: &str,
    ) {
        error!(
            subscriber_id = %subscription_id,
            message_id = %event_id,
            "Subscriber callback failed: {detail}"
        );
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn succeeds_first_try_without_delay() {
        let recovery = Recovery::new();
        let r = recovery
            .run_cached("op", || async { Ok::<_, String>(7) })
            .await;
        assert_eq!(r, Some(7));
    }

    #[tokio::test(start_paused = true)]
    async fn retries_with_doubling_backoff() {
        let recovery = Recovery::new();
        let calls = AtomicU32::new(0);
        let started = tokio::time::Instant::now();
        let r = recovery
            .run_cached("op", || async {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err("transient")
                } else {
                    Ok(3)
                }
            })
            .await;
        assert_eq!(r, Some(3));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        // 100ms + 200ms of backoff before the third attempt
        assert_eq!(started.elapsed(), Duration::from_millis(300));
    }

    #[tokio::test(start_paused = true)]
    async fn falls_back_to_cache_after_exhaustion() {
        let recovery = Recovery::new();
        recovery
            .run_cached("op", || async { Ok::<_, String>(vec![1, 2]) })
            .await;
        let r: Option<Vec<i32>> = recovery
            .run_cached("op", || async { Err::<Vec<i32>, _>("down") })
            .await;
        assert_eq!(r, Some(vec![1, 2]));
    }

    #[tokio::test(start_paused = true)]
    async fn no_cache_yields_none() {
        let recovery = Recovery::new();
        let r: Option<i32> = recovery
            .run_cached("op", || async { Err::<i32, _>("down") })
            .await;
        assert_eq!(r, None);
    }

    #[tokio::test(start_paused = true)]
    async fn clear_cache_then_requery_repopulates() {
        let recovery = Recovery::new();
        recovery
            .run_cached("op", || async { Ok::<_, String>(1) })
            .await;
        recovery.clear_cache();
        assert_eq!(recovery.cached::<i32>("op"), None);

        recovery
            .run_cached("op", || async { Ok::<_, String>(2) })
            .await;
        assert_eq!(recovery.cached::<i32>("op"), Some(2));
    }

    #[test]
    fn cache_is_typed_per_operation() {
        let recovery = Recovery::new();
        recovery
            .cache
            .lock()
            .unwrap()
            .insert("op".into(), Box::new(5i32));
        assert_eq!(recovery.cached::<String>("op"), None);
        assert_eq!(recovery.cached::<i32>("op"), Some(5));
    }
}
