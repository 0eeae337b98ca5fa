//! Bounded retry around blocking store calls.

use std::sync::Arc;
use std::time::Duration;

use fw_core::{SessionStore, StoreError};
use tracing::{debug, warn};

use crate::config::RetryPolicy;

/// Runs one store call on the blocking pool, bounded by `timeout`.
///
/// A timed-out call keeps running in the background; store operations are
/// idempotent so a later retry converges on the same row.
pub async fn call_store<T, F>(
    store: &Arc<dyn SessionStore>,
    timeout: Duration,
    f: F,
) -> Result<T, StoreError>
where
    T: Send + 'static,
    F: FnOnce(&dyn SessionStore) -> Result<T, StoreError> + Send + 'static,
{
    let store = Arc::clone(store);
    let task = tokio::task::spawn_blocking(move || f(store.as_ref()));
    match tokio::time::timeout(timeout, task).await {
        Ok(Ok(result)) => result,
        Ok(Err(join)) => Err(StoreError::Backend(format!("store task failed: {join}"))),
        Err(_) => Err(StoreError::Unavailable(format!(
            "store call exceeded {}ms",
            timeout.as_millis()
        ))),
    }
}

/// Outcome of [`with_retry`].
#[derive(Debug)]
pub struct Retried<T> {
    pub result: Result<T, StoreError>,
    /// Retries performed after the first attempt.
    pub retries: u32,
}

/// Calls `f` until it succeeds, fails permanently, or runs out of attempts.
/// Only transient errors are retried.
pub async fn with_retry<T, F>(
    store: &Arc<dyn SessionStore>,
    policy: &RetryPolicy,
    timeout: Duration,
    operation: &str,
    f: F,
) -> Retried<T>
where
    T: Send + 'static,
    F: Fn(&dyn SessionStore) -> Result<T, StoreError> + Clone + Send + 'static,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;
    loop {
        let result = call_store(store, timeout, f.clone()).await;
        match result {
            Err(err) if err.is_transient() && attempt + 1 < max_attempts => {
                let delay = policy.delay_for_attempt(attempt);
                warn!(
                    operation,
                    attempt = attempt + 1,
                    max_attempts,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    error = %err,
                    "store call failed, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            result => {
                if attempt > 0 {
                    debug!(operation, retries = attempt, ok = result.is_ok(), "retry finished");
                }
                return Retried {
                    result,
                    retries: attempt,
                };
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fw_core::{
        ActivityLogEntry, FuelFillEvent, OperatingSession, Plate, SessionId, SessionPatch,
        SessionStatus,
    };
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Fails `append_activity` with the given error a number of times.
    struct Failing {
        remaining: AtomicU32,
        transient: bool,
        calls: AtomicU32,
    }

    impl SessionStore for Failing {
        fn create_session(&self, session: &OperatingSession) -> Result<SessionId, StoreError> {
            Ok(session.id.clone())
        }

        fn update_session(
            &self,
            _id: &SessionId,
            _expected_status: SessionStatus,
            _patch: &SessionPatch,
        ) -> Result<(), StoreError> {
            Ok(())
        }

        fn upsert_fill_event(&self, _fill: &FuelFillEvent) -> Result<(), StoreError> {
            Ok(())
        }

        fn append_activity(&self, _entry: &ActivityLogEntry) -> Result<(), StoreError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let failed = self
                .remaining
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            match (failed, self.transient) {
                (false, _) => Ok(()),
                (true, true) => Err(StoreError::Unavailable("locked".into())),
                (true, false) => Err(StoreError::Backend("corrupt".into())),
            }
        }

        fn ongoing_session(&self, _plate: &Plate) -> Result<Option<OperatingSession>, StoreError> {
            Ok(None)
        }
    }

    fn entry() -> ActivityLogEntry {
        ActivityLogEntry::new(
            Plate::new("GEN-01").unwrap(),
            fw_core::ActivityKind::EngineOn,
            at(),
        )
    }

    fn at() -> chrono::DateTime<chrono::Utc> {
        chrono::DateTime::from_timestamp(1_740_808_800, 0).unwrap()
    }

    fn failing(times: u32, transient: bool) -> (Arc<Failing>, Arc<dyn SessionStore>) {
        let store = Arc::new(Failing {
            remaining: AtomicU32::new(times),
            transient,
            calls: AtomicU32::new(0),
        });
        let dyn_store: Arc<dyn SessionStore> = store.clone();
        (store, dyn_store)
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_are_retried() {
        let (raw, store) = failing(2, true);
        let entry = entry();
        let outcome = with_retry(
            &store,
            &RetryPolicy::default(),
            Duration::from_secs(1),
            "append_activity",
            move |s| s.append_activity(&entry),
        )
        .await;
        assert!(outcome.result.is_ok());
        assert_eq!(outcome.retries, 2);
        assert_eq!(raw.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn attempts_are_bounded() {
        let (raw, store) = failing(100, true);
        let entry = entry();
        let policy = RetryPolicy {
            max_attempts: 3,
            ..RetryPolicy::default()
        };
        let outcome = with_retry(&store, &policy, Duration::from_secs(1), "append_activity", move |s| {
            s.append_activity(&entry)
        })
        .await;
        assert!(outcome.result.unwrap_err().is_transient());
        assert_eq!(raw.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_failures_are_not_retried() {
        let (raw, store) = failing(1, false);
        let entry = entry();
        let outcome = with_retry(
            &store,
            &RetryPolicy::default(),
            Duration::from_secs(1),
            "append_activity",
            move |s| s.append_activity(&entry),
        )
        .await;
        assert!(matches!(outcome.result, Err(StoreError::Backend(_))));
        assert_eq!(raw.calls.load(Ordering::SeqCst), 1);
    }
}
