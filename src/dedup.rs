use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use futures::future::{join_all, BoxFuture, FutureExt, Shared};
use serde::{Deserialize, Serialize};
use tokio::task::AbortHandle;
use tokio::time::Instant;

use crate::{HttpClientError, HttpResponse};

/// Default time an entry survives after its request settles.
pub const DEFAULT_DEDUP_TTL_MS: u64 = 60_000;

/// Result handle shared by every caller of one idempotency key.
pub type SharedResult = Shared<BoxFuture<'static, Result<HttpResponse, HttpClientError>>>;

/// What [`RequestDeduplicator::shutdown`] does with executions still in flight.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InFlightPolicy {
    /// Wait for every in-flight execution to settle.
    #[default]
    Flush,
    /// Abort in-flight executions; waiters get [`HttpClientError::Discarded`].
    Discard,
}

struct Entry {
    future: SharedResult,
    abort: AbortHandle,
    generation: u64,
    /// Set once the execution settles.
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |deadline| now < deadline)
    }
}

pub(crate) struct DedupState {
    entries: Mutex<HashMap<String, Entry>>,
    next_generation: AtomicU64,
    ttl: Duration,
}

impl DedupState {
    fn lock(&self) -> MutexGuard<'_, HashMap<String, Entry>> {
        match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn mark_settled(&self, key: &str, generation: u64) {
        let mut entries = self.lock();
        if let Some(entry) = entries.get_mut(key) {
            if entry.generation == generation {
                entry.expires_at = Some(Instant::now() + self.ttl);
            }
        }
    }
}

/// Collapses concurrent requests sharing an idempotency key into one execution.
///
/// Each execution runs on its own tokio task, so it completes even when every
/// waiter stops listening. Expired entries are dropped lazily on access and by
/// [`RequestDeduplicator::purge_expired`].
#[derive(Clone)]
pub struct RequestDeduplicator {
    state: Arc<DedupState>,
}

impl std::fmt::Debug for RequestDeduplicator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestDeduplicator")
            .field("ttl", &self.state.ttl)
            .field("entries", &self.state.lock().len())
            .finish()
    }
}

impl Default for RequestDeduplicator {
    fn default() -> Self {
        Self::new(Duration::from_millis(DEFAULT_DEDUP_TTL_MS))
    }
}

impl RequestDeduplicator {
    pub fn new(ttl: Duration) -> Self {
        Self {
            state: Arc::new(DedupState {
                entries: Mutex::new(HashMap::new()),
                next_generation: AtomicU64::new(0),
                ttl,
            }),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.state.ttl
    }

    /// Returns the shared result for `key`, calling `factory` only when no
    /// live entry exists.
    ///
    /// Lookup and insertion happen under one lock, so concurrent callers can
    /// never start two executions for the same key. `factory` runs while the
    /// lock is held and must only build the future, not drive it.
    ///
    /// Must be called from within a tokio runtime.
    pub fn submit<F, Fut>(&self, key: &str, factory: F) -> SharedResult
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<HttpResponse, HttpClientError>> + Send + 'static,
    {
        let mut entries = self.state.lock();
        let now = Instant::now();

        if let Some(entry) = entries.get(key) {
            if entry.is_live(now) {
                #[cfg(feature = "tracing")]
                tracing::trace!(idempotency_key = key, "joining in-flight request");
                return entry.future.clone();
            }
        }
        // Every new key pays for dropping whatever expired since the last one.
        entries.retain(|_, entry| entry.is_live(now));

        let generation = self.state.next_generation.fetch_add(1, Ordering::Relaxed);
        let execution = factory();
        let settle_state = Arc::downgrade(&self.state);
        let settle_key = key.to_owned();
        let handle = tokio::spawn(async move {
            let outcome = execution.await;
            if let Some(state) = settle_state.upgrade() {
                state.mark_settled(&settle_key, generation);
            }
            outcome
        });
        let abort = handle.abort_handle();

        let join_key = key.to_owned();
        let future = async move {
            match handle.await {
                Ok(outcome) => outcome,
                Err(err) if err.is_cancelled() => Err(HttpClientError::Discarded { key: join_key }),
                Err(err) => Err(HttpClientError::TaskFailed(err.to_string())),
            }
        }
        .boxed()
        .shared();

        entries.insert(
            key.to_owned(),
            Entry {
                future: future.clone(),
                abort,
                generation,
                expires_at: None,
            },
        );
        future
    }

    /// `true` while `key` is in flight or inside its post-settlement TTL.
    pub fn contains(&self, key: &str) -> bool {
        let now = Instant::now();
        self.state
            .lock()
            .get(key)
            .is_some_and(|entry| entry.is_live(now))
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.state
            .lock()
            .values()
            .filter(|entry| entry.is_live(now))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Removes entries whose TTL has elapsed. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.state.lock();
        let before = entries.len();
        entries.retain(|_, entry| entry.is_live(now));
        before - entries.len()
    }

    /// Settles or aborts in-flight executions according to `policy`, then
    /// removes every entry that existed when shutdown began. Keys submitted
    /// while a flush is waiting are left alone. Returns the number of
    /// executions that were in flight.
    pub async fn shutdown(&self, policy: InFlightPolicy) -> usize {
        match policy {
            InFlightPolicy::Flush => {
                let (pending, cutoff) = {
                    let entries = self.state.lock();
                    let pending: Vec<SharedResult> = entries
                        .values()
                        .filter(|entry| entry.expires_at.is_none())
                        .map(|entry| entry.future.clone())
                        .collect();
                    (pending, self.state.next_generation.load(Ordering::Relaxed))
                };
                let count = pending.len();
                join_all(pending).await;
                self.state
                    .lock()
                    .retain(|_, entry| entry.generation >= cutoff);
                count
            }
            InFlightPolicy::Discard => {
                let mut entries = self.state.lock();
                let mut count = 0;
                for entry in entries.values() {
                    if entry.expires_at.is_none() {
                        entry.abort.abort();
                        count += 1;
                    }
                }
                entries.clear();
                count
            }
        }
    }

    pub(crate) fn downgrade(&self) -> Weak<DedupState> {
        Arc::downgrade(&self.state)
    }

    pub(crate) fn upgrade(state: &Weak<DedupState>) -> Option<Self> {
        state.upgrade().map(|state| Self { state })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use futures::future;
    use serde_json::json;

    use super::{InFlightPolicy, RequestDeduplicator};
    use crate::{HttpClientError, HttpResponse, RequestMetrics};

    fn response(id: u64) -> HttpResponse {
        HttpResponse {
            data: json!({ "id": id }),
            status: 200,
            status_text: "OK".to_owned(),
            headers: BTreeMap::new(),
            metrics: RequestMetrics::new("req", "/orders", "POST", Some("k".to_owned()), 0),
            duration: 5,
            success: true,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_submissions_share_one_execution() {
        let dedup = RequestDeduplicator::default();
        let calls = Arc::new(AtomicUsize::new(0));

        let submit = || {
            let calls = Arc::clone(&calls);
            dedup.submit("order-1", move || async move {
                let n = calls.fetch_add(1, Ordering::SeqCst) as u64;
                tokio::time::sleep(Duration::from_millis(10)).await;
                Ok(response(n))
            })
        };

        let (a, b, c) = tokio::join!(submit(), submit(), submit());

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let a = a.expect("first caller must succeed");
        assert_eq!(Ok(a.clone()), b);
        assert_eq!(Ok(a), c);
    }

    #[tokio::test(start_paused = true)]
    async fn submission_is_visible_before_execution_starts() {
        let dedup = RequestDeduplicator::default();
        let calls = Arc::new(AtomicUsize::new(0));

        let first_calls = Arc::clone(&calls);
        let first = dedup.submit("k", move || {
            first_calls.fetch_add(1, Ordering::SeqCst);
            future::ready(Ok(response(1)))
        });
        assert!(dedup.contains("k"));

        let second_calls = Arc::clone(&calls);
        let second = dedup.submit("k", move || {
            second_calls.fetch_add(1, Ordering::SeqCst);
            future::ready(Ok(response(2)))
        });

        assert_eq!(first.await, second.await);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn entry_expires_exactly_after_ttl() {
        let dedup = RequestDeduplicator::default();
        dedup
            .submit("k", || future::ready(Ok(response(1))))
            .await
            .expect("must succeed");

        assert!(dedup.contains("k"));
        tokio::time::advance(Duration::from_millis(59_999)).await;
        assert!(dedup.contains("k"));
        assert_eq!(dedup.purge_expired(), 0);

        tokio::time::advance(Duration::from_millis(1)).await;
        assert!(!dedup.contains("k"));
        assert_eq!(dedup.purge_expired(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failures_are_shared_and_key_reopens_after_ttl() {
        let dedup = RequestDeduplicator::new(Duration::from_millis(100));
        let calls = Arc::new(AtomicUsize::new(0));
        let failing = || {
            let calls = Arc::clone(&calls);
            move || {
                calls.fetch_add(1, Ordering::SeqCst);
                future::ready(Err::<HttpResponse, _>(HttpClientError::TaskFailed(
                    "boom".to_owned(),
                )))
            }
        };

        let first = dedup.submit("k", failing());
        let second = dedup.submit("k", failing());
        let (first, second) = tokio::join!(first, second);
        assert!(matches!(first, Err(HttpClientError::TaskFailed(_))));
        assert_eq!(first, second);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        tokio::time::advance(Duration::from_millis(100)).await;
        let _ = dedup.submit("k", failing()).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn waiters_can_drop_without_cancelling_execution() {
        let dedup = RequestDeduplicator::default();
        let calls = Arc::new(AtomicUsize::new(0));
        let execution_calls = Arc::clone(&calls);

        drop(dedup.submit("k", move || async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            execution_calls.fetch_add(1, Ordering::SeqCst);
            Ok(response(1))
        }));

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(dedup.contains("k"));
    }

    #[tokio::test(start_paused = true)]
    async fn discard_shutdown_aborts_in_flight_work() {
        let dedup = RequestDeduplicator::default();
        let pending = dedup.submit("k", future::pending::<Result<HttpResponse, HttpClientError>>);

        assert_eq!(dedup.shutdown(InFlightPolicy::Discard).await, 1);
        assert!(dedup.is_empty());
        assert_eq!(
            pending.await,
            Err(HttpClientError::Discarded {
                key: "k".to_owned()
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn flush_shutdown_waits_for_in_flight_work() {
        let dedup = RequestDeduplicator::default();
        let pending = dedup.submit("k", || async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok(response(9))
        });

        assert_eq!(dedup.shutdown(InFlightPolicy::Flush).await, 1);
        assert!(dedup.is_empty());
        assert_eq!(pending.await.map(|r| r.data), Ok(json!({ "id": 9 })));
    }

    #[tokio::test(start_paused = true)]
    async fn expired_keys_are_dropped_when_new_keys_arrive() {
        let dedup = RequestDeduplicator::default();
        for n in 0..200 {
            dedup
                .submit(&format!("checkout-{n}"), move || future::ready(Ok(response(n))))
                .await
                .expect("must succeed");
        }
        assert_eq!(dedup.state.lock().len(), 200);

        tokio::time::advance(Duration::from_secs(3_600)).await;
        dedup
            .submit("checkout-new", || future::ready(Ok(response(999))))
            .await
            .expect("must succeed");

        assert_eq!(dedup.state.lock().len(), 1);
        assert!(dedup.contains("checkout-new"));
    }

    #[tokio::test(start_paused = true)]
    async fn flush_keeps_keys_submitted_while_waiting() {
        let dedup = RequestDeduplicator::default();
        let calls = Arc::new(AtomicUsize::new(0));
        let early = dedup.submit("early", || async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok(response(1))
        });

        let late_calls = Arc::clone(&calls);
        let (flushed, late) = tokio::join!(dedup.shutdown(InFlightPolicy::Flush), async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            dedup.submit("late", move || {
                late_calls.fetch_add(1, Ordering::SeqCst);
                async {
                    tokio::time::sleep(Duration::from_millis(500)).await;
                    Ok(response(2))
                }
            })
        });

        assert_eq!(flushed, 1);
        assert!(!dedup.contains("early"));
        assert!(dedup.contains("late"));

        let again_calls = Arc::clone(&calls);
        let again = dedup.submit("late", move || {
            again_calls.fetch_add(1, Ordering::SeqCst);
            future::ready(Ok(response(3)))
        });
        assert_eq!(late.await, again.await);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(early.await.is_ok());
    }
}
