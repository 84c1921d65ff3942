//! Queue-based rate limiter for outbound calls.
//!
//! Every call joins a FIFO queue. A drain pass dispatches queued calls while
//! fewer than `max_requests` are in flight; each settled call frees its slot
//! and drains again. While the queue is non-empty a ticker with period `per`
//! keeps draining, and it stops once the queue empties.
//!
//! There is no cancellation, no per-call timeout and no queue bound.

use std::any::Any;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::sync::oneshot;
use tokio::time::MissedTickBehavior;

use crate::error::{FetchError, FetchResult};

/// Shortest ticker period; `tokio::time::interval` rejects zero.
const MIN_PERIOD: Duration = Duration::from_millis(1);

/// Limiter configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimit {
    /// Calls allowed in flight at once.
    pub max_requests: usize,
    /// Drain ticker period.
    pub per: Duration,
}

impl RateLimit {
    /// `max_requests` is clamped to at least one and `per` to at least 1ms.
    #[must_use]
    pub fn new(max_requests: usize, per: Duration) -> Self {
        Self { max_requests: max_requests.max(1), per: per.max(MIN_PERIOD) }
    }

    /// Shorthand for `max_rps` calls per second.
    #[must_use]
    pub fn per_second(max_rps: usize) -> Self {
        Self::new(max_rps, Duration::from_secs(1))
    }
}

/// Point-in-time view of a limiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LimiterSnapshot {
    pub max_requests: usize,
    pub per: Duration,
    pub active: usize,
    pub queued: usize,
}

type Job = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;
type Outcome<T> = Result<T, Box<dyn Any + Send>>;

struct State {
    queue: VecDeque<Job>,
    active: usize,
    ticking: bool,
}

struct Inner {
    limit: RateLimit,
    state: Mutex<State>,
}

/// Rate limiter shared by every clone.
#[derive(Clone)]
pub struct RateLimiter {
    inner: Arc<Inner>,
}

impl RateLimiter {
    #[must_use]
    pub fn new(limit: RateLimit) -> Self {
        let state = Mutex::new(State { queue: VecDeque::new(), active: 0, ticking: false });
        Self { inner: Arc::new(Inner { limit, state }) }
    }

    /// The configuration this limiter was built with.
    #[must_use]
    pub fn limit(&self) -> RateLimit {
        self.inner.limit
    }

    /// Queue `f` and wait for its output.
    ///
    /// A panic inside `f` is reported as [`FetchError::FetchFailed`] to this
    /// caller only; the queue keeps draining.
    pub async fn run<F, Fut, T>(&self, f: F) -> FetchResult<T>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel::<Outcome<T>>();

        let job: Job = Box::new(move || {
            async move {
                let outcome = AssertUnwindSafe(async move { f().await }).catch_unwind().await;
                let _ = tx.send(outcome);
            }
            .boxed()
        });

        self.inner.lock().queue.push_back(job);
        self.inner.drain();

        match rx.await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(panic)) => Err(FetchError::fetch_failed(panic_message(panic.as_ref()))),
            Err(_) => Err(FetchError::fetch_failed("rate-limited call dropped before completion")),
        }
    }

    /// Queue a fallible call, keeping its own error type.
    pub async fn call<F, Fut, T, E>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: From<FetchError> + Send + 'static,
    {
        self.run(f).await.map_err(E::from)?
    }

    /// Wrap `f` so every invocation goes through this limiter.
    ///
    /// The returned closure takes the same argument and yields the same
    /// result type as `f`.
    pub fn wrap<A, F, Fut, T, E>(&self, f: F) -> impl Fn(A) -> BoxFuture<'static, Result<T, E>>
    where
        A: Send + 'static,
        F: Fn(A) -> Fut + Clone + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: From<FetchError> + Send + 'static,
    {
        let limiter = self.clone();
        move |arg: A| {
            let limiter = limiter.clone();
            let f = f.clone();
            async move { limiter.call(move || f(arg)).await }.boxed()
        }
    }

    #[must_use]
    pub fn snapshot(&self) -> LimiterSnapshot {
        let st = self.inner.lock();
        LimiterSnapshot {
            max_requests: self.inner.limit.max_requests,
            per: self.inner.limit.per,
            active: st.active,
            queued: st.queue.len(),
        }
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn drain(self: &Arc<Self>) {
        let mut st = self.lock();
        self.dispatch_ready(&mut st);

        if !st.queue.is_empty() && !st.ticking {
            st.ticking = true;
            self.spawn_ticker();
        }
    }

    fn dispatch_ready(self: &Arc<Self>, st: &mut State) {
        while st.active < self.limit.max_requests {
            let Some(job) = st.queue.pop_front() else {
                break;
            };
            st.active += 1;

            let inner = Arc::clone(self);
            tokio::spawn(async move {
                job().await;
                inner.settle();
            });
        }
    }

    fn settle(self: &Arc<Self>) {
        {
            let mut st = self.lock();
            st.active = st.active.saturating_sub(1);
        }
        self.drain();
    }

    /// One ticker pass. Returns false once the queue is empty.
    fn tick(self: &Arc<Self>) -> bool {
        let mut st = self.lock();
        self.dispatch_ready(&mut st);
        if st.queue.is_empty() {
            st.ticking = false;
            return false;
        }
        true
    }

    fn spawn_ticker(self: &Arc<Self>) {
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(inner.limit.per.max(MIN_PERIOD));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // first tick completes immediately
            ticker.tick().await;

            loop {
                ticker.tick().await;
                if !inner.tick() {
                    break;
                }
            }
        });
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "rate-limited call panicked".to_string()
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let snap = self.snapshot();
        f.debug_struct("RateLimiter")
            .field("max_requests", &snap.max_requests)
            .field("per", &snap.per)
            .field("active", &snap.active)
            .field("queued", &snap.queued)
            .finish()
    }
}

/// Limiters shared by provider id.
///
/// Clients built with the same id funnel through one queue.
#[derive(Debug, Clone, Default)]
pub struct LimiterRegistry {
    limiters: Arc<Mutex<HashMap<String, RateLimiter>>>,
}

impl LimiterRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the limiter for `id`, creating it with `limit` on first use.
    ///
    /// Later calls with a different `limit` still get the original limiter.
    pub fn limiter(&self, id: &str, limit: RateLimit) -> RateLimiter {
        let mut limiters = self.limiters.lock().unwrap_or_else(PoisonError::into_inner);
        limiters.entry(id.to_string()).or_insert_with(|| RateLimiter::new(limit)).clone()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.limiters.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_limit_clamps_zero() {
        let limit = RateLimit::new(0, Duration::from_millis(10));
        assert_eq!(limit.max_requests, 1);
    }

    #[test]
    fn test_rate_limit_clamps_zero_period() {
        let limit = RateLimit::new(2, Duration::ZERO);
        assert_eq!(limit.per, MIN_PERIOD);
    }

    #[tokio::test]
    async fn test_zero_period_ticker_keeps_draining() {
        // struct literal bypasses the clamp in `new`
        let limiter = RateLimiter::new(RateLimit { max_requests: 1, per: Duration::ZERO });
        let calls = (0..5).map(|i| {
            limiter.run(move || async move {
                tokio::time::sleep(Duration::from_millis(5)).await;
                i
            })
        });

        let results: Vec<u32> = futures::future::join_all(calls)
            .await
            .into_iter()
            .map(Result::unwrap)
            .collect();
        assert_eq!(results, vec![0, 1, 2, 3, 4]);

        tokio::time::sleep(Duration::from_millis(20)).await;
        let snap = limiter.snapshot();
        assert_eq!((snap.active, snap.queued), (0, 0));
        assert!(!limiter.inner.lock().ticking);
    }

    #[test]
    fn test_per_second_shorthand() {
        let limit = RateLimit::per_second(20);
        assert_eq!(limit.max_requests, 20);
        assert_eq!(limit.per, Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_run_returns_output() {
        let limiter = RateLimiter::new(RateLimit::per_second(1));
        let value = limiter.run(|| async { 41 + 1 }).await.unwrap();
        assert_eq!(value, 42);
    }

    async fn explode() -> u32 {
        panic!("upstream exploded")
    }

    #[tokio::test]
    async fn test_panic_reported_to_caller_only() {
        let limiter = RateLimiter::new(RateLimit::new(1, Duration::from_millis(20)));

        let failing = limiter.run(explode);
        let healthy = limiter.run(|| async { "ok" });
        let (failing, healthy) = tokio::join!(failing, healthy);

        match failing {
            Err(FetchError::FetchFailed { message }) => assert!(message.contains("exploded")),
            other => panic!("expected FetchFailed, got {other:?}"),
        }
        assert_eq!(healthy.unwrap(), "ok");

        let snap = limiter.snapshot();
        assert_eq!(snap.active, 0);
        assert_eq!(snap.queued, 0);
    }

    #[test]
    fn test_registry_shares_by_id() {
        let registry = LimiterRegistry::new();
        let a = registry.limiter("tmdb", RateLimit::per_second(20));
        let b = registry.limiter("tmdb", RateLimit::per_second(5));
        let c = registry.limiter("radarr", RateLimit::per_second(5));

        assert!(Arc::ptr_eq(&a.inner, &b.inner));
        assert!(!Arc::ptr_eq(&a.inner, &c.inner));
        assert_eq!(b.limit().max_requests, 20);
        assert_eq!(registry.len(), 2);
    }
}
