//! Admission control for outbound REST calls.
//!
//! Every bucket key owns one [`RateLimitBucket`] behind its own lock. A bucket
//! with queued requests has exactly one worker task draining it, so requests
//! in a bucket go out one at a time in FIFO order while different buckets run
//! in parallel. A process-wide global cooldown is checked before every send.

use super::bucket::{deadline_after, wait_from_secs, RateLimitBucket, RateLimitHeaders};
use super::request::{Request, RestFuture, RestResponse};
use super::route::{BucketKey, CompiledRoute};
use crate::error::ConnectorError;
use async_trait::async_trait;
use dashmap::DashMap;
use log::{debug, info, warn};
use parking_lot::Mutex;
use reqwest::StatusCode;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::time::{sleep, Instant};

const CLEANUP_INTERVAL: Duration = Duration::from_secs(30);

/// What happened to a request handed to an executor.
#[derive(Debug)]
pub enum ExecuteOutcome {
    /// The request's result was delivered.
    Done,
    /// The server rate-limited the call; the request goes back to the head of its queue.
    RateLimited {
        request: Request,
        retry_after: Duration,
    },
}

/// Performs the network exchange for a request the limiter has admitted.
#[async_trait]
pub trait RequestExecutor: Send + Sync + 'static {
    async fn execute(&self, request: Request, limiter: &RateLimiter) -> ExecuteOutcome;
}

struct BucketEntry {
    state: Mutex<BucketState>,
}

struct BucketState {
    bucket: RateLimitBucket,
    worker_active: bool,
    /// Removed from the map; enqueuers must look the key up again.
    retired: bool,
}

struct Inner {
    buckets: DashMap<BucketKey, Arc<BucketEntry>>,
    global_reset: Mutex<Option<Instant>>,
    executor: Arc<dyn RequestExecutor>,
    default_retry_after: Duration,
    accepting: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
    active_workers: AtomicUsize,
    workers_idle: Notify,
    last_cleanup: Mutex<Instant>,
}

/// Shared handle to the limiter; clones refer to the same buckets.
#[derive(Clone)]
pub struct RateLimiter {
    inner: Arc<Inner>,
}

impl RateLimiter {
    pub fn new(executor: Arc<dyn RequestExecutor>, default_retry_after: Duration) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                buckets: DashMap::new(),
                global_reset: Mutex::new(None),
                executor,
                default_retry_after,
                accepting: AtomicBool::new(true),
                shutdown_tx,
                active_workers: AtomicUsize::new(0),
                workers_idle: Notify::new(),
                last_cleanup: Mutex::new(Instant::now()),
            }),
        }
    }

    /// Wait required before `route` may be sent, or `None` if it may go now.
    pub fn get_rate_limit(&self, route: &CompiledRoute) -> Option<Duration> {
        let now = Instant::now();
        let global = self.global_wait(now);
        let bucket = self.inner.buckets.get(route.bucket_key()).map(|e| Arc::clone(e.value()));
        let local = bucket.and_then(|entry| {
            let mut state = entry.state.lock();
            state.bucket.get_rate_limit(now)
        });
        max_wait(global, local)
    }

    pub fn is_rate_limited(&self, route: &CompiledRoute) -> bool {
        self.get_rate_limit(route).is_some()
    }

    /// Remaining global cooldown, if one is active.
    pub fn global_wait(&self, now: Instant) -> Option<Duration> {
        let mut global = self.inner.global_reset.lock();
        match *global {
            Some(reset_at) if reset_at > now => Some(reset_at - now),
            Some(_) => {
                *global = None;
                None
            }
            None => None,
        }
    }

    /// Enqueues `request` and returns the future its result is delivered to.
    pub fn submit(&self, request: Request) -> RestFuture {
        let (request, future) = request.into_future_pair();
        self.queue_request(request);
        future
    }

    /// Appends `request` to its bucket's queue, starting the bucket worker if idle.
    pub fn queue_request(&self, request: Request) {
        if !self.inner.accepting.load(Ordering::SeqCst) {
            request.fail(ConnectorError::Shutdown);
            return;
        }
        self.maybe_evict_idle();

        let key = request.route().bucket_key().clone();
        let mut request = Some(request);
        while let Some(pending) = request.take() {
            let entry = self.bucket_entry(&key);
            let mut state = entry.state.lock();
            if state.retired {
                request = Some(pending);
                continue;
            }
            state.bucket.push_back(pending);
            if !state.worker_active {
                state.worker_active = true;
                self.inner.active_workers.fetch_add(1, Ordering::SeqCst);
                let limiter = self.clone();
                let entry = Arc::clone(&entry);
                tokio::spawn(async move { limiter.run_worker(entry).await });
            }
        }
    }

    /// Updates limit state from a response. Returns the retry-after when the
    /// response was a 429.
    pub fn handle_response(&self, route: &CompiledRoute, response: &RestResponse) -> Option<Duration> {
        let now = Instant::now();
        let headers = RateLimitHeaders::parse(&response.headers);
        let entry = self.bucket_entry(route.bucket_key());
        let mut state = entry.state.lock();

        if response.status != StatusCode::TOO_MANY_REQUESTS {
            let was_unlimited = state.bucket.is_unlimited();
            state.bucket.update(&headers, now);
            if state.bucket.is_unlimited() && !was_unlimited {
                debug!("Route {} returned no rate-limit headers; only the global limit applies", route);
            }
            return None;
        }

        let body = response.json_value();
        let body_retry = body
            .as_ref()
            .and_then(|b| b.get("retry_after"))
            .and_then(|v| v.as_f64())
            .and_then(wait_from_secs);
        let global = is_global_limit(&headers, body.as_ref());
        let retry_after = body_retry
            .or(headers.retry_after)
            .or(headers.reset_after)
            .unwrap_or(self.inner.default_retry_after);

        if global {
            warn!(
                "Encountered global rate limit on {}; all requests wait {:?}",
                route, retry_after
            );
            let mut global = self.inner.global_reset.lock();
            let until = deadline_after(now, retry_after);
            if global.map_or(true, |current| current < until) {
                *global = Some(until);
            }
        } else {
            warn!(
                "Encountered 429 on {} (bucket {}, scope {}); retrying after {:?}",
                route,
                headers.bucket.as_deref().unwrap_or("unknown"),
                headers.scope.as_deref().unwrap_or("user"),
                retry_after
            );
            state.bucket.exhaust_for(retry_after, now);
        }
        Some(retry_after)
    }

    /// Number of buckets currently tracked.
    pub fn bucket_count(&self) -> usize {
        self.inner.buckets.len()
    }

    /// Drops buckets that are empty, have no worker and are past their reset.
    pub fn evict_idle_buckets(&self) -> usize {
        let now = Instant::now();
        let before = self.inner.buckets.len();
        self.inner.buckets.retain(|_, entry| {
            let mut state = entry.state.lock();
            let idle = !state.worker_active && state.bucket.is_idle(now);
            if idle {
                state.retired = true;
            }
            !idle
        });
        let evicted = before.saturating_sub(self.inner.buckets.len());
        if evicted > 0 {
            debug!("Evicted {} idle rate-limit buckets", evicted);
        }
        evicted
    }

    /// Stops accepting requests, lets queued and in-flight requests finish for
    /// up to `drain_timeout`, then forces the rest to fail.
    pub async fn shutdown(&self, drain_timeout: Duration) {
        self.inner.accepting.store(false, Ordering::SeqCst);
        info!("Rate limiter shutting down; draining for up to {:?}", drain_timeout);

        let drained = tokio::time::timeout(drain_timeout, async {
            loop {
                let idle = self.inner.workers_idle.notified();
                if self.inner.active_workers.load(Ordering::SeqCst) == 0 {
                    break;
                }
                idle.await;
            }
        })
        .await;

        if drained.is_err() {
            warn!("Drain timeout elapsed with requests still pending; forcing shutdown");
        }
        self.force_shutdown();
    }

    /// Stops every worker now; queued and in-flight requests fail with
    /// [`ConnectorError::Shutdown`] or [`ConnectorError::RequestAborted`].
    pub fn force_shutdown(&self) {
        self.inner.accepting.store(false, Ordering::SeqCst);
        self.inner.shutdown_tx.send_replace(true);

        for entry in self.inner.buckets.iter() {
            let mut state = entry.value().state.lock();
            if !state.worker_active {
                for request in state.bucket.drain_queue() {
                    request.fail(ConnectorError::Shutdown);
                }
            }
        }
    }

    pub fn is_shutdown(&self) -> bool {
        *self.inner.shutdown_tx.borrow()
    }

    fn bucket_entry(&self, key: &BucketKey) -> Arc<BucketEntry> {
        let entry = self
            .inner
            .buckets
            .entry(key.clone())
            .or_insert_with(|| {
                Arc::new(BucketEntry {
                    state: Mutex::new(BucketState {
                        bucket: RateLimitBucket::new(key.clone(), Instant::now()),
                        worker_active: false,
                        retired: false,
                    }),
                })
            });
        Arc::clone(entry.value())
    }

    fn maybe_evict_idle(&self) {
        let now = Instant::now();
        {
            let mut last = self.inner.last_cleanup.lock();
            if now.duration_since(*last) < CLEANUP_INTERVAL {
                return;
            }
            *last = now;
        }
        self.evict_idle_buckets();
    }

    async fn run_worker(self, entry: Arc<BucketEntry>) {
        let mut guard = WorkerGuard {
            limiter: &self,
            entry: &entry,
            finished: false,
        };
        let mut shutdown = self.inner.shutdown_tx.subscribe();
        loop {
            let stopping = *shutdown.borrow();
            if stopping {
                let mut state = entry.state.lock();
                for request in state.bucket.drain_queue() {
                    request.fail(ConnectorError::Shutdown);
                }
                state.worker_active = false;
                break;
            }

            // Wait for both the global and the bucket limit to clear.
            let wait = {
                let now = Instant::now();
                let mut state = entry.state.lock();
                if state.bucket.is_queue_empty() {
                    state.worker_active = false;
                    break;
                }
                let local = state.bucket.get_rate_limit(now);
                drop(state);
                max_wait(self.global_wait(now), local)
            };
            if let Some(wait) = wait {
                debug!("Bucket waiting {:?} before next request", wait);
                tokio::select! {
                    _ = sleep(wait) => {}
                    _ = stopped(&mut shutdown) => {}
                }
                continue;
            }

            let Some(request) = entry.state.lock().bucket.pop_front() else {
                continue;
            };
            // Checks run unlocked so they may query the limiter; this worker is
            // the bucket's only consumer, so FIFO order holds.
            if request.is_cancelled() {
                debug!("Request {} was cancelled before sending", request.id());
                request.fail(ConnectorError::Cancelled);
                continue;
            }
            if !request.check_precondition() {
                debug!("Request {} failed its precondition", request.id());
                request.fail(ConnectorError::PreconditionFailed);
                continue;
            }
            entry.state.lock().bucket.on_request_sent(Instant::now());

            let outcome = tokio::select! {
                outcome = self.inner.executor.execute(request, &self) => outcome,
                _ = stopped(&mut shutdown) => ExecuteOutcome::Done,
            };
            if let ExecuteOutcome::RateLimited { request, retry_after } = outcome {
                debug!(
                    "Requeueing request {} at head of its bucket after {:?}",
                    request.id(),
                    retry_after
                );
                entry.state.lock().bucket.push_front(request);
            }
        }
        guard.finished = true;
    }
}

/// Releases a bucket's worker slot when its task ends. If the task unwound,
/// the bucket is handed back and its queued requests fail.
struct WorkerGuard<'a> {
    limiter: &'a RateLimiter,
    entry: &'a Arc<BucketEntry>,
    finished: bool,
}

impl Drop for WorkerGuard<'_> {
    fn drop(&mut self) {
        if !self.finished {
            warn!("Rate-limit bucket worker stopped unexpectedly; failing its queue");
            let queued = {
                let mut state = self.entry.state.lock();
                state.worker_active = false;
                state.bucket.drain_queue()
            };
            for request in queued {
                request.fail(ConnectorError::RequestAborted);
            }
        }
        if self.limiter.inner.active_workers.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.limiter.inner.workers_idle.notify_waiters();
        }
    }
}

/// Resolves once the shutdown flag is set.
pub(crate) async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    loop {
        let stop = *shutdown.borrow_and_update();
        if stop {
            return;
        }
        if shutdown.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Whether a 429 applies to every route, per the header or the JSON body.
pub(crate) fn is_global_limit(headers: &RateLimitHeaders, body: Option<&Value>) -> bool {
    headers.global
        || body
            .and_then(|b| b.get("global"))
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
}

fn max_wait(a: Option<Duration>, b: Option<Duration>) -> Option<Duration> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.max(b)),
        (a, b) => a.or(b),
    }
}
