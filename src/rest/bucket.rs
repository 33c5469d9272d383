//! Per-route rate-limit state.

use super::request::Request;
use super::route::BucketKey;
use chrono::Utc;
use reqwest::header::HeaderMap;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;

pub const HEADER_LIMIT: &str = "x-ratelimit-limit";
pub const HEADER_REMAINING: &str = "x-ratelimit-remaining";
pub const HEADER_RESET: &str = "x-ratelimit-reset";
pub const HEADER_RESET_AFTER: &str = "x-ratelimit-reset-after";
pub const HEADER_BUCKET: &str = "x-ratelimit-bucket";
pub const HEADER_GLOBAL: &str = "x-ratelimit-global";
pub const HEADER_SCOPE: &str = "x-ratelimit-scope";
pub const HEADER_RETRY_AFTER: &str = "retry-after";

/// Ceiling for any server-supplied wait.
pub const MAX_RATE_LIMIT_WAIT: Duration = Duration::from_secs(24 * 60 * 60);

/// Converts a server-supplied seconds value into a wait, clamped to
/// [`MAX_RATE_LIMIT_WAIT`]. Negative and non-finite values are rejected.
pub fn wait_from_secs(seconds: f64) -> Option<Duration> {
    if !seconds.is_finite() || seconds < 0.0 {
        return None;
    }
    Duration::try_from_secs_f64(seconds.min(MAX_RATE_LIMIT_WAIT.as_secs_f64()))
        .ok()
        .map(|wait| wait.min(MAX_RATE_LIMIT_WAIT))
}

/// `now + wait` with the wait clamped to [`MAX_RATE_LIMIT_WAIT`].
pub fn deadline_after(now: Instant, wait: Duration) -> Instant {
    now.checked_add(wait.min(MAX_RATE_LIMIT_WAIT)).unwrap_or(now)
}

/// Rate-limit information carried by one response.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RateLimitHeaders {
    pub limit: Option<u32>,
    pub remaining: Option<u32>,
    /// Time until the window resets, from `reset-after` or derived from the
    /// absolute `reset` epoch timestamp.
    pub reset_after: Option<Duration>,
    pub bucket: Option<String>,
    pub global: bool,
    pub scope: Option<String>,
    pub retry_after: Option<Duration>,
}

impl RateLimitHeaders {
    pub fn parse(headers: &HeaderMap) -> Self {
        let text = |name: &str| headers.get(name).and_then(|v| v.to_str().ok());
        let seconds = |name: &str| {
            text(name)
                .and_then(|v| v.trim().parse::<f64>().ok())
                .and_then(wait_from_secs)
        };

        let reset_after = seconds(HEADER_RESET_AFTER).or_else(|| {
            let reset_epoch = text(HEADER_RESET)?.trim().parse::<f64>().ok()?;
            let now = Utc::now().timestamp_millis() as f64 / 1000.0;
            wait_from_secs((reset_epoch - now).max(0.0))
        });

        Self {
            limit: text(HEADER_LIMIT).and_then(|v| v.trim().parse().ok()),
            remaining: text(HEADER_REMAINING).and_then(|v| v.trim().parse().ok()),
            reset_after,
            bucket: text(HEADER_BUCKET).map(str::to_string),
            global: text(HEADER_GLOBAL)
                .map(|v| v.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
            scope: text(HEADER_SCOPE).map(str::to_string),
            retry_after: seconds(HEADER_RETRY_AFTER),
        }
    }

    /// Whether the response carried a usable per-route limit.
    pub fn has_route_limit(&self) -> bool {
        self.limit.is_some() && self.remaining.is_some() && self.reset_after.is_some()
    }
}

/// Limit state and pending requests for one bucket key.
#[derive(Debug)]
pub struct RateLimitBucket {
    key: BucketKey,
    limit: u32,
    remaining: u32,
    reset_at: Instant,
    /// The route answered without rate-limit headers; only the global limit applies.
    unlimited: bool,
    server_hash: Option<String>,
    queue: VecDeque<Request>,
}

impl RateLimitBucket {
    /// A fresh bucket admits one request; the response teaches it the real limit.
    pub fn new(key: BucketKey, now: Instant) -> Self {
        Self {
            key,
            limit: 1,
            remaining: 1,
            reset_at: now,
            unlimited: false,
            server_hash: None,
            queue: VecDeque::new(),
        }
    }

    pub fn key(&self) -> &BucketKey {
        &self.key
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }

    pub fn remaining(&self) -> u32 {
        self.remaining
    }

    pub fn reset_at(&self) -> Instant {
        self.reset_at
    }

    pub fn is_unlimited(&self) -> bool {
        self.unlimited
    }

    pub fn server_hash(&self) -> Option<&str> {
        self.server_hash.as_deref()
    }

    /// Time to wait before the next request may be sent, replenishing the
    /// bucket once its reset has passed.
    pub fn get_rate_limit(&mut self, now: Instant) -> Option<Duration> {
        if self.unlimited {
            return None;
        }
        if now >= self.reset_at {
            self.remaining = self.limit;
            return None;
        }
        if self.remaining == 0 {
            return Some(self.reset_at - now);
        }
        None
    }

    /// Spends one use locally; the next response overwrites the estimate.
    pub fn on_request_sent(&mut self, now: Instant) {
        if self.unlimited {
            return;
        }
        if now >= self.reset_at {
            self.remaining = self.limit;
        }
        self.remaining = self.remaining.saturating_sub(1);
    }

    pub fn update(&mut self, headers: &RateLimitHeaders, now: Instant) {
        if let Some(hash) = &headers.bucket {
            if self.server_hash.as_deref() != Some(hash.as_str()) {
                self.server_hash = Some(hash.clone());
            }
        }

        match (headers.limit, headers.remaining, headers.reset_after) {
            (Some(limit), Some(remaining), Some(reset_after)) => {
                self.unlimited = false;
                self.limit = limit.max(1);
                self.remaining = remaining.min(self.limit);
                self.reset_at = deadline_after(now, reset_after);
            }
            _ => self.unlimited = true,
        }
    }

    /// Blocks the bucket until `now + wait`, used after a 429.
    pub fn exhaust_for(&mut self, wait: Duration, now: Instant) {
        self.unlimited = false;
        self.remaining = 0;
        self.reset_at = deadline_after(now, wait);
    }

    pub fn push_back(&mut self, request: Request) {
        self.queue.push_back(request);
    }

    /// Puts a request back at the head so a rate-limited retry keeps FIFO order.
    pub fn push_front(&mut self, request: Request) {
        self.queue.push_front(request);
    }

    pub fn pop_front(&mut self) -> Option<Request> {
        self.queue.pop_front()
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_queue_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn drain_queue(&mut self) -> Vec<Request> {
        self.queue.drain(..).collect()
    }

    /// Empty and holding no limit information worth keeping.
    pub fn is_idle(&self, now: Instant) -> bool {
        self.queue.is_empty() && now >= self.reset_at
    }
}
