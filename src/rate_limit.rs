//! Rate limiting.
//!
//! There are two different kinds of limits here:
//!
//! 1. [`RateLimit`] describes how fast we may call a remote API (for example
//!    "10/s"). It becomes a [`leaky_bucket::RateLimiter`], and callers wait
//!    for a token instead of being refused.
//! 2. [`FixedWindowLimiter`] is admission control for job submissions, keyed by
//!    (subject, resource). Requests over the limit are refused immediately.
//!
//! The fixed window is deliberately simple. A burst straddling a window
//! boundary may admit up to twice `max_requests` in a short period. Counters
//! live in process memory, so each running instance enforces its own limit.

use std::{
    collections::HashMap,
    fmt,
    str::FromStr,
    sync::Mutex,
    time::{Duration, Instant},
};

use leaky_bucket::RateLimiter;

use crate::prelude::*;

/// The period over which the rate limit is applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RateLimitPeriod {
    /// Per second.
    Second,
    /// Per minute.
    Minute,
}

impl RateLimitPeriod {
    /// Convert this period to a [`Duration`].
    pub fn to_duration(self) -> Duration {
        match self {
            RateLimitPeriod::Second => Duration::from_secs(1),
            RateLimitPeriod::Minute => Duration::from_secs(60),
        }
    }
}

impl fmt::Display for RateLimitPeriod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RateLimitPeriod::Second => write!(f, "s"),
            RateLimitPeriod::Minute => write!(f, "m"),
        }
    }
}

impl FromStr for RateLimitPeriod {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "s" => Ok(RateLimitPeriod::Second),
            "m" => Ok(RateLimitPeriod::Minute),
            _ => Err(anyhow!("Unsupported rate limit period: {:?}", s)),
        }
    }
}

/// A rate limit for an outbound API, written as `"10/s"` or `"600/m"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RateLimit {
    /// The maximum number of requests allowed in the period.
    pub max_requests: usize,
    /// The period over which the rate limit is applied.
    pub per_period: RateLimitPeriod,
}

impl RateLimit {
    /// Create a new [`RateLimit`].
    #[allow(dead_code)]
    pub fn new(max_requests: usize, per_period: RateLimitPeriod) -> Self {
        Self {
            max_requests,
            per_period,
        }
    }

    /// Create a [`RateLimiter`] for this rate limit.
    pub fn to_rate_limiter(&self) -> RateLimiter {
        // We only refill once per period, so a "600/m" limit allows a burst of
        // 600 at startup. That's acceptable for the per-job call volumes we see.
        RateLimiter::builder()
            .initial(self.max_requests)
            .refill(self.max_requests)
            .max(self.max_requests)
            .interval(self.per_period.to_duration())
            .build()
    }
}

impl fmt::Display for RateLimit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.max_requests, self.per_period)
    }
}

impl FromStr for RateLimit {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let parse = |s: &str| -> Result<_> {
            let mut parts = s.splitn(2, '/');
            let max_requests = parts
                .next()
                .ok_or_else(|| anyhow!("Missing max requests"))?
                .parse::<usize>()?;
            let per_period = parts
                .next()
                .ok_or_else(|| anyhow!("Missing period"))?
                .parse::<RateLimitPeriod>()?;
            Ok(Self {
                max_requests,
                per_period,
            })
        };
        parse(s).with_context(|| format!("Failed to parse rate limit: {:?}", s))
    }
}

impl<'de> Deserialize<'de> for RateLimit {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(|err: anyhow::Error| {
            serde::de::Error::custom(format!("{err:#}"))
        })
    }
}

/// The key of a fixed window: who is asking, and for what.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WindowKey {
    /// The subject making the request.
    pub subject: String,
    /// The resource being requested.
    pub resource: String,
}

impl WindowKey {
    /// Create a new key.
    pub fn new(subject: impl Into<String>, resource: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            resource: resource.into(),
        }
    }
}

impl fmt::Display for WindowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.subject, self.resource)
    }
}

/// One counting window.
#[derive(Debug, Clone, Copy)]
struct Window {
    /// Requests admitted in this window.
    count: usize,
    /// When the window started.
    started_at: Instant,
}

/// Returned when a request is refused.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("rate limit of {max_requests} per {window:?} exceeded for {key}; retry in {retry_after:?}")]
pub struct RateLimited {
    /// The key that was limited.
    pub key: String,
    /// The configured maximum.
    pub max_requests: usize,
    /// The configured window.
    pub window: Duration,
    /// How long until the current window expires.
    pub retry_after: Duration,
}

/// Fixed-window admission control keyed by (subject, resource).
#[derive(Debug)]
pub struct FixedWindowLimiter {
    /// The maximum number of requests per window.
    max_requests: usize,

    /// The length of each window.
    window: Duration,

    /// Windows by key. Held only for an instant per request.
    windows: Mutex<HashMap<WindowKey, Window>>,
}

impl FixedWindowLimiter {
    /// Create a new limiter.
    pub fn new(max_requests: usize, window: Duration) -> Self {
        Self {
            max_requests,
            window,
            windows: Mutex::new(HashMap::new()),
        }
    }

    /// Try to admit one request for `key` now.
    pub fn try_acquire(&self, key: &WindowKey) -> Result<usize, RateLimited> {
        self.try_acquire_at(key, Instant::now())
    }

    /// Try to admit one request for `key` at time `now`. On success, returns
    /// the request count within the current window.
    pub fn try_acquire_at(&self, key: &WindowKey, now: Instant) -> Result<usize, RateLimited> {
        let mut windows = self.windows.lock().expect("lock poisoned");

        // Drop expired windows so idle keys don't accumulate forever.
        if windows.len() > 1024 {
            let window = self.window;
            windows.retain(|_, w| now.saturating_duration_since(w.started_at) < window);
        }

        match windows.get_mut(key) {
            Some(w) if now.saturating_duration_since(w.started_at) < self.window => {
                if w.count >= self.max_requests {
                    let elapsed = now.saturating_duration_since(w.started_at);
                    return Err(RateLimited {
                        key: key.to_string(),
                        max_requests: self.max_requests,
                        window: self.window,
                        retry_after: self.window.saturating_sub(elapsed),
                    });
                }
                w.count += 1;
                Ok(w.count)
            }
            _ => {
                if self.max_requests == 0 {
                    return Err(RateLimited {
                        key: key.to_string(),
                        max_requests: 0,
                        window: self.window,
                        retry_after: self.window,
                    });
                }
                windows.insert(
                    key.clone(),
                    Window {
                        count: 1,
                        started_at: now,
                    },
                );
                Ok(1)
            }
        }
    }

    /// Give back a request admitted for `key` at `admitted_at`, because it
    /// never went anywhere. Does nothing if that window has since expired.
    pub fn refund(&self, key: &WindowKey, admitted_at: Instant) {
        let mut windows = self.windows.lock().expect("lock poisoned");
        if let Some(w) = windows.get_mut(key)
            && w.started_at <= admitted_at
            && admitted_at.saturating_duration_since(w.started_at) < self.window
        {
            w.count = w.count.saturating_sub(1);
        }
    }
}
