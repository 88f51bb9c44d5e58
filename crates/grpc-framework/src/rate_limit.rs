//! Rate limiting capabilities consulted by the admission gate.
//!
//! Two capabilities exist: a global [`RateLimiter`] that answers "may one more
//! call proceed now?", and a [`CallerRateLimiter`] that answers the same
//! question for a single [`CallerKey`]. Both are consulted concurrently from
//! every inbound call and must synchronize their own state.
//!
//! [`TokenBucket`] and [`CallerTokenBuckets`] are the provided
//! implementations. Buckets start full.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;
use std::time::{Duration, Instant};

/// Global limit applied by [`ServerConfigBuilder::with_default_rate_limiters`]:
/// `(tokens per second, burst)`.
///
/// [`ServerConfigBuilder::with_default_rate_limiters`]: crate::config::ServerConfigBuilder::with_default_rate_limiters
pub const DEFAULT_RATE_LIMIT: (f64, u32) = (100.0, 50);

/// Per-caller limit applied by the default rate limiters.
pub const DEFAULT_CALLER_RATE_LIMIT: (f64, u32) = (10.0, 25);

/// Upper bound on the number of callers tracked by [`CallerTokenBuckets`].
pub const DEFAULT_MAX_CALLERS: usize = 10_000;

/// A gate answering whether one more unit of work may proceed now.
pub trait RateLimiter: Send + Sync {
    fn allow(&self) -> bool;
}

/// A gate answering whether one more unit of work from `caller` may proceed.
pub trait CallerRateLimiter: Send + Sync {
    fn allow(&self, caller: &CallerKey) -> bool;
}

/// Key used for per-caller limiting.
///
/// Derived from the network origin because per-caller limiting runs before
/// authentication. Callers without a known address (Unix domain socket peers,
/// in-process calls) share [`CallerKey::Local`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CallerKey {
    Addr(IpAddr),
    Local,
}

impl fmt::Display for CallerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallerKey::Addr(ip) => write!(f, "{ip}"),
            CallerKey::Local => f.write_str("local"),
        }
    }
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

impl Bucket {
    fn full(burst: u32, now: Instant) -> Self {
        Self {
            tokens: f64::from(burst),
            last_refill: now,
        }
    }

    fn try_take(&mut self, rate: f64, burst: u32, now: Instant) -> bool {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * rate).min(f64::from(burst));
        self.last_refill = now;

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

/// A token bucket refilled at `rate` tokens per second, holding at most
/// `burst` tokens.
#[derive(Debug)]
pub struct TokenBucket {
    rate: f64,
    burst: u32,
    bucket: Mutex<Bucket>,
}

impl TokenBucket {
    /// Creates a full bucket. A `burst` of zero never admits anything.
    pub fn new(rate: f64, burst: u32) -> Self {
        Self {
            rate: rate.max(0.0),
            burst,
            bucket: Mutex::new(Bucket::full(burst, Instant::now())),
        }
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }

    pub fn burst(&self) -> u32 {
        self.burst
    }
}

impl RateLimiter for TokenBucket {
    fn allow(&self) -> bool {
        self.bucket
            .lock()
            .try_take(self.rate, self.burst, Instant::now())
    }
}

#[derive(Debug)]
struct CallerEntry {
    bucket: Bucket,
    last_seen: Instant,
}

/// One [`TokenBucket`]-equivalent per caller, in a bounded table.
///
/// When the table is full, entries idle for longer than the stale threshold
/// are evicted first; if that frees nothing, the least recently seen caller is
/// dropped.
#[derive(Debug)]
pub struct CallerTokenBuckets {
    rate: f64,
    burst: u32,
    max_callers: usize,
    stale_after: Duration,
    callers: Mutex<HashMap<CallerKey, CallerEntry>>,
}

impl CallerTokenBuckets {
    pub fn new(rate: f64, burst: u32) -> Self {
        Self::with_capacity(rate, burst, DEFAULT_MAX_CALLERS)
    }

    pub fn with_capacity(rate: f64, burst: u32, max_callers: usize) -> Self {
        Self {
            rate: rate.max(0.0),
            burst,
            max_callers: max_callers.max(1),
            stale_after: Duration::from_secs(600),
            callers: Mutex::new(HashMap::new()),
        }
    }

    /// Number of callers currently tracked.
    pub fn tracked_callers(&self) -> usize {
        self.callers.lock().len()
    }

    fn evict(
        callers: &mut HashMap<CallerKey, CallerEntry>,
        max_callers: usize,
        stale_after: Duration,
        now: Instant,
    ) {
        callers.retain(|_, entry| now.saturating_duration_since(entry.last_seen) < stale_after);

        if callers.len() < max_callers {
            return;
        }
        if let Some(oldest) = callers
            .iter()
            .min_by_key(|(_, entry)| entry.last_seen)
            .map(|(key, _)| *key)
        {
            callers.remove(&oldest);
        }
    }
}

impl CallerRateLimiter for CallerTokenBuckets {
    fn allow(&self, caller: &CallerKey) -> bool {
        let now = Instant::now();
        let mut callers = self.callers.lock();

        if !callers.contains_key(caller) && callers.len() >= self.max_callers {
            Self::evict(&mut callers, self.max_callers, self.stale_after, now);
        }

        let entry = callers.entry(*caller).or_insert_with(|| CallerEntry {
            bucket: Bucket::full(self.burst, now),
            last_seen: now,
        });
        entry.last_seen = now;
        entry.bucket.try_take(self.rate, self.burst, now)
    }
}
