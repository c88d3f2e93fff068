//! Process-global runtime state
//!
//! Rate-limit buckets, rate counters, penalty boxes, the WAF log buffer and
//! the compiled-regex cache are shared across requests and therefore live
//! behind a single [`Runtime`] handle with one `parking_lot` lock per
//! submodule. Token-bucket refill happens inside the lock as one
//! read-modify-write, so balances never go negative and concurrent
//! increments never lose updates. [`Runtime::init`] resets everything.

use crate::error::EvalError;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use regex::{Regex, RegexBuilder};
use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

/// Wall-clock milliseconds since the Unix epoch
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// A refilling-credit token bucket
///
/// Invariant: `0 <= tokens <= max_tokens` after every operation.
#[derive(Debug, Clone)]
struct TokenBucket {
    tokens: f64,
    last_refill: u64,
    max_tokens: f64,
    /// Tokens per millisecond
    refill_rate: f64,
}

impl TokenBucket {
    fn new(limit: f64, window_secs: f64, now: u64) -> Self {
        Self {
            tokens: limit,
            last_refill: now,
            max_tokens: limit,
            refill_rate: limit / (window_secs * 1000.0),
        }
    }

    fn refill(&mut self, now: u64) {
        let elapsed = now.saturating_sub(self.last_refill) as f64;
        self.tokens = (self.tokens + elapsed * self.refill_rate).min(self.max_tokens);
        self.last_refill = now;
    }

    /// Non-destructive current balance
    fn balance(&self, now: u64) -> f64 {
        let elapsed = now.saturating_sub(self.last_refill) as f64;
        (self.tokens + elapsed * self.refill_rate).min(self.max_tokens)
    }
}

/// A tumbling-window counter
#[derive(Debug, Clone)]
struct RateCounter {
    window_start: u64,
    count: i64,
    window_ms: u64,
}

/// Process-global runtime state for the rate-limiting and WAF modules
pub struct Runtime {
    buckets: Mutex<HashMap<String, TokenBucket>>,
    counters: Mutex<HashMap<String, RateCounter>>,
    /// (box name, key) -> expiry in wall-clock ms
    penalty_boxes: Mutex<HashMap<(String, String), u64>>,
    waf_log: Mutex<Vec<String>>,
    regex_cache: Mutex<HashMap<String, Regex>>,
    /// Window length applied to counters created after `open_window`
    counter_window_ms: Mutex<u64>,
}

static RUNTIME: Lazy<Runtime> = Lazy::new(Runtime::new);

impl Runtime {
    fn new() -> Self {
        Self {
            buckets: Mutex::new(HashMap::new()),
            counters: Mutex::new(HashMap::new()),
            penalty_boxes: Mutex::new(HashMap::new()),
            waf_log: Mutex::new(Vec::new()),
            regex_cache: Mutex::new(HashMap::new()),
            counter_window_ms: Mutex::new(60_000),
        }
    }

    /// Returns the process-wide runtime handle
    pub fn global() -> &'static Runtime {
        &RUNTIME
    }

    /// Resets buckets, counters, penalty boxes and logs to empty
    pub fn init(&self) {
        self.buckets.lock().clear();
        self.counters.lock().clear();
        self.penalty_boxes.lock().clear();
        self.waf_log.lock().clear();
        *self.counter_window_ms.lock() = 60_000;
    }

    // -- token buckets ------------------------------------------------------

    /// Token-bucket check for `key` with capacity `limit` refilled over
    /// `window_secs`. Returns true and consumes one token when available.
    pub fn rate_limit(&self, key: &str, limit: f64, window_secs: f64) -> bool {
        let now = now_ms();
        let mut buckets = self.buckets.lock();
        let bucket = buckets
            .entry(key.to_string())
            .or_insert_with(|| TokenBucket::new(limit, window_secs, now));
        bucket.refill(now);
        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Whole tokens currently available for `key`, computed without
    /// consuming anything; 0 for a never-seen key
    pub fn rate_limit_tokens(&self, key: &str) -> i64 {
        let buckets = self.buckets.lock();
        match buckets.get(key) {
            Some(bucket) => bucket.balance(now_ms()).floor() as i64,
            None => 0,
        }
    }

    // -- rate counters ------------------------------------------------------

    /// Sets the rolling window applied to subsequently touched counters and
    /// returns an opaque window identifier
    pub fn open_window(&self, seconds: f64) -> String {
        let ms = (seconds * 1000.0).max(1.0) as u64;
        *self.counter_window_ms.lock() = ms;
        now_ms().to_string()
    }

    /// Adds `delta` to the named counter, resetting when the window rolled
    /// over; returns the new in-window value
    pub fn ratecounter_increment(&self, name: &str, delta: i64) -> i64 {
        let now = now_ms();
        let window_ms = *self.counter_window_ms.lock();
        let mut counters = self.counters.lock();
        let counter = counters.entry(name.to_string()).or_insert(RateCounter {
            window_start: now,
            count: 0,
            window_ms,
        });
        if now.saturating_sub(counter.window_start) >= counter.window_ms {
            counter.window_start = now;
            counter.count = delta;
        } else {
            counter.count += delta;
        }
        counter.count
    }

    /// Current in-window value of a counter; 0 when absent or expired
    pub fn counter_value(&self, name: &str) -> i64 {
        let now = now_ms();
        let counters = self.counters.lock();
        match counters.get(name) {
            Some(counter) if now.saturating_sub(counter.window_start) < counter.window_ms => {
                counter.count
            }
            _ => 0,
        }
    }

    /// True when the counter has reached `threshold` within its window
    pub fn check_rate(&self, name: &str, threshold: i64) -> bool {
        self.counter_value(name) >= threshold
    }

    /// Evaluates a `"count:seconds,..."` spec against the counter; true when
    /// any pair's count is exceeded. The trailing-window rate is approximated
    /// by the counter's current window value.
    pub fn check_rates(&self, name: &str, spec: &str) -> bool {
        let value = self.counter_value(name);
        spec.split(',')
            .filter_map(|pair| {
                let (count, _seconds) = pair.trim().split_once(':')?;
                count.trim().parse::<i64>().ok()
            })
            .any(|count| value >= count)
    }

    // -- penalty boxes ------------------------------------------------------

    /// Records `key` in `box_name` for `seconds`; always returns true
    pub fn penaltybox_add(&self, box_name: &str, key: &str, seconds: f64) -> bool {
        let expiry = now_ms() + (seconds * 1000.0) as u64;
        self.penalty_boxes
            .lock()
            .insert((box_name.to_string(), key.to_string()), expiry);
        true
    }

    /// True when a non-expired entry exists; expired entries are removed
    /// lazily on read
    pub fn penaltybox_has(&self, box_name: &str, key: &str) -> bool {
        let now = now_ms();
        let mut boxes = self.penalty_boxes.lock();
        let slot = (box_name.to_string(), key.to_string());
        match boxes.get(&slot) {
            Some(&expiry) if expiry > now => true,
            Some(_) => {
                boxes.remove(&slot);
                false
            }
            None => false,
        }
    }

    // -- WAF log ------------------------------------------------------------

    /// Appends a line to the WAF log buffer (FIFO)
    pub fn waf_log_append(&self, line: String) {
        self.waf_log.lock().push(line);
    }

    /// Snapshot of the WAF log buffer
    pub fn waf_log(&self) -> Vec<String> {
        self.waf_log.lock().clone()
    }

    // -- regex cache --------------------------------------------------------

    /// Compiles a pattern, consulting the cache first; behaviorally
    /// equivalent to a per-call compile
    pub fn compile_regex(&self, pattern: &str, case_insensitive: bool) -> Result<Regex, EvalError> {
        let key = format!("{}\u{0}{}", case_insensitive as u8, pattern);
        if let Some(re) = self.regex_cache.lock().get(&key) {
            return Ok(re.clone());
        }
        let re = RegexBuilder::new(pattern)
            .case_insensitive(case_insensitive)
            .build()
            .map_err(|e| EvalError::BadRegex {
                message: e.to_string(),
            })?;
        self.regex_cache.lock().insert(key, re.clone());
        Ok(re)
    }
}
