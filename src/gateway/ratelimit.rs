//! Per-client sliding-window rate limiting.
//!
//! Each client owns a bucket of recent request instants. A check prunes
//! entries older than the window, rejects once the bucket is full (without
//! consuming a slot), and otherwise records the request. The global map lock
//! is held only long enough to fetch or insert a bucket; bucket mutation
//! happens under the per-bucket lock so clients do not contend with each
//! other.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Window length for the "requests per minute" contract.
const WINDOW: Duration = Duration::from_secs(60);

/// Bucket-map size at which idle buckets are swept.
const SWEEP_THRESHOLD: usize = 4096;

/// Outcome of one rate-limit check, carrying everything the advisory
/// headers need.
#[derive(Debug, Clone, Copy)]
pub struct RateLimitResult {
    pub allowed: bool,
    pub limit: u32,
    pub remaining: u32,
    pub reset_seconds: u64,
}

type Bucket = Arc<Mutex<VecDeque<Instant>>>;

pub struct RateLimiter {
    window: Duration,
    buckets: Mutex<HashMap<String, Bucket>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::with_window(WINDOW)
    }

    /// Custom window, for tests that cannot wait a minute.
    pub fn with_window(window: Duration) -> Self {
        Self {
            window,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    pub fn check(&self, client_id: &str, limit: u32) -> RateLimitResult {
        let bucket = self.bucket_for(client_id);
        let mut window = bucket.lock().unwrap();

        let now = Instant::now();
        while window
            .front()
            .is_some_and(|&oldest| now.duration_since(oldest) >= self.window)
        {
            window.pop_front();
        }

        if window.len() >= limit as usize {
            // Full: the reset hint is when the oldest entry leaves the window.
            // A rejected request does not consume a slot.
            let reset = window
                .front()
                .map(|&oldest| self.window.saturating_sub(now.duration_since(oldest)))
                .unwrap_or(self.window);
            return RateLimitResult {
                allowed: false,
                limit,
                remaining: 0,
                reset_seconds: reset.as_secs().max(1),
            };
        }

        window.push_back(now);
        let remaining = limit.saturating_sub(window.len() as u32);
        let reset = window
            .front()
            .map(|&oldest| self.window.saturating_sub(now.duration_since(oldest)))
            .unwrap_or(self.window);

        RateLimitResult {
            allowed: true,
            limit,
            remaining,
            reset_seconds: reset.as_secs(),
        }
    }

    fn bucket_for(&self, client_id: &str) -> Bucket {
        let mut buckets = self.buckets.lock().unwrap();
        if buckets.len() >= SWEEP_THRESHOLD && !buckets.contains_key(client_id) {
            // Bounded housekeeping: drop buckets that are idle (empty after
            // their window expired). Skips buckets currently locked.
            let window = self.window;
            buckets.retain(|_, bucket| match bucket.try_lock() {
                Ok(mut queue) => {
                    let now = Instant::now();
                    while queue
                        .front()
                        .is_some_and(|&oldest| now.duration_since(oldest) >= window)
                    {
                        queue.pop_front();
                    }
                    !queue.is_empty()
                }
                Err(_) => true,
            });
        }
        buckets
            .entry(client_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(VecDeque::new())))
            .clone()
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}
