// SPDX-License-Identifier: BUSL-1.1
// Copyright 2025 Alfred Jean LLC

//! Memory-backed token bucket for the upgrade endpoint, keyed by source
//! address (§5: "login endpoint and upgrade endpoint are rate-limited
//! per source address"). Small hand-rolled primitive, in the style of
//! the session layer's own debounce guards, rather than a dependency —
//! the pack carries no rate-limiting crate.

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

pub struct RateLimiter {
    buckets: Mutex<HashMap<IpAddr, Bucket>>,
    capacity: f64,
    refill_per_sec: f64,
}

impl RateLimiter {
    /// `per_minute` tokens are available, refilled continuously.
    pub fn new(per_minute: u32) -> Self {
        let capacity = per_minute as f64;
        Self {
            buckets: Mutex::new(HashMap::new()),
            capacity,
            refill_per_sec: capacity / 60.0,
        }
    }

    /// Attempt to take one token for `addr`. Returns `true` if allowed.
    pub async fn try_acquire(&self, addr: IpAddr) -> bool {
        let mut buckets = self.buckets.lock().await;
        let now = Instant::now();
        let bucket = buckets.entry(addr).or_insert_with(|| Bucket {
            tokens: self.capacity,
            last_refill: now,
        });

        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        bucket.last_refill = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Drop buckets that have been full and idle, bounding memory use.
    pub async fn sweep(&self, idle_for: Duration) {
        let now = Instant::now();
        let mut buckets = self.buckets.lock().await;
        buckets.retain(|_, b| {
            b.tokens < self.capacity || now.duration_since(b.last_refill) < idle_for
        });
    }
}

#[cfg(test)]
#[path = "ratelimit_tests.rs"]
mod tests;
