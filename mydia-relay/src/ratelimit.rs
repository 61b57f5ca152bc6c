//! Per-IP fixed-window limiter for the unauthenticated claim redeem route.
//!
//! Claim codes are short-lived and drawn from a 32-character alphabet, so
//! online guessing is already impractical; this limiter keeps a noisy client
//! from hammering the lookup path regardless.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

const DEFAULT_MAX_PER_WINDOW: u32 = 30;
const WINDOW: Duration = Duration::from_secs(60);

#[derive(Clone)]
pub struct RedeemRateLimiter {
    inner: Arc<Mutex<HashMap<IpAddr, (u32, Instant)>>>,
    max_per_window: u32,
}

impl Default for RedeemRateLimiter {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PER_WINDOW)
    }
}

impl RedeemRateLimiter {
    pub fn new(max_per_window: u32) -> Self {
        Self {
            inner: Arc::new(Mutex::new(HashMap::new())),
            max_per_window,
        }
    }

    /// Records one attempt; false means the caller must be turned away.
    pub fn check(&self, ip: IpAddr) -> bool {
        let now = Instant::now();
        let mut counts = self.inner.lock();

        let entry = counts.entry(ip).or_insert((0, now));

        if now.duration_since(entry.1) > WINDOW {
            *entry = (0, now);
        }

        entry.0 += 1;
        entry.0 <= self.max_per_window
    }

    /// Drops windows that expired; called from the periodic cleanup sweep.
    pub fn cleanup(&self) {
        let now = Instant::now();
        self.inner
            .lock()
            .retain(|_, (_, window_start)| now.duration_since(*window_start) < WINDOW * 2);
    }
}
