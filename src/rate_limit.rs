//! Per-client fixed-window rate limiting.

use dashmap::DashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;

/// Stale windows are swept once every this many checks.
const SWEEP_INTERVAL: u64 = 1024;

#[derive(Debug, Clone, Copy)]
struct Window {
    start: Instant,
    count: u64,
}

/// Allows at most `max_requests` per client IP in each window.
/// A ceiling of zero disables the limiter.
#[derive(Debug)]
pub struct RateLimiter {
    max_requests: u64,
    window: Duration,
    clients: DashMap<IpAddr, Window>,
    checks: AtomicU64,
    rejected: AtomicU64,
}

impl RateLimiter {
    pub fn new(max_requests: u64, window: Duration) -> Self {
        Self {
            max_requests,
            window,
            clients: DashMap::new(),
            checks: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.max_requests > 0
    }

    /// Record a request from `client`; returns false when it must be rejected.
    pub fn check(&self, client: IpAddr) -> bool {
        if !self.is_enabled() {
            return true;
        }

        let now = Instant::now();
        if self.checks.fetch_add(1, Ordering::Relaxed) % SWEEP_INTERVAL == SWEEP_INTERVAL - 1 {
            self.sweep(now);
        }

        let count = {
            let mut entry = self.clients.entry(client).or_insert(Window {
                start: now,
                count: 0,
            });
            if now.duration_since(entry.start) >= self.window {
                *entry = Window {
                    start: now,
                    count: 0,
                };
            }
            entry.count += 1;
            entry.count
        };

        if count > self.max_requests {
            self.rejected.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        true
    }

    /// Drop clients whose window has expired.
    fn sweep(&self, now: Instant) {
        self.clients
            .retain(|_, window| now.duration_since(window.start) < self.window);
    }

    /// Clients with a window currently tracked.
    pub fn tracked_clients(&self) -> usize {
        self.clients.len()
    }

    /// Total rejected requests since start.
    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }
}
