//! Per-IP sliding-window rate limiting.
//!
//! Two limiter instances guard the API: a general one over every request
//! and a stricter one over store creation. Failed requests (status >= 400)
//! are not counted: the middleware records the request up front and rolls
//! the record back when the response turns out to be an error.
//!
//! # Memory management
//!
//! Tracked state is per source IP, so an attacker cycling spoofed
//! addresses could grow the map without bound. Two defenses:
//!
//! 1. Probabilistic cleanup every `cleanup_interval` requests removes IPs
//!    with no recent activity.
//! 2. A hard cap on tracked IPs; when full and cleanup reclaims nothing,
//!    new IPs are rejected.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock};
use std::time::{Duration, Instant};

/// Configuration for one rate limiter instance.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Requests allowed per window.
    pub max_requests: u32,
    /// Sliding window size.
    pub window: Duration,
    /// Run cleanup every N requests.
    pub cleanup_interval: u64,
    /// Hard cap on unique IPs tracked.
    pub max_tracked_ips: usize,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: 30,
            window: Duration::from_secs(60),
            cleanup_interval: 100,
            max_tracked_ips: 10_000,
        }
    }
}

/// Marker error: the request would exceed the limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitExceeded;

/// An in-memory sliding-window rate limiter keyed by source IP.
pub struct RateLimiter {
    config: RateLimitConfig,
    state: RwLock<HashMap<IpAddr, Vec<Instant>>>,
    request_count: AtomicU64,
}

impl RateLimiter {
    /// Creates a limiter with the given configuration.
    #[must_use]
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            state: RwLock::new(HashMap::new()),
            request_count: AtomicU64::new(0),
        }
    }

    /// Checks and records a request from `ip`.
    ///
    /// # Errors
    ///
    /// Returns [`RateLimitExceeded`] when the window is full, or when the
    /// tracked-IP cap is reached and the IP is new.
    pub fn check(&self, ip: IpAddr) -> Result<(), RateLimitExceeded> {
        let now = Instant::now();
        let cutoff = now.checked_sub(self.config.window).unwrap_or(now);

        let count = self.request_count.fetch_add(1, Ordering::Relaxed);
        if count > 0 && count % self.config.cleanup_interval == 0 {
            self.cleanup();
        }

        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);

        if !state.contains_key(&ip) && state.len() >= self.config.max_tracked_ips {
            // Full of strangers: reclaim expired entries in place, then
            // re-check.
            state.retain(|_, timestamps| {
                timestamps.retain(|&t| t > cutoff);
                !timestamps.is_empty()
            });
            if state.len() >= self.config.max_tracked_ips {
                tracing::warn!(ip = %ip, max = self.config.max_tracked_ips, "tracked IP cap reached, rejecting new client");
                return Err(RateLimitExceeded);
            }
        }

        let timestamps = state.entry(ip).or_default();
        timestamps.retain(|&t| t > cutoff);
        if timestamps.len() >= self.config.max_requests as usize {
            tracing::warn!(
                ip = %ip,
                requests = timestamps.len(),
                max = self.config.max_requests,
                "rate limit exceeded"
            );
            return Err(RateLimitExceeded);
        }
        timestamps.push(now);
        Ok(())
    }

    /// Removes the most recent recorded request for `ip`.
    ///
    /// Called when a recorded request turns out to have failed, so failed
    /// requests do not consume quota.
    pub fn forget_one(&self, ip: IpAddr) {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(timestamps) = state.get_mut(&ip) {
            timestamps.pop();
            if timestamps.is_empty() {
                state.remove(&ip);
            }
        }
    }

    /// Drops IPs with no recent requests.
    pub fn cleanup(&self) {
        let now = Instant::now();
        let cutoff = now.checked_sub(self.config.window).unwrap_or(now);
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        state.retain(|_, timestamps| {
            timestamps.retain(|&t| t > cutoff);
            !timestamps.is_empty()
        });
    }

    /// Number of IPs currently tracked.
    #[must_use]
    pub fn tracked_ips(&self) -> usize {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        state.len()
    }
}
