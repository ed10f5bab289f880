//! Sliding-window request limiter.
//!
//! Each `(action, user, origin)` key owns a ring buffer of the instants of
//! its accepted requests, bounded by the policy's `max_requests`. A check
//! drops instants older than the window from the front, rejects when the
//! buffer is full, and otherwise records `now`.
//!
//! State is in-process. Several engine instances behind a load balancer each
//! enforce their own window; sharing a limit across them needs an external
//! store.

use std::{
    collections::VecDeque,
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use dashmap::DashMap;
use thiserror::Error;
use tokio::time::Instant;

use crate::{config::RateLimitConfig, observability::metrics};

/// Identity used for requests without an authenticated user.
pub const ANONYMOUS_USER: &str = "anonymous";

/// Idle keys are dropped once every this many checks.
pub const CLEANUP_EVERY: u64 = 1024;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct RateLimitKey {
    action: String,
    user: String,
    origin: String,
}

impl RateLimitKey {
    fn new(action: &str, user_id: Option<&str>, origin: &str) -> Self {
        Self {
            action: action.to_string(),
            user: user_id.unwrap_or(ANONYMOUS_USER).to_string(),
            origin: origin.to_string(),
        }
    }
}

/// An accepted request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitDecision {
    pub limit: u32,
    /// Requests still allowed in the current window after this one.
    pub remaining: u32,
    pub window: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Rate limit exceeded for '{action}': {limit} requests per {}s, retry in {}s", window.as_secs(), retry_after.as_secs().max(1))]
pub struct RateLimitError {
    pub action: String,
    pub limit: u32,
    pub window: Duration,
    /// Time until the oldest request in the window expires.
    pub retry_after: Duration,
}

pub struct RateLimiter {
    config: RateLimitConfig,
    windows: DashMap<RateLimitKey, VecDeque<Instant>>,
    checks: AtomicU64,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            windows: DashMap::new(),
            checks: AtomicU64::new(0),
        }
    }

    /// Check a request and record it when allowed.
    pub fn check(
        &self,
        action: &str,
        user_id: Option<&str>,
        origin: &str,
    ) -> Result<RateLimitDecision, RateLimitError> {
        let policy = self.config.policy_for(action);
        let window = policy.window();
        let limit = policy.max_requests;

        if !self.config.enabled {
            return Ok(RateLimitDecision {
                limit,
                remaining: limit,
                window,
            });
        }

        // Must run before the entry below is locked: cleanup visits every shard
        if self.checks.fetch_add(1, Ordering::Relaxed) % CLEANUP_EVERY == CLEANUP_EVERY - 1 {
            let removed = self.cleanup();
            tracing::debug!(removed, tracked = self.windows.len(), "Pruned idle rate-limit keys");
        }

        let now = Instant::now();
        let key = RateLimitKey::new(action, user_id, origin);
        let mut entry = self
            .windows
            .entry(key)
            .or_insert_with(|| VecDeque::with_capacity(limit as usize));
        let timestamps = entry.value_mut();

        while timestamps
            .front()
            .is_some_and(|t| now.duration_since(*t) >= window)
        {
            timestamps.pop_front();
        }

        if timestamps.len() >= limit as usize {
            let retry_after = timestamps
                .front()
                .map(|oldest| window.saturating_sub(now.duration_since(*oldest)))
                .unwrap_or(window);
            tracing::warn!(
                action,
                user = user_id.unwrap_or(ANONYMOUS_USER),
                origin,
                requests = timestamps.len(),
                max = limit,
                "Rate limit exceeded"
            );
            metrics::record_rate_limit(action, false);
            return Err(RateLimitError {
                action: action.to_string(),
                limit,
                window,
                retry_after,
            });
        }

        timestamps.push_back(now);
        let remaining = limit.saturating_sub(timestamps.len() as u32);
        metrics::record_rate_limit(action, true);

        Ok(RateLimitDecision {
            limit,
            remaining,
            window,
        })
    }

    /// Requests still allowed for a key without recording one.
    pub fn remaining(&self, action: &str, user_id: Option<&str>, origin: &str) -> u32 {
        let policy = self.config.policy_for(action);
        let window = policy.window();
        let now = Instant::now();
        let key = RateLimitKey::new(action, user_id, origin);

        let used = self
            .windows
            .get(&key)
            .map(|entry| {
                entry
                    .value()
                    .iter()
                    .filter(|t| now.duration_since(**t) < window)
                    .count()
            })
            .unwrap_or(0);

        policy.max_requests.saturating_sub(used as u32)
    }

    /// Drop keys whose windows hold no recent requests.
    /// Returns the number of keys removed.
    pub fn cleanup(&self) -> usize {
        let now = Instant::now();
        let before = self.windows.len();

        self.windows.retain(|key, timestamps| {
            let window = self.config.policy_for(&key.action).window();
            while timestamps
                .front()
                .is_some_and(|t| now.duration_since(*t) >= window)
            {
                timestamps.pop_front();
            }
            !timestamps.is_empty()
        });

        before.saturating_sub(self.windows.len())
    }

    /// Forget every window.
    pub fn clear(&self) {
        self.windows.clear();
    }

    pub fn tracked_keys(&self) -> usize {
        self.windows.len()
    }
}
