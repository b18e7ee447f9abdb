//! Rate limiting for convsync-server.
//!
//! Requests are limited per login uid and, independently, across the whole
//! server. Both use governor; the keyed limiter is backed by DashMap.

use crate::config::LimitsConfig;
use governor::clock::DefaultClock;
use governor::middleware::NoOpMiddleware;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use std::num::NonZeroU32;
use std::sync::Arc;

type KeyedLimiter<K> = RateLimiter<
    K,
    dashmap::DashMap<K, InMemoryState>,
    DefaultClock,
    NoOpMiddleware<governor::clock::QuantaInstant>,
>;

type DirectLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Rate limiters for the HTTP API.
#[derive(Clone)]
pub struct RateLimits {
    /// Requests per uid, configured via `limits.requests_per_minute`.
    user_limiter: Arc<KeyedLimiter<String>>,
    /// Aggregate cap, configured via `limits.global_requests_per_second`.
    global_limiter: Arc<DirectLimiter>,
}

impl std::fmt::Debug for RateLimits {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimits")
            .field("user_keys", &self.user_limiter.len())
            .field("global_limiter", &"DirectLimiter")
            .finish()
    }
}

impl RateLimits {
    /// Create rate limiters from configuration.
    ///
    /// Zero quotas are rejected by [`crate::config::Config::validate`]; if one
    /// slips through it is treated as a quota of one.
    pub fn new(config: &LimitsConfig) -> Self {
        let per_minute = NonZeroU32::new(config.requests_per_minute).unwrap_or(NonZeroU32::MIN);
        let global_rps =
            NonZeroU32::new(config.global_requests_per_second).unwrap_or(NonZeroU32::MIN);

        Self {
            user_limiter: Arc::new(RateLimiter::keyed(Quota::per_minute(per_minute))),
            global_limiter: Arc::new(RateLimiter::direct(Quota::per_second(global_rps))),
        }
    }

    /// Check one request from `uid` against both limiters.
    ///
    /// The global limiter is consulted first so a flood from many users is
    /// refused before per-user state is allocated.
    pub fn check(&self, uid: &str) -> Result<(), RateLimitError> {
        self.global_limiter
            .check()
            .map_err(|_| RateLimitError::GlobalLimitExceeded)?;
        self.user_limiter
            .check_key(&uid.to_string())
            .map_err(|_| RateLimitError::UserLimitExceeded)
    }

    /// Number of tracked uids (for metrics).
    pub fn user_keys_count(&self) -> usize {
        self.user_limiter.len()
    }

    /// Evict uids whose quota has fully recharged.
    pub fn shrink(&self) {
        self.user_limiter.retain_recent();
        self.user_limiter.shrink_to_fit();
    }
}

/// Rate limit error types.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RateLimitError {
    /// Too many requests from this uid.
    UserLimitExceeded,
    /// Too many requests across all users.
    GlobalLimitExceeded,
}

impl std::fmt::Display for RateLimitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UserLimitExceeded => write!(f, "user rate limit exceeded"),
            Self::GlobalLimitExceeded => write!(f, "global rate limit exceeded"),
        }
    }
}

impl std::error::Error for RateLimitError {}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(per_minute: u32, global: u32) -> LimitsConfig {
        LimitsConfig {
            requests_per_minute: per_minute,
            global_requests_per_second: global,
        }
    }

    #[test]
    fn user_limit_allows_within_quota() {
        let limits = RateLimits::new(&config(5, 1000));
        for _ in 0..5 {
            assert!(limits.check("alice").is_ok());
        }
        assert_eq!(
            limits.check("alice"),
            Err(RateLimitError::UserLimitExceeded)
        );
    }

    #[test]
    fn different_users_have_independent_limits() {
        let limits = RateLimits::new(&config(2, 1000));

        assert!(limits.check("alice").is_ok());
        assert!(limits.check("alice").is_ok());
        assert!(limits.check("alice").is_err());

        assert!(limits.check("bob").is_ok());
        assert!(limits.check("bob").is_ok());
        assert!(limits.check("bob").is_err());
        assert_eq!(limits.user_keys_count(), 2);
    }

    #[test]
    fn global_rate_limiter_rejects_excess() {
        let limits = RateLimits::new(&config(100, 5));
        let users = ["a", "b", "c", "d", "e"];
        for uid in users {
            assert!(limits.check(uid).is_ok());
        }
        assert_eq!(
            limits.check("f"),
            Err(RateLimitError::GlobalLimitExceeded)
        );
    }

    #[test]
    fn zero_quota_falls_back_to_one() {
        let limits = RateLimits::new(&config(0, 0));
        assert!(limits.check("alice").is_ok());
        assert!(limits.check("alice").is_err());
    }

    #[test]
    fn rate_limit_error_display() {
        assert_eq!(
            RateLimitError::UserLimitExceeded.to_string(),
            "user rate limit exceeded"
        );
        assert_eq!(
            RateLimitError::GlobalLimitExceeded.to_string(),
            "global rate limit exceeded"
        );
    }

    #[test]
    fn shrink_keeps_limiter_usable() {
        let limits = RateLimits::new(&config(10, 1000));
        let _ = limits.check("alice");
        let _ = limits.check("bob");
        limits.shrink();
        assert!(limits.check("carol").is_ok());
    }
}
