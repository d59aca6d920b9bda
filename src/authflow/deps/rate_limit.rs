//! Rate limiting primitives for flow steps.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RateLimitAction {
    SendCode,
    VerifyCode,
    Password,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RateLimitDecision {
    Allowed,
    Limited,
}

pub trait RateLimiter: Send + Sync {
    /// Count one attempt of `action` for `key` (a normalized login id).
    fn check(&self, key: &str, action: RateLimitAction) -> RateLimitDecision;
}

#[derive(Clone, Debug)]
pub struct NoopRateLimiter;

impl RateLimiter for NoopRateLimiter {
    fn check(&self, _key: &str, _action: RateLimitAction) -> RateLimitDecision {
        RateLimitDecision::Allowed
    }
}

/// Fixed-window counter kept in process memory.
///
/// Good enough for a single instance; a shared limiter plugs in behind the
/// same trait.
#[derive(Debug)]
pub struct WindowRateLimiter {
    limit: u32,
    window: Duration,
    hits: Mutex<HashMap<(RateLimitAction, String), (Instant, u32)>>,
}

impl WindowRateLimiter {
    #[must_use]
    pub fn new(limit: u32, window: Duration) -> Self {
        Self {
            limit,
            window,
            hits: Mutex::new(HashMap::new()),
        }
    }
}

impl RateLimiter for WindowRateLimiter {
    fn check(&self, key: &str, action: RateLimitAction) -> RateLimitDecision {
        let now = Instant::now();
        let mut hits = self.hits.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = hits
            .entry((action, key.to_string()))
            .or_insert((now, 0));
        if now.duration_since(entry.0) >= self.window {
            *entry = (now, 0);
        }
        if entry.1 >= self.limit {
            return RateLimitDecision::Limited;
        }
        entry.1 += 1;
        RateLimitDecision::Allowed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn noop_rate_limiter_allows() {
        let limiter = NoopRateLimiter;
        assert_eq!(
            limiter.check("a@example.com", RateLimitAction::SendCode),
            RateLimitDecision::Allowed
        );
    }

    #[test]
    fn window_rate_limiter_limits_per_key_and_action() {
        let limiter = WindowRateLimiter::new(2, Duration::from_secs(60));
        assert_eq!(
            limiter.check("a", RateLimitAction::Password),
            RateLimitDecision::Allowed
        );
        assert_eq!(
            limiter.check("a", RateLimitAction::Password),
            RateLimitDecision::Allowed
        );
        assert_eq!(
            limiter.check("a", RateLimitAction::Password),
            RateLimitDecision::Limited
        );
        assert_eq!(
            limiter.check("b", RateLimitAction::Password),
            RateLimitDecision::Allowed
        );
        assert_eq!(
            limiter.check("a", RateLimitAction::SendCode),
            RateLimitDecision::Allowed
        );
    }

    #[test]
    fn window_resets_after_expiry() {
        let limiter = WindowRateLimiter::new(1, Duration::ZERO);
        assert_eq!(
            limiter.check("a", RateLimitAction::VerifyCode),
            RateLimitDecision::Allowed
        );
        assert_eq!(
            limiter.check("a", RateLimitAction::VerifyCode),
            RateLimitDecision::Allowed
        );
    }
}
