//! Collaborators the steps call during `apply`.

pub mod otp;
pub mod rate_limit;
pub mod users;

use std::sync::Arc;

pub use otp::{LogOtpSender, OtpChannel, OtpConfig, OtpSender, OtpService};
pub use rate_limit::{
    NoopRateLimiter, RateLimitAction, RateLimitDecision, RateLimiter, WindowRateLimiter,
};
pub use users::{LoginIdType, MemoryUserDirectory, User, UserDirectory, UserDirectoryError};

use super::error::DomainError;

const DEFAULT_PASSWORD_MIN_LENGTH: usize = 1;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PasswordPolicy {
    pub min_length: usize,
}

impl Default for PasswordPolicy {
    fn default() -> Self {
        Self {
            min_length: DEFAULT_PASSWORD_MIN_LENGTH,
        }
    }
}

impl PasswordPolicy {
    /// # Errors
    /// Returns [`DomainError::PasswordPolicy`] when `password` is too short.
    pub fn check(&self, password: &str) -> Result<(), DomainError> {
        if password.chars().count() < self.min_length {
            return Err(DomainError::PasswordPolicy {
                min_length: self.min_length,
            });
        }
        Ok(())
    }
}

#[derive(Clone)]
pub struct Dependencies {
    pub users: Arc<dyn UserDirectory>,
    pub otp: Arc<OtpService>,
    pub rate_limiter: Arc<dyn RateLimiter>,
    pub password_policy: PasswordPolicy,
}

impl std::fmt::Debug for Dependencies {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dependencies")
            .field("otp", &self.otp)
            .field("password_policy", &self.password_policy)
            .finish_non_exhaustive()
    }
}

impl Dependencies {
    #[must_use]
    pub fn new(
        users: Arc<dyn UserDirectory>,
        otp: Arc<OtpService>,
        rate_limiter: Arc<dyn RateLimiter>,
    ) -> Self {
        Self {
            users,
            otp,
            rate_limiter,
            password_policy: PasswordPolicy::default(),
        }
    }

    /// In-memory directory, logged codes and no rate limiting.
    #[must_use]
    pub fn in_memory(otp: OtpConfig) -> Self {
        Self::new(
            Arc::new(MemoryUserDirectory::new()),
            Arc::new(OtpService::new(otp, Arc::new(LogOtpSender))),
            Arc::new(NoopRateLimiter),
        )
    }

    #[must_use]
    pub fn with_password_policy(mut self, policy: PasswordPolicy) -> Self {
        self.password_policy = policy;
        self
    }

    #[must_use]
    pub fn with_rate_limiter(mut self, limiter: Arc<dyn RateLimiter>) -> Self {
        self.rate_limiter = limiter;
        self
    }

    /// # Errors
    /// Returns [`DomainError::RateLimited`] when the limiter says so.
    pub fn check_rate(&self, key: &str, action: RateLimitAction) -> Result<(), DomainError> {
        match self.rate_limiter.check(key, action) {
            RateLimitDecision::Allowed => Ok(()),
            RateLimitDecision::Limited => Err(DomainError::RateLimited),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn password_policy_counts_characters() {
        let policy = PasswordPolicy { min_length: 3 };
        assert!(policy.check("pwd").is_ok());
        assert_eq!(
            policy.check("pw"),
            Err(DomainError::PasswordPolicy { min_length: 3 })
        );
        assert!(PasswordPolicy::default().check("p").is_ok());
    }

    #[test]
    fn check_rate_maps_limited() {
        let deps = Dependencies::in_memory(OtpConfig::new())
            .with_rate_limiter(Arc::new(WindowRateLimiter::new(1, Duration::from_secs(60))));
        assert!(deps.check_rate("a", RateLimitAction::Password).is_ok());
        assert_eq!(
            deps.check_rate("a", RateLimitAction::Password),
            Err(DomainError::RateLimited)
        );
    }
}
