//! One-time codes sent to an email address or phone number.
//!
//! Codes are kept hashed in process memory, keyed by purpose, channel and
//! target. A code expires after `code_ttl`, may be re-sent once
//! `resend_cooldown` elapsed, and locks after `max_attempts` wrong guesses.
//! A fixed code can be configured for local runs and tests; it is still
//! "sent" so the rest of the path behaves the same.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::authflow::error::{DomainError, StepError};
use crate::authflow::utils::{generate_code, hash_code};

const DEFAULT_CODE_TTL: Duration = Duration::from_secs(5 * 60);
const DEFAULT_RESEND_COOLDOWN: Duration = Duration::from_secs(60);
const DEFAULT_MAX_ATTEMPTS: u32 = 5;
const DEFAULT_CODE_LENGTH: usize = 6;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OtpChannel {
    Email,
    Sms,
}

impl OtpChannel {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Email => "email",
            Self::Sms => "sms",
        }
    }
}

impl fmt::Display for OtpChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug)]
pub struct OtpConfig {
    code_ttl: Duration,
    resend_cooldown: Duration,
    max_attempts: u32,
    code_length: usize,
    fixed_code: Option<SecretString>,
}

impl Default for OtpConfig {
    fn default() -> Self {
        Self {
            code_ttl: DEFAULT_CODE_TTL,
            resend_cooldown: DEFAULT_RESEND_COOLDOWN,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            code_length: DEFAULT_CODE_LENGTH,
            fixed_code: None,
        }
    }
}

impl OtpConfig {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_code_ttl(mut self, ttl: Duration) -> Self {
        self.code_ttl = ttl;
        self
    }

    #[must_use]
    pub fn with_resend_cooldown(mut self, cooldown: Duration) -> Self {
        self.resend_cooldown = cooldown;
        self
    }

    #[must_use]
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    #[must_use]
    pub fn with_code_length(mut self, length: usize) -> Self {
        self.code_length = length;
        self
    }

    /// Every code sent is `code`. For local runs and tests only.
    #[must_use]
    pub fn with_fixed_code(mut self, code: SecretString) -> Self {
        self.code_length = code.expose_secret().len();
        self.fixed_code = Some(code);
        self
    }

    #[must_use]
    pub fn code_ttl(&self) -> Duration {
        self.code_ttl
    }

    #[must_use]
    pub fn resend_cooldown(&self) -> Duration {
        self.resend_cooldown
    }

    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    #[must_use]
    pub fn code_length(&self) -> usize {
        self.code_length
    }
}

/// Delivery abstraction for codes (SMTP, SMS gateway, ...).
#[async_trait]
pub trait OtpSender: Send + Sync {
    /// # Errors
    /// Returns an error when the code could not be handed off.
    async fn send(&self, channel: OtpChannel, target: &str, code: &str, purpose: &str)
    -> Result<()>;
}

/// Local dev sender that logs the code instead of delivering it.
#[derive(Clone, Debug)]
pub struct LogOtpSender;

#[async_trait]
impl OtpSender for LogOtpSender {
    async fn send(
        &self,
        channel: OtpChannel,
        target: &str,
        code: &str,
        purpose: &str,
    ) -> Result<()> {
        info!(%channel, to = target, code, purpose, "otp send stub");
        Ok(())
    }
}

#[derive(Debug)]
struct CodeState {
    hash: Vec<u8>,
    sent_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    failed_attempts: u32,
}

fn delta(duration: Duration) -> TimeDelta {
    TimeDelta::from_std(duration).unwrap_or(TimeDelta::MAX)
}

fn add(at: DateTime<Utc>, duration: Duration) -> DateTime<Utc> {
    at.checked_add_signed(delta(duration))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

pub struct OtpService {
    config: OtpConfig,
    sender: Arc<dyn OtpSender>,
    codes: Mutex<HashMap<String, CodeState>>,
}

impl fmt::Debug for OtpService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OtpService")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl OtpService {
    #[must_use]
    pub fn new(config: OtpConfig, sender: Arc<dyn OtpSender>) -> Self {
        Self {
            config,
            sender,
            codes: Mutex::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn config(&self) -> &OtpConfig {
        &self.config
    }

    /// Earliest time a code sent at `sent_at` may be re-sent.
    #[must_use]
    pub fn can_resend_at(&self, sent_at: DateTime<Utc>) -> DateTime<Utc> {
        add(sent_at, self.config.resend_cooldown)
    }

    fn key(purpose: &str, channel: OtpChannel, target: &str) -> String {
        format!("{purpose}:{channel}:{target}")
    }

    /// Send a code unless one was sent within the cooldown.
    ///
    /// Without `force`, a code still in cooldown is reused and its send time
    /// returned. With `force` (an explicit resend) the cooldown is an error.
    ///
    /// # Errors
    /// Returns [`DomainError::ResendCooldown`] or an internal delivery error.
    pub async fn send(
        &self,
        purpose: &str,
        channel: OtpChannel,
        target: &str,
        force: bool,
    ) -> Result<DateTime<Utc>, StepError> {
        let key = Self::key(purpose, channel, target);
        let now = Utc::now();
        let mut codes = self.codes.lock().await;

        if let Some(state) = codes.get(&key) {
            let resend_at = self.can_resend_at(state.sent_at);
            if now < resend_at && state.expires_at > now {
                if force {
                    let remaining = (resend_at - now).num_seconds().max(1);
                    return Err(DomainError::ResendCooldown {
                        remaining_seconds: u64::try_from(remaining).unwrap_or(1),
                    }
                    .into());
                }
                return Ok(state.sent_at);
            }
        }

        let code = match &self.config.fixed_code {
            Some(code) => code.expose_secret().to_string(),
            None => generate_code(self.config.code_length)?,
        };
        self.sender.send(channel, target, &code, purpose).await?;
        codes.insert(
            key,
            CodeState {
                hash: hash_code(&code),
                sent_at: now,
                expires_at: add(now, self.config.code_ttl),
                failed_attempts: 0,
            },
        );
        Ok(now)
    }

    /// Check `code`. A correct code is consumed.
    ///
    /// # Errors
    /// Returns [`DomainError::InvalidCode`], [`DomainError::CodeExpired`] or
    /// [`DomainError::Locked`].
    pub async fn verify(
        &self,
        purpose: &str,
        channel: OtpChannel,
        target: &str,
        code: &str,
    ) -> Result<(), DomainError> {
        let key = Self::key(purpose, channel, target);
        let mut codes = self.codes.lock().await;
        let Some(state) = codes.get_mut(&key) else {
            return Err(DomainError::InvalidCode);
        };

        if state.expires_at <= Utc::now() {
            codes.remove(&key);
            return Err(DomainError::CodeExpired);
        }
        if state.failed_attempts >= self.config.max_attempts {
            return Err(DomainError::Locked);
        }
        if state.hash != hash_code(code.trim()) {
            state.failed_attempts += 1;
            warn!(
                purpose,
                %channel,
                failed_attempts = state.failed_attempts,
                "verification code mismatch"
            );
            if state.failed_attempts >= self.config.max_attempts {
                return Err(DomainError::Locked);
            }
            return Err(DomainError::InvalidCode);
        }

        codes.remove(&key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct CapturingSender {
        sent: StdMutex<Vec<String>>,
    }

    #[async_trait]
    impl OtpSender for CapturingSender {
        async fn send(
            &self,
            _channel: OtpChannel,
            _target: &str,
            code: &str,
            _purpose: &str,
        ) -> Result<()> {
            if let Ok(mut sent) = self.sent.lock() {
                sent.push(code.to_string());
            }
            Ok(())
        }
    }

    fn fixed(config: OtpConfig) -> OtpService {
        OtpService::new(
            config.with_fixed_code(SecretString::from("111111".to_string())),
            Arc::new(LogOtpSender),
        )
    }

    #[tokio::test]
    async fn fixed_code_verifies_once() -> anyhow::Result<()> {
        let otp = fixed(OtpConfig::new());
        otp.send("signup", OtpChannel::Email, "a@example.com", false)
            .await?;
        assert_eq!(
            otp.verify("signup", OtpChannel::Email, "a@example.com", "000000")
                .await,
            Err(DomainError::InvalidCode)
        );
        otp.verify("signup", OtpChannel::Email, "a@example.com", "111111")
            .await?;
        assert_eq!(
            otp.verify("signup", OtpChannel::Email, "a@example.com", "111111")
                .await,
            Err(DomainError::InvalidCode)
        );
        Ok(())
    }

    #[tokio::test]
    async fn generated_codes_reach_the_sender() -> anyhow::Result<()> {
        let sender = Arc::new(CapturingSender::default());
        let otp = OtpService::new(OtpConfig::new().with_code_length(8), sender.clone());
        otp.send("login", OtpChannel::Sms, "+15550109999", false)
            .await?;
        let code = sender
            .sent
            .lock()
            .map_err(|_| anyhow::anyhow!("poisoned"))?
            .first()
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("no code sent"))?;
        assert_eq!(code.len(), 8);
        otp.verify("login", OtpChannel::Sms, "+15550109999", &code)
            .await?;
        Ok(())
    }

    #[tokio::test]
    async fn resend_within_cooldown() -> anyhow::Result<()> {
        let otp = fixed(OtpConfig::new());
        let first = otp
            .send("signup", OtpChannel::Email, "a@example.com", false)
            .await?;
        let again = otp
            .send("signup", OtpChannel::Email, "a@example.com", false)
            .await?;
        assert_eq!(first, again);

        let forced = otp
            .send("signup", OtpChannel::Email, "a@example.com", true)
            .await;
        assert!(matches!(
            forced,
            Err(StepError::Domain(DomainError::ResendCooldown { .. }))
        ));
        Ok(())
    }

    #[tokio::test]
    async fn resend_after_cooldown_sends_new_code() -> anyhow::Result<()> {
        let otp = fixed(OtpConfig::new().with_resend_cooldown(Duration::ZERO));
        let first = otp
            .send("signup", OtpChannel::Email, "a@example.com", false)
            .await?;
        let second = otp
            .send("signup", OtpChannel::Email, "a@example.com", true)
            .await?;
        assert!(second >= first);
        Ok(())
    }

    #[tokio::test]
    async fn locks_after_max_attempts() -> anyhow::Result<()> {
        let otp = fixed(OtpConfig::new().with_max_attempts(2));
        otp.send("signup", OtpChannel::Email, "a@example.com", false)
            .await?;
        assert_eq!(
            otp.verify("signup", OtpChannel::Email, "a@example.com", "1")
                .await,
            Err(DomainError::InvalidCode)
        );
        assert_eq!(
            otp.verify("signup", OtpChannel::Email, "a@example.com", "2")
                .await,
            Err(DomainError::Locked)
        );
        assert_eq!(
            otp.verify("signup", OtpChannel::Email, "a@example.com", "111111")
                .await,
            Err(DomainError::Locked)
        );
        Ok(())
    }

    #[tokio::test]
    async fn expired_codes_are_rejected() -> anyhow::Result<()> {
        let otp = fixed(OtpConfig::new().with_code_ttl(Duration::ZERO));
        otp.send("signup", OtpChannel::Email, "a@example.com", false)
            .await?;
        assert_eq!(
            otp.verify("signup", OtpChannel::Email, "a@example.com", "111111")
                .await,
            Err(DomainError::CodeExpired)
        );
        Ok(())
    }

    #[test]
    fn fixed_code_sets_length() {
        let config = OtpConfig::new().with_fixed_code(SecretString::from("1234".to_string()));
        assert_eq!(config.code_length(), 4);
        assert_eq!(config.max_attempts(), DEFAULT_MAX_ATTEMPTS);
    }
}
