use clap::{Arg, ArgMatches, Command};
use secrecy::SecretString;
use std::time::Duration;

use crate::authflow::deps::OtpConfig;

pub const ARG_OTP_CODE_TTL_SECONDS: &str = "otp-code-ttl-seconds";
pub const ARG_OTP_RESEND_COOLDOWN_SECONDS: &str = "otp-resend-cooldown-seconds";
pub const ARG_OTP_MAX_ATTEMPTS: &str = "otp-max-attempts";
pub const ARG_OTP_CODE_LENGTH: &str = "otp-code-length";
pub const ARG_OTP_FIXED_CODE: &str = "otp-fixed-code";

#[derive(Debug)]
pub struct Options {
    pub code_ttl: Duration,
    pub resend_cooldown: Duration,
    pub max_attempts: u32,
    pub code_length: usize,
    pub fixed_code: Option<SecretString>,
}

impl Options {
    /// Parse one-time code arguments from matches.
    ///
    /// # Errors
    /// Returns an error if the fixed code is not made of digits.
    pub fn parse(matches: &ArgMatches) -> anyhow::Result<Self> {
        let fixed_code = matches
            .get_one::<String>(ARG_OTP_FIXED_CODE)
            .map(|code| code.trim().to_string())
            .filter(|code| !code.is_empty());
        if let Some(code) = &fixed_code {
            if !code.chars().all(|c| c.is_ascii_digit()) {
                anyhow::bail!("--{ARG_OTP_FIXED_CODE} must contain digits only");
            }
        }

        Ok(Self {
            code_ttl: Duration::from_secs(
                matches
                    .get_one::<u64>(ARG_OTP_CODE_TTL_SECONDS)
                    .copied()
                    .unwrap_or(300),
            ),
            resend_cooldown: Duration::from_secs(
                matches
                    .get_one::<u64>(ARG_OTP_RESEND_COOLDOWN_SECONDS)
                    .copied()
                    .unwrap_or(60),
            ),
            max_attempts: matches
                .get_one::<u32>(ARG_OTP_MAX_ATTEMPTS)
                .copied()
                .unwrap_or(5),
            code_length: matches
                .get_one::<usize>(ARG_OTP_CODE_LENGTH)
                .copied()
                .unwrap_or(6),
            fixed_code: fixed_code.map(SecretString::from),
        })
    }

    #[must_use]
    pub fn config(&self) -> OtpConfig {
        let config = OtpConfig::new()
            .with_code_ttl(self.code_ttl)
            .with_resend_cooldown(self.resend_cooldown)
            .with_max_attempts(self.max_attempts)
            .with_code_length(self.code_length);
        match &self.fixed_code {
            Some(code) => config.with_fixed_code(code.clone()),
            None => config,
        }
    }
}

#[must_use]
pub fn with_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_OTP_CODE_TTL_SECONDS)
                .long(ARG_OTP_CODE_TTL_SECONDS)
                .help("Validity of a one-time code in seconds")
                .env("AUTHFLOW_OTP_CODE_TTL_SECONDS")
                .default_value("300")
                .value_parser(clap::value_parser!(u64)),
        )
        .arg(
            Arg::new(ARG_OTP_RESEND_COOLDOWN_SECONDS)
                .long(ARG_OTP_RESEND_COOLDOWN_SECONDS)
                .help("Cooldown before a code can be resent")
                .env("AUTHFLOW_OTP_RESEND_COOLDOWN_SECONDS")
                .default_value("60")
                .value_parser(clap::value_parser!(u64)),
        )
        .arg(
            Arg::new(ARG_OTP_MAX_ATTEMPTS)
                .long(ARG_OTP_MAX_ATTEMPTS)
                .help("Failed attempts before a code is locked")
                .env("AUTHFLOW_OTP_MAX_ATTEMPTS")
                .default_value("5")
                .value_parser(clap::value_parser!(u32).range(1..)),
        )
        .arg(
            Arg::new(ARG_OTP_CODE_LENGTH)
                .long(ARG_OTP_CODE_LENGTH)
                .help("Number of digits in generated codes")
                .env("AUTHFLOW_OTP_CODE_LENGTH")
                .default_value("6")
                .value_parser(clap::value_parser!(usize)),
        )
        .arg(
            Arg::new(ARG_OTP_FIXED_CODE)
                .long(ARG_OTP_FIXED_CODE)
                .help("Use this code for every verification (testing only)")
                .env("AUTHFLOW_OTP_FIXED_CODE")
                .hide_env_values(true),
        )
}
