//! Built-in steps.
//!
//! `signup`, `login` and `account_recovery` are public flow roots that walk a
//! declarative step list. The remaining intents are internal: a client can
//! only reach them through a flow.
//!
//! Steps talk to each other through facts:
//!
//! | fact             | published by           | read by                                   |
//! |------------------|------------------------|-------------------------------------------|
//! | `login_id`       | `identify`             | `verify`, `create_authenticator`, `authenticate` |
//! | `login_id_type`  | `identify`             | `verify`, `create_authenticator`, `authenticate` |
//! | `user_id`        | `identify`, `create_authenticator` | `authenticate`, `reset_password`, finished output |
//! | `claim_verified` | `verify`               | `create_authenticator`, `reset_password`  |

mod authenticate;
mod create_authenticator;
mod flow;
mod identify;
pub mod inputs;
mod reset_password;
mod verify;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

pub use authenticate::Authenticate;
pub use create_authenticator::CreateAuthenticator;
pub use flow::FlowIntent;
pub use identify::Identify;
pub use reset_password::ResetPassword;
pub use verify::Verify;

use super::config::FlowType;
use super::deps::{LoginIdType, OtpChannel};
use super::error::StepError;
use super::intent::StepContext;
use super::registry::{Exposure, Registry, RegistryError};
use inputs::{
    AuthenticationInput, IdentificationInput, NewAuthenticatorInput, NewPasswordInput,
    ResendCodeInput, VerificationCodeInput,
};

pub const FACT_LOGIN_ID: &str = "login_id";
pub const FACT_LOGIN_ID_TYPE: &str = "login_id_type";
pub const FACT_USER_ID: &str = "user_id";
pub const FACT_CLAIM_VERIFIED: &str = "claim_verified";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthenticationKind {
    PrimaryPassword,
    PrimaryOobOtpEmail,
    PrimaryOobOtpSms,
}

impl AuthenticationKind {
    /// Whether this authenticator can be used for a login id of `login_id_type`.
    #[must_use]
    pub const fn supports(self, login_id_type: LoginIdType) -> bool {
        match self {
            Self::PrimaryPassword => true,
            Self::PrimaryOobOtpEmail => matches!(login_id_type, LoginIdType::Email),
            Self::PrimaryOobOtpSms => matches!(login_id_type, LoginIdType::Phone),
        }
    }
}

impl fmt::Display for AuthenticationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::PrimaryPassword => "primary_password",
            Self::PrimaryOobOtpEmail => "primary_oob_otp_email",
            Self::PrimaryOobOtpSms => "primary_oob_otp_sms",
        };
        f.write_str(name)
    }
}

/// Register every built-in intent and input.
///
/// # Errors
/// Returns an error if a kind is already registered.
pub fn register(registry: &mut Registry) -> Result<(), RegistryError> {
    registry.register_intent(FlowType::Signup.as_str(), Exposure::Public, |data| {
        FlowIntent::from_params(FlowType::Signup, data)
    })?;
    registry.register_intent(FlowType::Login.as_str(), Exposure::Public, |data| {
        FlowIntent::from_params(FlowType::Login, data)
    })?;
    registry.register_intent(
        FlowType::AccountRecovery.as_str(),
        Exposure::Public,
        |data| FlowIntent::from_params(FlowType::AccountRecovery, data),
    )?;

    registry.register_intent(identify::KIND, Exposure::Internal, Identify::from_params)?;
    registry.register_intent(verify::KIND, Exposure::Internal, Verify::from_params)?;
    registry.register_intent(
        create_authenticator::KIND,
        Exposure::Internal,
        CreateAuthenticator::from_params,
    )?;
    registry.register_intent(
        authenticate::KIND,
        Exposure::Internal,
        Authenticate::from_params,
    )?;
    registry.register_intent(
        reset_password::KIND,
        Exposure::Internal,
        ResetPassword::from_params,
    )?;

    registry.register_input::<IdentificationInput>()?;
    registry.register_input::<VerificationCodeInput>()?;
    registry.register_input::<ResendCodeInput>()?;
    registry.register_input::<NewAuthenticatorInput>()?;
    registry.register_input::<AuthenticationInput>()?;
    registry.register_input::<NewPasswordInput>()?;
    Ok(())
}

/// `login_id` and its type as published by `identify`.
fn identified(ctx: &StepContext<'_>) -> Result<(String, LoginIdType), StepError> {
    let login_id = ctx.require_fact(FACT_LOGIN_ID)?.to_string();
    let login_id_type = ctx
        .facts
        .get(FACT_LOGIN_ID_TYPE)
        .and_then(|value| LoginIdType::deserialize(value).ok())
        .ok_or_else(|| {
            StepError::Internal(anyhow::anyhow!("missing fact `{FACT_LOGIN_ID_TYPE}`"))
        })?;
    Ok((login_id, login_id_type))
}

const fn channel_for(login_id_type: LoginIdType) -> OtpChannel {
    match login_id_type {
        LoginIdType::Email => OtpChannel::Email,
        LoginIdType::Phone => OtpChannel::Sms,
    }
}

fn claim_verified(ctx: &StepContext<'_>) -> bool {
    ctx.facts
        .get(FACT_CLAIM_VERIFIED)
        .and_then(Value::as_bool)
        .unwrap_or(false)
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_registry_exposes_only_flow_roots() -> anyhow::Result<()> {
        let registry = Registry::with_builtin_steps()?;
        for kind in ["signup", "login", "account_recovery"] {
            assert!(registry.is_public(kind));
        }
        for kind in [
            "identify",
            "verify",
            "create_authenticator",
            "authenticate",
            "reset_password",
        ] {
            assert!(!registry.is_public(kind), "{kind} must be internal");
        }
        Ok(())
    }

    #[test]
    fn authentication_kinds_match_login_id_types() {
        assert!(AuthenticationKind::PrimaryPassword.supports(LoginIdType::Phone));
        assert!(AuthenticationKind::PrimaryOobOtpEmail.supports(LoginIdType::Email));
        assert!(!AuthenticationKind::PrimaryOobOtpEmail.supports(LoginIdType::Phone));
        assert!(AuthenticationKind::PrimaryOobOtpSms.supports(LoginIdType::Phone));
        assert_eq!(
            AuthenticationKind::PrimaryOobOtpSms.to_string(),
            "primary_oob_otp_sms"
        );
    }
}
