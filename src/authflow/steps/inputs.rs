//! Input payloads accepted by the built-in steps.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use super::AuthenticationKind;
use crate::authflow::deps::LoginIdType;
use crate::authflow::node::InputPayload;
use crate::authflow::utils::{normalize_email, normalize_phone, valid_email, valid_phone};

const REDACTED: &str = "[redacted]";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IdentificationInput {
    pub identification: LoginIdType,
    pub login_id: String,
}

impl IdentificationInput {
    /// Login id in the form users are stored under.
    #[must_use]
    pub fn normalized_login_id(&self) -> String {
        match self.identification {
            LoginIdType::Email => normalize_email(&self.login_id),
            LoginIdType::Phone => normalize_phone(&self.login_id),
        }
    }
}

impl InputPayload for IdentificationInput {
    const KIND: &'static str = "identification";

    fn validate(&self) -> Result<(), String> {
        let login_id = self.normalized_login_id();
        let valid = match self.identification {
            LoginIdType::Email => valid_email(&login_id),
            LoginIdType::Phone => valid_phone(&login_id),
        };
        if valid {
            Ok(())
        } else {
            Err(format!("invalid {} login id", self.identification))
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VerificationCodeInput {
    pub code: String,
}

impl InputPayload for VerificationCodeInput {
    const KIND: &'static str = "verification_code";

    fn validate(&self) -> Result<(), String> {
        let code = self.code.trim();
        if code.is_empty() || !code.chars().all(|c| c.is_ascii_digit()) {
            return Err("code must be numeric".to_string());
        }
        Ok(())
    }

    fn redacted(&self) -> Value {
        json!({ "code": REDACTED })
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResendCodeInput {}

impl InputPayload for ResendCodeInput {
    const KIND: &'static str = "resend_code";
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NewAuthenticatorInput {
    pub authentication: AuthenticationKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_password: Option<String>,
}

impl InputPayload for NewAuthenticatorInput {
    const KIND: &'static str = "new_authenticator";

    fn validate(&self) -> Result<(), String> {
        if self.authentication == AuthenticationKind::PrimaryPassword
            && self.new_password.as_deref().is_none_or(str::is_empty)
        {
            return Err("new_password is required".to_string());
        }
        Ok(())
    }

    fn redacted(&self) -> Value {
        let mut value = json!({ "authentication": self.authentication });
        if self.new_password.is_some() {
            value["new_password"] = json!(REDACTED);
        }
        value
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AuthenticationInput {
    pub authentication: AuthenticationKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

impl InputPayload for AuthenticationInput {
    const KIND: &'static str = "authentication";

    fn validate(&self) -> Result<(), String> {
        if self.authentication == AuthenticationKind::PrimaryPassword
            && self.password.as_deref().is_none_or(str::is_empty)
        {
            return Err("password is required".to_string());
        }
        Ok(())
    }

    fn redacted(&self) -> Value {
        let mut value = json!({ "authentication": self.authentication });
        if self.password.is_some() {
            value["password"] = json!(REDACTED);
        }
        value
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NewPasswordInput {
    pub new_password: String,
}

impl InputPayload for NewPasswordInput {
    const KIND: &'static str = "new_password";

    fn validate(&self) -> Result<(), String> {
        if self.new_password.is_empty() {
            return Err("new_password is required".to_string());
        }
        Ok(())
    }

    fn redacted(&self) -> Value {
        json!({ "new_password": REDACTED })
    }
}
