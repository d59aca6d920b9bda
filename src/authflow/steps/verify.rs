//! Proves control of the identified login id with a one-time code.
//!
//! The first code goes out automatically as soon as the step becomes active;
//! the client then sends `verification_code` or asks for `resend_code`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use super::inputs::{ResendCodeInput, VerificationCodeInput};
use super::{FACT_CLAIM_VERIFIED, channel_for, identified};
use crate::authflow::deps::{LoginIdType, RateLimitAction};
use crate::authflow::error::StepError;
use crate::authflow::intent::{Action, Intent, Pending, Reaction, StepContext};
use crate::authflow::node::{FlowEvent, Input, InputPayload, Node};
use crate::authflow::registry::{RegistryError, decode_params};
use crate::authflow::utils::{mask_email, mask_phone};

pub(super) const KIND: &str = "verify";

#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct VerifyParams {
    purpose: String,
}

impl Default for VerifyParams {
    fn default() -> Self {
        Self {
            purpose: KIND.to_string(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
enum VerifyOutcome {
    CodeSent { sent_at: DateTime<Utc> },
    Verified,
}

#[derive(Debug)]
pub struct Verify {
    params: VerifyParams,
    sent_at: Option<DateTime<Utc>>,
    verified: bool,
}

impl Verify {
    /// # Errors
    /// Returns an error if `data` is not valid `verify` parameters.
    pub fn from_params(data: &Value) -> Result<Box<dyn Intent>, RegistryError> {
        Ok(Box::new(Self {
            params: decode_params(KIND, data)?,
            sent_at: None,
            verified: false,
        }))
    }

    async fn send(
        &self,
        ctx: &StepContext<'_>,
        login_id: &str,
        login_id_type: LoginIdType,
        force: bool,
    ) -> Result<Reaction, StepError> {
        ctx.deps.check_rate(login_id, RateLimitAction::SendCode)?;
        let channel = channel_for(login_id_type);
        let sent_at = ctx
            .deps
            .otp
            .send(&self.params.purpose, channel, login_id, force)
            .await?;
        let outcome = VerifyOutcome::CodeSent { sent_at };
        Ok(Reaction::new(KIND, json!(outcome)).with_event(FlowEvent::new(
            "verification.code_sent",
            json!({ "channel": channel, "purpose": self.params.purpose }),
        )))
    }
}

fn masked(login_id: &str, login_id_type: LoginIdType) -> String {
    match login_id_type {
        LoginIdType::Email => mask_email(login_id),
        LoginIdType::Phone => mask_phone(login_id),
    }
}

#[async_trait]
impl Intent for Verify {
    fn kind(&self) -> &str {
        KIND
    }

    fn pending(&self, ctx: &StepContext<'_>) -> Result<Pending, StepError> {
        if self.verified {
            return Ok(Pending::Finished);
        }
        let Some(sent_at) = self.sent_at else {
            return Ok(Pending::Auto {
                step: KIND.to_string(),
            });
        };
        let (login_id, login_id_type) = identified(ctx)?;
        let otp = &ctx.deps.otp;
        Ok(Pending::Input(Action::new(
            KIND,
            &[VerificationCodeInput::KIND, ResendCodeInput::KIND],
            json!({
                "channel": channel_for(login_id_type),
                "masked_claim": masked(&login_id, login_id_type),
                "code_length": otp.config().code_length(),
                "can_resend_at": otp.can_resend_at(sent_at),
            }),
        )))
    }

    async fn apply(
        &self,
        ctx: &StepContext<'_>,
        input: Option<&Input>,
    ) -> Result<Reaction, StepError> {
        if self.verified {
            return Err(StepError::Eof);
        }
        let (login_id, login_id_type) = identified(ctx)?;

        let Some(input) = input else {
            if self.sent_at.is_some() {
                return Err(StepError::NoChange);
            }
            return self.send(ctx, &login_id, login_id_type, false).await;
        };

        match input.kind() {
            VerificationCodeInput::KIND => {
                let payload: VerificationCodeInput = input.decode()?;
                ctx.deps
                    .check_rate(&login_id, RateLimitAction::VerifyCode)?;
                ctx.deps
                    .otp
                    .verify(
                        &self.params.purpose,
                        channel_for(login_id_type),
                        &login_id,
                        &payload.code,
                    )
                    .await?;
                Ok(Reaction::new(KIND, json!(VerifyOutcome::Verified))
                    .with_fact(FACT_CLAIM_VERIFIED, json!(true))
                    .with_event(FlowEvent::new(
                        "verification.verified",
                        json!({ "login_id_type": login_id_type, "purpose": self.params.purpose }),
                    )))
            }
            ResendCodeInput::KIND => self.send(ctx, &login_id, login_id_type, true).await,
            _ => Err(StepError::NoChange),
        }
    }

    fn absorb(&mut self, _ctx: &StepContext<'_>, node: &Node) -> Result<(), StepError> {
        match node.outcome_as(KIND)? {
            VerifyOutcome::CodeSent { sent_at } => self.sent_at = Some(sent_at),
            VerifyOutcome::Verified => self.verified = true,
        }
        Ok(())
    }
}
