//! Replaces the password after the login id was verified.

use async_trait::async_trait;
use serde_json::{Value, json};

use super::inputs::NewPasswordInput;
use super::{FACT_USER_ID, claim_verified};
use crate::authflow::error::StepError;
use crate::authflow::intent::{Action, Intent, Pending, Reaction, StepContext};
use crate::authflow::node::{FlowEvent, Input, InputPayload, Node};
use crate::authflow::registry::{RegistryError, decode_params};

pub(super) const KIND: &str = "reset_password";

#[derive(Debug, Default, serde::Deserialize)]
#[serde(deny_unknown_fields)]
struct ResetPasswordParams {}

#[derive(Debug)]
pub struct ResetPassword {
    done: bool,
}

impl ResetPassword {
    /// # Errors
    /// Returns an error if `data` carries unknown parameters.
    pub fn from_params(data: &Value) -> Result<Box<dyn Intent>, RegistryError> {
        let ResetPasswordParams {} = decode_params(KIND, data)?;
        Ok(Box::new(Self { done: false }))
    }
}

#[async_trait]
impl Intent for ResetPassword {
    fn kind(&self) -> &str {
        KIND
    }

    fn pending(&self, ctx: &StepContext<'_>) -> Result<Pending, StepError> {
        if self.done {
            return Ok(Pending::Finished);
        }
        Ok(Pending::Input(Action::new(
            KIND,
            &[NewPasswordInput::KIND],
            json!({
                "password_policy": { "min_length": ctx.deps.password_policy.min_length },
            }),
        )))
    }

    async fn apply(
        &self,
        ctx: &StepContext<'_>,
        input: Option<&Input>,
    ) -> Result<Reaction, StepError> {
        let Some(input) = input else {
            return Err(StepError::NoChange);
        };
        let payload: NewPasswordInput = input.decode()?;
        if !claim_verified(ctx) {
            return Err(StepError::Internal(anyhow::anyhow!(
                "reset_password reached without a verified claim"
            )));
        }
        let user_id = ctx.require_fact(FACT_USER_ID)?;
        ctx.deps.password_policy.check(&payload.new_password)?;
        ctx.deps
            .users
            .set_password(user_id, &payload.new_password)
            .await?;
        Ok(Reaction::new(KIND, json!({})).with_event(FlowEvent::new(
            "user.password_reset",
            json!({ "user_id": user_id }),
        )))
    }

    fn absorb(&mut self, _ctx: &StepContext<'_>, node: &Node) -> Result<(), StepError> {
        node.outcome_as::<Value>(KIND)?;
        self.done = true;
        Ok(())
    }
}
