//! Authenticates an identified user.
//!
//! A password is checked in place. Choosing a one-time code expands into a
//! nested `verify` intent; its nodes are routed through this step and the
//! step finishes when the child does.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use super::inputs::AuthenticationInput;
use super::{AuthenticationKind, FACT_USER_ID, identified};
use crate::authflow::deps::RateLimitAction;
use crate::authflow::error::{DomainError, StepError};
use crate::authflow::intent::{Action, Intent, Pending, Reaction, StepContext};
use crate::authflow::node::{FlowEvent, Input, InputPayload, Node};
use crate::authflow::registry::{IntentSpec, RegistryError, decode_params};

pub(super) const KIND: &str = "authenticate";

#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct AuthenticateParams {
    authentication: Vec<AuthenticationKind>,
}

impl Default for AuthenticateParams {
    fn default() -> Self {
        Self {
            authentication: vec![
                AuthenticationKind::PrimaryPassword,
                AuthenticationKind::PrimaryOobOtpEmail,
                AuthenticationKind::PrimaryOobOtpSms,
            ],
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
enum AuthenticateOutcome {
    Authenticated { authentication: AuthenticationKind },
    Selected { authentication: AuthenticationKind },
}

#[derive(Debug)]
pub struct Authenticate {
    params: AuthenticateParams,
    authenticated: bool,
    child: Option<Box<dyn Intent>>,
}

impl Authenticate {
    /// # Errors
    /// Returns an error if `data` is not valid parameters.
    pub fn from_params(data: &Value) -> Result<Box<dyn Intent>, RegistryError> {
        Ok(Box::new(Self {
            params: decode_params(KIND, data)?,
            authenticated: false,
            child: None,
        }))
    }

    fn offered(&self, ctx: &StepContext<'_>) -> Result<Vec<AuthenticationKind>, StepError> {
        let (_, login_id_type) = identified(ctx)?;
        Ok(self
            .params
            .authentication
            .iter()
            .copied()
            .filter(|kind| kind.supports(login_id_type))
            .collect())
    }

    fn verify_spec() -> IntentSpec {
        IntentSpec::new(super::verify::KIND, json!({ "purpose": "login" }))
    }
}

#[async_trait]
impl Intent for Authenticate {
    fn kind(&self) -> &str {
        KIND
    }

    fn pending(&self, ctx: &StepContext<'_>) -> Result<Pending, StepError> {
        if self.authenticated {
            return Ok(Pending::Finished);
        }
        if let Some(child) = &self.child {
            return child.pending(ctx);
        }
        let options: Vec<Value> = self
            .offered(ctx)?
            .into_iter()
            .map(|kind| json!({ "authentication": kind }))
            .collect();
        Ok(Pending::Input(Action::new(
            KIND,
            &[AuthenticationInput::KIND],
            json!({ "options": options }),
        )))
    }

    async fn apply(
        &self,
        ctx: &StepContext<'_>,
        input: Option<&Input>,
    ) -> Result<Reaction, StepError> {
        if self.authenticated {
            return Err(StepError::Eof);
        }
        if let Some(child) = &self.child {
            return child.apply(ctx, input).await;
        }
        let Some(input) = input else {
            return Err(StepError::NoChange);
        };
        let payload: AuthenticationInput = input.decode()?;
        if !self.offered(ctx)?.contains(&payload.authentication) {
            return Err(StepError::InvalidInput(format!(
                "authentication `{}` is not offered",
                payload.authentication
            )));
        }

        match payload.authentication {
            AuthenticationKind::PrimaryPassword => {
                let (login_id, _) = identified(ctx)?;
                let user_id = ctx.require_fact(FACT_USER_ID)?;
                ctx.deps.check_rate(&login_id, RateLimitAction::Password)?;
                let password = payload.password.as_deref().unwrap_or_default();
                if !ctx.deps.users.verify_password(user_id, password).await? {
                    return Err(DomainError::InvalidCredentials.into());
                }
                let outcome = AuthenticateOutcome::Authenticated {
                    authentication: payload.authentication,
                };
                Ok(Reaction::new(KIND, json!(outcome)).with_event(FlowEvent::new(
                    "user.authenticated",
                    json!({ "user_id": user_id, "authentication": payload.authentication }),
                )))
            }
            authentication => {
                let outcome = AuthenticateOutcome::Selected { authentication };
                Ok(Reaction::new(KIND, json!(outcome)))
            }
        }
    }

    fn absorb(&mut self, ctx: &StepContext<'_>, node: &Node) -> Result<(), StepError> {
        if let Some(child) = self.child.as_mut() {
            child.absorb(ctx, node)?;
            if matches!(child.pending(ctx)?, Pending::Finished) {
                self.authenticated = true;
            }
            return Ok(());
        }
        match node.outcome_as(KIND)? {
            AuthenticateOutcome::Authenticated { .. } => self.authenticated = true,
            AuthenticateOutcome::Selected { .. } => {
                self.child = Some(ctx.registry.instantiate_intent(&Self::verify_spec())?);
            }
        }
        Ok(())
    }
}
