//! Creates the user with its first authenticator.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use super::inputs::NewAuthenticatorInput;
use super::{AuthenticationKind, FACT_USER_ID, claim_verified, identified};
use crate::authflow::error::StepError;
use crate::authflow::intent::{Action, Intent, Pending, Reaction, StepContext};
use crate::authflow::node::{FlowEvent, Input, InputPayload, Node};
use crate::authflow::registry::{RegistryError, decode_params};

pub(super) const KIND: &str = "create_authenticator";

#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct CreateAuthenticatorParams {
    authentication: Vec<AuthenticationKind>,
}

impl Default for CreateAuthenticatorParams {
    fn default() -> Self {
        Self {
            authentication: vec![AuthenticationKind::PrimaryPassword],
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
struct Created {
    user_id: String,
    authentication: AuthenticationKind,
}

#[derive(Debug)]
pub struct CreateAuthenticator {
    params: CreateAuthenticatorParams,
    created: Option<Created>,
}

impl CreateAuthenticator {
    /// # Errors
    /// Returns an error if `data` is not valid parameters.
    pub fn from_params(data: &Value) -> Result<Box<dyn Intent>, RegistryError> {
        Ok(Box::new(Self {
            params: decode_params(KIND, data)?,
            created: None,
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
            .filter(|kind| *kind == AuthenticationKind::PrimaryPassword || claim_verified(ctx))
            .collect())
    }
}

#[async_trait]
impl Intent for CreateAuthenticator {
    fn kind(&self) -> &str {
        KIND
    }

    fn pending(&self, ctx: &StepContext<'_>) -> Result<Pending, StepError> {
        if self.created.is_some() {
            return Ok(Pending::Finished);
        }
        let min_length = ctx.deps.password_policy.min_length;
        let options: Vec<Value> = self
            .offered(ctx)?
            .into_iter()
            .map(|kind| match kind {
                AuthenticationKind::PrimaryPassword => json!({
                    "authentication": kind,
                    "password_policy": { "min_length": min_length },
                }),
                _ => json!({ "authentication": kind }),
            })
            .collect();
        Ok(Pending::Input(Action::new(
            KIND,
            &[NewAuthenticatorInput::KIND],
            json!({ "options": options }),
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
        let payload: NewAuthenticatorInput = input.decode()?;
        if !self.offered(ctx)?.contains(&payload.authentication) {
            return Err(StepError::InvalidInput(format!(
                "authentication `{}` is not offered",
                payload.authentication
            )));
        }
        let password = match payload.authentication {
            AuthenticationKind::PrimaryPassword => {
                let password = payload.new_password.as_deref().unwrap_or_default();
                ctx.deps.password_policy.check(password)?;
                Some(password)
            }
            _ => None,
        };

        let (login_id, login_id_type) = identified(ctx)?;
        let user = ctx
            .deps
            .users
            .create_user(&login_id, login_id_type, password)
            .await?;

        let created = Created {
            user_id: user.id.clone(),
            authentication: payload.authentication,
        };
        Ok(Reaction::new(KIND, json!(created))
            .with_fact(FACT_USER_ID, json!(user.id))
            .with_event(FlowEvent::new(
                "user.created",
                json!({
                    "user_id": user.id,
                    "login_id_type": login_id_type,
                    "authentication": payload.authentication,
                }),
            )))
    }

    fn absorb(&mut self, _ctx: &StepContext<'_>, node: &Node) -> Result<(), StepError> {
        self.created = Some(node.outcome_as(KIND)?);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authflow::deps::PasswordPolicy;
    use crate::authflow::error::DomainError;
    use crate::authflow::steps::FACT_CLAIM_VERIFIED;
    use crate::authflow::steps::testing::Harness;

    #[tokio::test]
    async fn creates_user_with_password() -> anyhow::Result<()> {
        let mut harness = Harness::new()?;
        harness.identified_as("a@example.com", "email");
        let create = CreateAuthenticator::from_params(&Value::Null)?;

        let Pending::Input(action) = create.pending(&harness.ctx())? else {
            anyhow::bail!("expected input");
        };
        assert_eq!(action.data["options"][0]["authentication"], "primary_password");

        let input = harness.input(
            "new_authenticator",
            json!({"authentication": "primary_password", "new_password": "pw"}),
        )?;
        let reaction = create.apply(&harness.ctx(), Some(&input)).await?;
        let user_id = reaction.facts[FACT_USER_ID].as_str().unwrap_or_default();
        assert!(harness.deps.users.verify_password(user_id, "pw").await?);
        assert_eq!(reaction.events[0].name, "user.created");
        Ok(())
    }

    #[tokio::test]
    async fn enforces_password_policy() -> anyhow::Result<()> {
        let mut harness = Harness::new()?;
        harness.deps = harness
            .deps
            .clone()
            .with_password_policy(PasswordPolicy { min_length: 8 });
        harness.identified_as("a@example.com", "email");
        let create = CreateAuthenticator::from_params(&Value::Null)?;
        let input = harness.input(
            "new_authenticator",
            json!({"authentication": "primary_password", "new_password": "pw"}),
        )?;
        assert!(matches!(
            create.apply(&harness.ctx(), Some(&input)).await,
            Err(StepError::Domain(DomainError::PasswordPolicy { min_length: 8 }))
        ));
        Ok(())
    }

    #[tokio::test]
    async fn passwordless_requires_verified_claim() -> anyhow::Result<()> {
        let mut harness = Harness::new()?;
        harness.identified_as("a@example.com", "email");
        let create = CreateAuthenticator::from_params(
            &json!({"authentication": ["primary_password", "primary_oob_otp_email"]}),
        )?;
        let input = harness.input(
            "new_authenticator",
            json!({"authentication": "primary_oob_otp_email"}),
        )?;
        assert!(matches!(
            create.apply(&harness.ctx(), Some(&input)).await,
            Err(StepError::InvalidInput(_))
        ));

        harness
            .facts
            .insert(FACT_CLAIM_VERIFIED.to_string(), json!(true));
        let reaction = create.apply(&harness.ctx(), Some(&input)).await?;
        assert!(reaction.facts.contains_key(FACT_USER_ID));
        Ok(())
    }
}
