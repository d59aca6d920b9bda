//! Collects the login id and checks whether its user exists.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use super::inputs::IdentificationInput;
use super::{FACT_LOGIN_ID, FACT_LOGIN_ID_TYPE, FACT_USER_ID};
use crate::authflow::deps::LoginIdType;
use crate::authflow::error::{DomainError, StepError};
use crate::authflow::intent::{Action, Intent, Pending, Reaction, StepContext};
use crate::authflow::node::{Input, InputPayload, Node};
use crate::authflow::registry::{RegistryError, decode_params};

pub(super) const KIND: &str = "identify";

/// Whether the flow needs the identified user to exist.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
enum UserRequirement {
    /// Signup: the login id must be free.
    Absent,
    /// Login and recovery: the login id must belong to a user.
    Present,
    #[default]
    Any,
}

#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct IdentifyParams {
    identification: Vec<LoginIdType>,
    user: UserRequirement,
}

impl Default for IdentifyParams {
    fn default() -> Self {
        Self {
            identification: vec![LoginIdType::Email, LoginIdType::Phone],
            user: UserRequirement::Any,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
struct Identified {
    login_id: String,
    login_id_type: LoginIdType,
    #[serde(default)]
    user_id: Option<String>,
}

#[derive(Debug)]
pub struct Identify {
    params: IdentifyParams,
    identified: Option<Identified>,
}

impl Identify {
    /// # Errors
    /// Returns an error if `data` is not valid `identify` parameters.
    pub fn from_params(data: &Value) -> Result<Box<dyn Intent>, RegistryError> {
        let params: IdentifyParams = decode_params(KIND, data)?;
        if params.identification.is_empty() {
            return Err(RegistryError::InvalidData {
                kind: KIND.to_string(),
                message: "no identification methods".to_string(),
            });
        }
        Ok(Box::new(Self {
            params,
            identified: None,
        }))
    }
}

#[async_trait]
impl Intent for Identify {
    fn kind(&self) -> &str {
        KIND
    }

    fn pending(&self, _ctx: &StepContext<'_>) -> Result<Pending, StepError> {
        if self.identified.is_some() {
            return Ok(Pending::Finished);
        }
        let options: Vec<Value> = self
            .params
            .identification
            .iter()
            .map(|method| json!({ "identification": method }))
            .collect();
        Ok(Pending::Input(Action::new(
            KIND,
            &[IdentificationInput::KIND],
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
        let payload: IdentificationInput = input.decode()?;
        if !self.params.identification.contains(&payload.identification) {
            return Err(StepError::InvalidInput(format!(
                "identification `{}` is not offered",
                payload.identification
            )));
        }

        let login_id = payload.normalized_login_id();
        let user = ctx.deps.users.find_by_login_id(&login_id).await?;
        match (self.params.user, &user) {
            (UserRequirement::Absent, Some(_)) => return Err(DomainError::UserExists.into()),
            (UserRequirement::Present, None) => return Err(DomainError::UserNotFound.into()),
            _ => {}
        }

        let identified = Identified {
            login_id: login_id.clone(),
            login_id_type: payload.identification,
            user_id: user.map(|user| user.id),
        };
        let mut reaction = Reaction::new(KIND, json!(identified))
            .with_fact(FACT_LOGIN_ID, json!(login_id))
            .with_fact(FACT_LOGIN_ID_TYPE, json!(payload.identification));
        if let Some(user_id) = &identified.user_id {
            reaction = reaction.with_fact(FACT_USER_ID, json!(user_id));
        }
        Ok(reaction)
    }

    fn absorb(&mut self, _ctx: &StepContext<'_>, node: &Node) -> Result<(), StepError> {
        self.identified = Some(node.outcome_as(KIND)?);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authflow::steps::testing::Harness;

    fn intent(data: Value) -> anyhow::Result<Box<dyn Intent>> {
        Ok(Identify::from_params(&data)?)
    }

    #[tokio::test]
    async fn publishes_login_id_facts() -> anyhow::Result<()> {
        let harness = Harness::new()?;
        let identify = intent(json!({"user": "absent"}))?;
        let input = harness.input(
            "identification",
            json!({"identification": "email", "login_id": "A@Example.com"}),
        )?;
        let reaction = identify.apply(&harness.ctx(), Some(&input)).await?;
        assert_eq!(reaction.facts[FACT_LOGIN_ID], "a@example.com");
        assert_eq!(reaction.facts[FACT_LOGIN_ID_TYPE], "email");
        assert!(!reaction.facts.contains_key(FACT_USER_ID));
        Ok(())
    }

    #[tokio::test]
    async fn enforces_user_requirement() -> anyhow::Result<()> {
        let harness = Harness::new()?;
        let user = harness
            .deps
            .users
            .create_user("a@example.com", LoginIdType::Email, None)
            .await?;
        let input = harness.input(
            "identification",
            json!({"identification": "email", "login_id": "a@example.com"}),
        )?;

        let signup = intent(json!({"user": "absent"}))?;
        assert!(matches!(
            signup.apply(&harness.ctx(), Some(&input)).await,
            Err(StepError::Domain(DomainError::UserExists))
        ));

        let login = intent(json!({"user": "present"}))?;
        let reaction = login.apply(&harness.ctx(), Some(&input)).await?;
        assert_eq!(reaction.facts[FACT_USER_ID], json!(user.id));

        let other = harness.input(
            "identification",
            json!({"identification": "email", "login_id": "b@example.com"}),
        )?;
        assert!(matches!(
            login.apply(&harness.ctx(), Some(&other)).await,
            Err(StepError::Domain(DomainError::UserNotFound))
        ));
        Ok(())
    }

    #[tokio::test]
    async fn rejects_methods_not_offered() -> anyhow::Result<()> {
        let harness = Harness::new()?;
        let identify = intent(json!({"identification": ["email"]}))?;
        let input = harness.input(
            "identification",
            json!({"identification": "phone", "login_id": "+15550109999"}),
        )?;
        assert!(matches!(
            identify.apply(&harness.ctx(), Some(&input)).await,
            Err(StepError::InvalidInput(_))
        ));
        assert!(intent(json!({"identification": []})).is_err());
        Ok(())
    }
}
