//! Declarative flow definitions.
//!
//! A flow is identified by `{type, name}` and is an ordered list of step
//! specs. Branching lives inside steps (for example `authenticate` choosing
//! between a password and a one-time code). Definitions are copied into each
//! workflow at creation, so editing the configuration never changes the replay
//! of a flow that is already running.

use serde::{Deserialize, Serialize};
use serde_json::json;
use std::fmt;
use std::str::FromStr;

use super::registry::{IntentSpec, Registry, RegistryError};

pub const DEFAULT_FLOW_NAME: &str = "default";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowType {
    Signup,
    Login,
    AccountRecovery,
}

impl FlowType {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Signup => "signup",
            Self::Login => "login",
            Self::AccountRecovery => "account_recovery",
        }
    }
}

impl fmt::Display for FlowType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FlowType {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "signup" => Ok(Self::Signup),
            "login" => Ok(Self::Login),
            "account_recovery" => Ok(Self::AccountRecovery),
            other => Err(format!("unknown flow type: {other}")),
        }
    }
}

/// Which flow graph to instantiate.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FlowReference {
    #[serde(rename = "type")]
    pub flow_type: FlowType,
    pub name: String,
}

impl FlowReference {
    #[must_use]
    pub fn new(flow_type: FlowType, name: &str) -> Self {
        Self {
            flow_type,
            name: name.to_string(),
        }
    }
}

impl fmt::Display for FlowReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.flow_type, self.name)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FlowDefinition {
    #[serde(rename = "type")]
    pub flow_type: FlowType,
    pub name: String,
    pub steps: Vec<IntentSpec>,
}

impl FlowDefinition {
    #[must_use]
    pub fn reference(&self) -> FlowReference {
        FlowReference::new(self.flow_type, &self.name)
    }

    /// Spec of the root intent stored with every workflow of this flow.
    #[must_use]
    pub fn root_spec(&self) -> IntentSpec {
        IntentSpec::new(
            self.flow_type.as_str(),
            json!({ "name": self.name, "steps": self.steps }),
        )
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FlowConfig {
    pub flows: Vec<FlowDefinition>,
}

impl FlowConfig {
    /// # Errors
    /// Returns an error if `json` is not a valid flow configuration.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    #[must_use]
    pub fn find(&self, reference: &FlowReference) -> Option<&FlowDefinition> {
        self.flows
            .iter()
            .find(|flow| flow.flow_type == reference.flow_type && flow.name == reference.name)
    }

    /// Check every definition against the registry by instantiating it.
    ///
    /// # Errors
    /// Returns the first step that is unknown or carries invalid data.
    pub fn validate(&self, registry: &Registry) -> Result<(), RegistryError> {
        for flow in &self.flows {
            registry.instantiate_public_intent(&flow.root_spec())?;
            for step in &flow.steps {
                registry.instantiate_intent(step)?;
            }
        }
        Ok(())
    }
}

impl Default for FlowConfig {
    fn default() -> Self {
        let identify = |user: &str| {
            IntentSpec::new(
                "identify",
                json!({ "identification": ["email", "phone"], "user": user }),
            )
        };

        Self {
            flows: vec![
                FlowDefinition {
                    flow_type: FlowType::Signup,
                    name: DEFAULT_FLOW_NAME.to_string(),
                    steps: vec![
                        identify("absent"),
                        IntentSpec::new("verify", json!({ "purpose": "signup" })),
                        IntentSpec::new(
                            "create_authenticator",
                            json!({ "authentication": ["primary_password"] }),
                        ),
                    ],
                },
                FlowDefinition {
                    flow_type: FlowType::Login,
                    name: DEFAULT_FLOW_NAME.to_string(),
                    steps: vec![
                        identify("present"),
                        IntentSpec::new(
                            "authenticate",
                            json!({
                                "authentication": [
                                    "primary_password",
                                    "primary_oob_otp_email",
                                    "primary_oob_otp_sms"
                                ]
                            }),
                        ),
                    ],
                },
                FlowDefinition {
                    flow_type: FlowType::AccountRecovery,
                    name: DEFAULT_FLOW_NAME.to_string(),
                    steps: vec![
                        identify("present"),
                        IntentSpec::new("verify", json!({ "purpose": "account_recovery" })),
                        IntentSpec::new("reset_password", json!({})),
                    ],
                },
            ],
        }
    }
}
