//! Inputs and the nodes they turn into.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::Value;

use super::error::StepError;
use super::intent::{Facts, Reaction};

/// Typed payload of one input kind.
///
/// Registering a payload with [`super::Registry::register_input`] makes its
/// `KIND` instantiable from client JSON; `data` must deserialize into `Self`
/// and pass [`InputPayload::validate`].
pub trait InputPayload: Serialize + DeserializeOwned {
    const KIND: &'static str;

    /// # Errors
    /// Returns a message when the payload is structurally valid but unusable.
    fn validate(&self) -> Result<(), String> {
        Ok(())
    }

    /// The form stored in the node log. Secrets must not survive this.
    fn redacted(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// A validated client input.
#[derive(Clone, Debug, PartialEq)]
pub struct Input {
    kind: String,
    data: Value,
    recorded: Value,
}

impl Input {
    pub(crate) fn new(kind: String, data: Value, recorded: Value) -> Self {
        Self {
            kind,
            data,
            recorded,
        }
    }

    #[must_use]
    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// Decode into the payload type registered for this kind.
    ///
    /// # Errors
    /// Returns [`StepError::NoChange`] when the input is of another kind.
    pub fn decode<T: InputPayload>(&self) -> Result<T, StepError> {
        if self.kind != T::KIND {
            return Err(StepError::NoChange);
        }
        serde_json::from_value(self.data.clone())
            .map_err(|err| StepError::InvalidInput(format!("{}: {err}", T::KIND)))
    }

    #[must_use]
    pub fn recorded(&self) -> RecordedInput {
        RecordedInput {
            kind: self.kind.clone(),
            data: self.recorded.clone(),
        }
    }
}

/// Input as kept in the log: kind plus redacted data.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RecordedInput {
    pub kind: String,
    #[serde(default)]
    pub data: Value,
}

/// Descriptor of something that happened while applying an input.
/// Emitted by the service after the node is committed, never during replay.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FlowEvent {
    pub name: String,
    #[serde(default)]
    pub payload: Value,
}

impl FlowEvent {
    #[must_use]
    pub fn new(name: &str, payload: Value) -> Self {
        Self {
            name: name.to_string(),
            payload,
        }
    }
}

/// One committed point of a workflow.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Node {
    /// Kind of the step that produced the node.
    pub step: String,
    /// `None` for automatic steps.
    pub input: Option<RecordedInput>,
    /// Step-private result, read back by the step on replay.
    #[serde(default)]
    pub outcome: Value,
    /// Facts published to later steps.
    #[serde(default)]
    pub facts: Facts,
    #[serde(default)]
    pub events: Vec<FlowEvent>,
    pub created_at: DateTime<Utc>,
}

impl Node {
    #[must_use]
    pub fn from_reaction(reaction: Reaction, input: Option<&Input>) -> Self {
        Self {
            step: reaction.step,
            input: input.map(Input::recorded),
            outcome: reaction.outcome,
            facts: reaction.facts,
            events: reaction.events,
            created_at: Utc::now(),
        }
    }

    /// Decode the outcome written by `step`.
    ///
    /// # Errors
    /// Returns an internal error if the node belongs to another step or the
    /// outcome does not match `T`.
    pub fn outcome_as<T: DeserializeOwned>(&self, step: &str) -> Result<T, StepError> {
        if self.step != step {
            return Err(StepError::Internal(anyhow::anyhow!(
                "node of step `{}` replayed into `{step}`",
                self.step
            )));
        }
        serde_json::from_value(self.outcome.clone()).map_err(|err| {
            StepError::Internal(anyhow::anyhow!("corrupt `{step}` outcome: {err}"))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Serialize, Deserialize)]
    struct Secret {
        value: String,
    }

    impl InputPayload for Secret {
        const KIND: &'static str = "secret";

        fn redacted(&self) -> Value {
            json!({ "value": "[redacted]" })
        }
    }

    #[test]
    fn decode_rejects_other_kinds() {
        let input = Input::new("other".to_string(), json!({}), json!({}));
        assert!(matches!(input.decode::<Secret>(), Err(StepError::NoChange)));
    }

    #[test]
    fn recorded_input_uses_redacted_data() -> anyhow::Result<()> {
        let secret = Secret {
            value: "hunter2".to_string(),
        };
        let input = Input::new(
            Secret::KIND.to_string(),
            serde_json::to_value(&secret)?,
            secret.redacted(),
        );
        let decoded: Secret = input.decode().map_err(|err| anyhow::anyhow!("{err}"))?;
        assert_eq!(decoded.value, "hunter2");
        assert_eq!(input.recorded().data, json!({ "value": "[redacted]" }));
        Ok(())
    }

    #[test]
    fn outcome_as_checks_step() {
        let node = Node {
            step: "identify".to_string(),
            input: None,
            outcome: json!({}),
            facts: Facts::new(),
            events: vec![],
            created_at: Utc::now(),
        };
        assert!(node.outcome_as::<Value>("verify").is_err());
        assert!(node.outcome_as::<Value>("identify").is_ok());
    }
}
