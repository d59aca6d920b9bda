//! The capability set every step implements.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

use super::config::FlowReference;
use super::deps::Dependencies;
use super::error::StepError;
use super::node::{FlowEvent, Input, Node};
use super::registry::Registry;
use super::session::SessionOptions;

/// Values published by earlier steps (`login_id`, `user_id`, ...).
pub type Facts = Map<String, Value>;

/// What the client has to send next.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Action {
    #[serde(rename = "type")]
    pub step: String,
    pub accepts: Vec<String>,
    #[serde(default)]
    pub data: Value,
}

impl Action {
    #[must_use]
    pub fn new(step: &str, accepts: &[&str], data: Value) -> Self {
        Self {
            step: step.to_string(),
            accepts: accepts.iter().map(ToString::to_string).collect(),
            data,
        }
    }

    #[must_use]
    pub fn accepts(&self, kind: &str) -> bool {
        self.accepts.iter().any(|accepted| accepted == kind)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Pending {
    /// Waiting for one of the input kinds in the action.
    Input(Action),
    /// The step advances on its own (for example by sending a code).
    Auto { step: String },
    Finished,
}

/// Result of applying an input, turned into a [`Node`] by the engine.
#[derive(Clone, Debug, PartialEq)]
pub struct Reaction {
    pub step: String,
    pub outcome: Value,
    pub facts: Facts,
    pub events: Vec<FlowEvent>,
}

impl Reaction {
    #[must_use]
    pub fn new(step: &str, outcome: Value) -> Self {
        Self {
            step: step.to_string(),
            outcome,
            facts: Facts::new(),
            events: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_fact(mut self, key: &str, value: Value) -> Self {
        self.facts.insert(key.to_string(), value);
        self
    }

    #[must_use]
    pub fn with_event(mut self, event: FlowEvent) -> Self {
        self.events.push(event);
        self
    }
}

/// Everything a step may look at. Built by the engine for each call.
pub struct StepContext<'a> {
    pub registry: &'a Registry,
    pub deps: &'a Dependencies,
    pub reference: &'a FlowReference,
    pub session: &'a SessionOptions,
    pub facts: &'a Facts,
}

impl StepContext<'_> {
    #[must_use]
    pub fn fact_str(&self, key: &str) -> Option<&str> {
        self.facts.get(key).and_then(Value::as_str)
    }

    /// # Errors
    /// Returns an internal error when an earlier step did not publish `key`.
    pub fn require_fact(&self, key: &str) -> Result<&str, StepError> {
        self.fact_str(key)
            .ok_or_else(|| StepError::Internal(anyhow::anyhow!("missing fact `{key}`")))
    }
}

/// A step definition.
///
/// `pending` and `absorb` must be pure: they run on every replay. Side
/// effects belong in `apply`, which only runs for new input.
#[async_trait]
pub trait Intent: Send + Sync + fmt::Debug {
    fn kind(&self) -> &str;

    /// # Errors
    /// Returns an error if a nested intent cannot be instantiated.
    fn pending(&self, ctx: &StepContext<'_>) -> Result<Pending, StepError>;

    /// Apply `input` (or `None` for an automatic step).
    ///
    /// # Errors
    /// Domain errors are shown to the client; `Eof` means nothing to append.
    async fn apply(
        &self,
        ctx: &StepContext<'_>,
        input: Option<&Input>,
    ) -> Result<Reaction, StepError>;

    /// Fold a committed node into this intent.
    ///
    /// # Errors
    /// Returns an error if the node does not belong to this intent.
    fn absorb(&mut self, ctx: &StepContext<'_>, node: &Node) -> Result<(), StepError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn action_serializes_step_as_type() -> anyhow::Result<()> {
        let action = Action::new("verify", &["verification_code"], json!({"channel": "email"}));
        let value = serde_json::to_value(&action)?;
        assert_eq!(value["type"], "verify");
        assert_eq!(value["accepts"], json!(["verification_code"]));
        assert!(action.accepts("verification_code"));
        assert!(!action.accepts("resend_code"));
        Ok(())
    }

    #[test]
    fn reaction_collects_facts_and_events() {
        let reaction = Reaction::new("identify", json!({}))
            .with_fact("login_id", json!("a@example.com"))
            .with_event(FlowEvent::new("authflow.identified", json!({})));
        assert_eq!(reaction.facts["login_id"], "a@example.com");
        assert_eq!(reaction.events.len(), 1);
    }
}
