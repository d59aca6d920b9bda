//! Root intent of every flow: walks its step list in order.
//!
//! Children are instantiated through the registry from the step specs stored
//! with the workflow, so a running flow keeps the graph it was created with.
//! A child that reports `Finished` hands over to the next one; the flow is
//! finished when the last child is.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;

use crate::authflow::config::FlowType;
use crate::authflow::error::StepError;
use crate::authflow::intent::{Intent, Pending, Reaction, StepContext};
use crate::authflow::node::{Input, Node};
use crate::authflow::registry::{IntentSpec, RegistryError, decode_params};

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FlowParams {
    #[serde(default)]
    name: String,
    steps: Vec<IntentSpec>,
}

#[derive(Debug)]
pub struct FlowIntent {
    flow_type: FlowType,
    name: String,
    steps: Vec<IntentSpec>,
    cursor: usize,
    current: Option<Box<dyn Intent>>,
}

/// The child that should receive the next input.
enum Active<'a> {
    Existing(&'a dyn Intent),
    Fresh(Box<dyn Intent>),
}

impl Active<'_> {
    fn intent(&self) -> &dyn Intent {
        match self {
            Self::Existing(intent) => *intent,
            Self::Fresh(intent) => intent.as_ref(),
        }
    }
}

fn is_finished(pending: &Pending) -> bool {
    matches!(pending, Pending::Finished)
}

impl FlowIntent {
    /// # Errors
    /// Returns [`RegistryError::InvalidData`] for malformed or empty step lists.
    pub fn from_params(flow_type: FlowType, data: &Value) -> Result<Box<dyn Intent>, RegistryError> {
        let params: FlowParams = decode_params(flow_type.as_str(), data)?;
        if params.steps.is_empty() {
            return Err(RegistryError::InvalidData {
                kind: flow_type.as_str().to_string(),
                message: "flow has no steps".to_string(),
            });
        }
        Ok(Box::new(Self {
            flow_type,
            name: params.name,
            steps: params.steps,
            cursor: 0,
            current: None,
        }))
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// First unfinished child at or after the cursor, without mutating.
    fn next_active(&self, ctx: &StepContext<'_>) -> Result<Option<Active<'_>>, StepError> {
        let mut cursor = self.cursor;
        if let Some(current) = &self.current {
            if !is_finished(&current.pending(ctx)?) {
                return Ok(Some(Active::Existing(current.as_ref())));
            }
            cursor += 1;
        }
        while let Some(spec) = self.steps.get(cursor) {
            let child = ctx.registry.instantiate_intent(spec)?;
            if !is_finished(&child.pending(ctx)?) {
                return Ok(Some(Active::Fresh(child)));
            }
            cursor += 1;
        }
        Ok(None)
    }

    /// Same walk as [`Self::next_active`], keeping the child.
    fn advance(&mut self, ctx: &StepContext<'_>) -> Result<(), StepError> {
        while self.current.is_none() {
            let Some(spec) = self.steps.get(self.cursor) else {
                return Ok(());
            };
            let child = ctx.registry.instantiate_intent(spec)?;
            if is_finished(&child.pending(ctx)?) {
                self.cursor += 1;
            } else {
                self.current = Some(child);
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Intent for FlowIntent {
    fn kind(&self) -> &str {
        self.flow_type.as_str()
    }

    fn pending(&self, ctx: &StepContext<'_>) -> Result<Pending, StepError> {
        match self.next_active(ctx)? {
            Some(active) => active.intent().pending(ctx),
            None => Ok(Pending::Finished),
        }
    }

    async fn apply(
        &self,
        ctx: &StepContext<'_>,
        input: Option<&Input>,
    ) -> Result<Reaction, StepError> {
        match self.next_active(ctx)? {
            Some(active) => active.intent().apply(ctx, input).await,
            None => Err(StepError::Eof),
        }
    }

    fn absorb(&mut self, ctx: &StepContext<'_>, node: &Node) -> Result<(), StepError> {
        self.advance(ctx)?;
        let Some(current) = self.current.as_mut() else {
            return Err(StepError::Internal(anyhow::anyhow!(
                "node `{}` replayed into finished {} flow",
                node.step,
                self.flow_type
            )));
        };
        current.absorb(ctx, node)?;
        if is_finished(&current.pending(ctx)?) {
            self.current = None;
            self.cursor += 1;
            self.advance(ctx)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authflow::steps::testing::Harness;
    use serde_json::json;

    #[test]
    fn empty_flows_are_rejected() {
        assert!(matches!(
            FlowIntent::from_params(FlowType::Signup, &json!({"name": "x", "steps": []})),
            Err(RegistryError::InvalidData { .. })
        ));
        assert!(FlowIntent::from_params(FlowType::Signup, &json!({"name": "x"})).is_err());
    }

    #[test]
    fn pending_delegates_to_first_step() -> anyhow::Result<()> {
        let harness = Harness::new()?;
        let flow = FlowIntent::from_params(
            FlowType::Signup,
            &json!({"name": "default", "steps": [{"kind": "identify", "data": {"user": "absent"}}]}),
        )?;
        assert_eq!(flow.kind(), "signup");
        match flow.pending(&harness.ctx())? {
            Pending::Input(action) => {
                assert_eq!(action.step, "identify");
                assert!(action.accepts("identification"));
            }
            other => anyhow::bail!("unexpected pending state {other:?}"),
        }
        Ok(())
    }

    #[tokio::test]
    async fn flow_finishes_after_last_step() -> anyhow::Result<()> {
        let mut harness = Harness::new()?;
        let mut flow = FlowIntent::from_params(
            FlowType::Signup,
            &json!({"name": "default", "steps": [{"kind": "identify", "data": {"user": "absent"}}]}),
        )?;
        let input = harness.input(
            "identification",
            json!({"identification": "email", "login_id": "a@example.com"}),
        )?;
        let reaction = flow.apply(&harness.ctx(), Some(&input)).await?;
        let node = Node::from_reaction(reaction, Some(&input));
        harness.facts.extend(node.facts.clone());
        flow.absorb(&harness.ctx(), &node)?;

        assert_eq!(flow.pending(&harness.ctx())?, Pending::Finished);
        assert!(matches!(
            flow.apply(&harness.ctx(), Some(&input)).await,
            Err(StepError::Eof)
        ));
        assert!(flow.absorb(&harness.ctx(), &node).is_err());
        Ok(())
    }
}
