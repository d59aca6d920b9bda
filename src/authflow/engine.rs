//! Replay and advance a workflow.
//!
//! The engine never reads or writes the store. [`Engine::replay`] folds a
//! [`History`] into a [`ReplayState`]; [`Engine::apply`] validates one input
//! against that state and returns the node to append. Appending, notifying
//! and emitting events are the caller's job, so replaying the same history
//! any number of times has no effect outside the process.

use tracing::{debug, instrument};

use super::config::FlowReference;
use super::deps::Dependencies;
use super::error::{FlowError, StepError};
use super::intent::{Facts, Intent, Pending, StepContext};
use super::node::{Input, Node};
use super::registry::{IntentSpec, Registry};
use super::session::SessionOptions;
use super::store::History;

/// A workflow rebuilt from its history.
#[derive(Debug)]
pub struct ReplayState {
    pub root: Box<dyn Intent>,
    pub facts: Facts,
    pub reference: FlowReference,
    pub session: SessionOptions,
}

/// Result of [`Engine::apply`].
#[derive(Debug, Clone, PartialEq)]
pub enum Advance {
    /// Append this node.
    Appended(Node),
    /// The flow is already finished; nothing to append.
    Finished,
}

#[derive(Clone, Copy, Debug)]
pub struct Engine<'a> {
    registry: &'a Registry,
    deps: &'a Dependencies,
}

fn step_error(err: StepError, pending: &Pending, kind: Option<&str>) -> FlowError {
    match err {
        StepError::Eof => FlowError::Internal(anyhow::anyhow!("unexpected end of flow")),
        StepError::NoChange => invalid_kind(pending, kind),
        StepError::InvalidInput(message) => FlowError::InvalidInput(message),
        StepError::Domain(err) => FlowError::Domain(err),
        StepError::Registry(err) => FlowError::Internal(anyhow::Error::new(err)),
        StepError::Internal(err) => FlowError::Internal(err),
    }
}

fn invalid_kind(pending: &Pending, kind: Option<&str>) -> FlowError {
    let expected = match pending {
        Pending::Input(action) => action.accepts.clone(),
        Pending::Auto { .. } | Pending::Finished => Vec::new(),
    };
    FlowError::InvalidInputKind {
        got: kind.unwrap_or_default().to_string(),
        expected,
    }
}

/// Errors while folding stored nodes mean the log and the code disagree.
fn replay_error(err: StepError) -> FlowError {
    match err {
        StepError::Internal(err) => FlowError::Internal(err.context("replay failed")),
        other => FlowError::Internal(anyhow::anyhow!("replay failed: {other}")),
    }
}

impl<'a> Engine<'a> {
    #[must_use]
    pub fn new(registry: &'a Registry, deps: &'a Dependencies) -> Self {
        Self { registry, deps }
    }

    #[must_use]
    pub fn registry(&self) -> &'a Registry {
        self.registry
    }

    fn ctx<'s>(&self, state: &'s ReplayState) -> StepContext<'s>
    where
        'a: 's,
    {
        StepContext {
            registry: self.registry,
            deps: self.deps,
            reference: &state.reference,
            session: &state.session,
            facts: &state.facts,
        }
    }

    /// State of a workflow with no nodes yet.
    ///
    /// # Errors
    /// Returns an error if the stored root spec is unknown or invalid.
    pub fn start(
        &self,
        root: &IntentSpec,
        reference: &FlowReference,
        session: &SessionOptions,
    ) -> Result<ReplayState, FlowError> {
        let root = self
            .registry
            .instantiate_intent(root)
            .map_err(|err| FlowError::Internal(anyhow::Error::new(err)))?;
        Ok(ReplayState {
            root,
            facts: Facts::new(),
            reference: reference.clone(),
            session: session.clone(),
        })
    }

    /// Fold every node of `history` into a fresh root intent.
    ///
    /// # Errors
    /// Returns an internal error if a node cannot be replayed.
    #[instrument(skip_all, fields(workflow_id = %history.workflow_id, nodes = history.nodes.len()))]
    pub fn replay(&self, history: &History) -> Result<ReplayState, FlowError> {
        let mut state = self.start(&history.root, &history.reference, &history.session)?;
        for node in &history.nodes {
            self.fold(&mut state, node)?;
        }
        Ok(state)
    }

    /// Fold one committed node: publish its facts, then let the root absorb it.
    ///
    /// # Errors
    /// Returns an internal error if the node does not fit the current state.
    pub fn fold(&self, state: &mut ReplayState, node: &Node) -> Result<(), FlowError> {
        state
            .facts
            .extend(node.facts.iter().map(|(key, value)| (key.clone(), value.clone())));
        let ReplayState {
            root,
            facts,
            reference,
            session,
        } = state;
        let ctx = StepContext {
            registry: self.registry,
            deps: self.deps,
            reference,
            session,
            facts,
        };
        root.absorb(&ctx, node).map_err(replay_error)
    }

    /// # Errors
    /// Returns an internal error if the pending state cannot be computed.
    pub fn pending(&self, state: &ReplayState) -> Result<Pending, FlowError> {
        state
            .root
            .pending(&self.ctx(state))
            .map_err(replay_error)
    }

    /// Validate `input` against the pending state and apply it.
    ///
    /// `None` runs an automatic step. An input whose kind is not offered, or
    /// that the step ignores, fails with [`FlowError::InvalidInputKind`].
    ///
    /// # Errors
    /// Returns protocol, domain and internal errors; never `Eof`.
    pub async fn apply(
        &self,
        state: &ReplayState,
        input: Option<&Input>,
    ) -> Result<Advance, FlowError> {
        let pending = self.pending(state)?;
        let kind = input.map(Input::kind);
        match (&pending, input) {
            (Pending::Finished, _) => return Ok(Advance::Finished),
            (Pending::Input(action), Some(input)) if action.accepts(input.kind()) => {}
            (Pending::Auto { .. }, None) => {}
            _ => return Err(invalid_kind(&pending, kind)),
        }

        let ctx = self.ctx(state);
        match state.root.apply(&ctx, input).await {
            Ok(reaction) => {
                debug!(step = %reaction.step, "input applied");
                Ok(Advance::Appended(Node::from_reaction(reaction, input)))
            }
            Err(StepError::Eof) => Ok(Advance::Finished),
            Err(err) => Err(step_error(err, &pending, kind)),
        }
    }
}
