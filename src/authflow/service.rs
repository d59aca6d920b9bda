//! Flow service façade.
//!
//! Every call is request scoped: read the history, replay it, apply at most
//! the given inputs, append, notify, answer. Nothing is cached between calls
//! and nothing retries; a stale `instance_id` fails with
//! [`FlowError::Conflict`].

use serde::Serialize;
use serde_json::{Value, json};
use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;
use tracing::{Span, debug, info, instrument, warn};
use ulid::Ulid;

use super::config::{FlowConfig, FlowReference};
use super::deps::Dependencies;
use super::engine::{Advance, Engine, ReplayState};
use super::error::FlowError;
use super::intent::{Action, Pending};
use super::node::{Input, InputPayload, Node};
use super::notify::{Notifier, Subscription};
use super::registry::{Registry, RegistryError};
use super::session::{Cookie, ResolvedSession, SessionOptions, SessionOptionsResolver, SessionRequest};
use super::steps::FACT_USER_ID;
use super::steps::inputs::ResendCodeInput;
use super::store::{History, InstanceStore, NewFlow, StoreError};

pub const DEFAULT_MAX_AUTO_STEPS: usize = 16;
pub const FINISHED_ACTION: &str = "finished";
/// The only input accepted while an automatic step is pending; it retries
/// the step.
pub const RETRY_INPUT_KIND: &str = ResendCodeInput::KIND;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FlowServiceConfig {
    max_auto_steps: usize,
    default_redirect_uri: String,
}

impl Default for FlowServiceConfig {
    fn default() -> Self {
        Self {
            max_auto_steps: DEFAULT_MAX_AUTO_STEPS,
            default_redirect_uri: String::new(),
        }
    }
}

impl FlowServiceConfig {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_max_auto_steps(mut self, steps: usize) -> Self {
        self.max_auto_steps = steps;
        self
    }

    /// Redirect target reported in the finished action when the session has none.
    #[must_use]
    pub fn with_default_redirect_uri(mut self, uri: &str) -> Self {
        self.default_redirect_uri = uri.to_string();
        self
    }

    #[must_use]
    pub fn max_auto_steps(&self) -> usize {
        self.max_auto_steps
    }

    #[must_use]
    pub fn default_redirect_uri(&self) -> &str {
        &self.default_redirect_uri
    }
}

/// What the client sees after every call.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ServiceOutput {
    pub workflow_id: String,
    pub instance_id: String,
    pub action: Action,
    /// Cookies to set on the response; never part of the body.
    #[serde(skip)]
    pub cookies: Vec<Cookie>,
    pub finished: bool,
}

/// A failed call. Errors the client can act on carry the state the flow is
/// still in.
#[derive(Debug, Error)]
#[error("{error}")]
pub struct ServiceError {
    pub error: FlowError,
    pub state: Option<Box<ServiceOutput>>,
}

impl ServiceError {
    fn with_state(error: FlowError, state: ServiceOutput) -> Self {
        let state = error.carries_state().then(|| Box::new(state));
        Self { error, state }
    }

    #[must_use]
    pub fn reason(&self) -> &'static str {
        self.error.reason()
    }
}

impl From<FlowError> for ServiceError {
    fn from(error: FlowError) -> Self {
        Self { error, state: None }
    }
}

impl From<StoreError> for ServiceError {
    fn from(err: StoreError) -> Self {
        FlowError::from(err).into()
    }
}

impl From<RegistryError> for ServiceError {
    fn from(err: RegistryError) -> Self {
        FlowError::from(err).into()
    }
}

/// Workflows with a mutating call running in this process.
#[derive(Debug, Default)]
struct InFlight(Mutex<HashSet<String>>);

impl InFlight {
    fn claim(&self, workflow_id: &str) -> Result<Claim<'_>, FlowError> {
        let mut ids = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        if !ids.insert(workflow_id.to_string()) {
            return Err(FlowError::Conflict);
        }
        Ok(Claim {
            in_flight: self,
            workflow_id: workflow_id.to_string(),
        })
    }
}

struct Claim<'a> {
    in_flight: &'a InFlight,
    workflow_id: String,
}

impl Drop for Claim<'_> {
    fn drop(&mut self) {
        self.in_flight
            .0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.workflow_id);
    }
}

/// Replayed workflow plus the instance it was replayed to.
struct Cursor {
    workflow_id: String,
    head: String,
    state: ReplayState,
}

pub struct FlowService {
    registry: Arc<Registry>,
    deps: Dependencies,
    store: Arc<dyn InstanceStore>,
    notifier: Arc<dyn Notifier>,
    flows: FlowConfig,
    resolver: SessionOptionsResolver,
    config: FlowServiceConfig,
    in_flight: InFlight,
}

impl std::fmt::Debug for FlowService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlowService")
            .field("registry", &self.registry)
            .field("store", &self.store.backend())
            .field("flows", &self.flows.flows.len())
            .field("resolver", &self.resolver)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

fn check_user_agent(session: &SessionOptions, user_agent: Option<&str>) -> Result<(), FlowError> {
    if session.user_agent_id.is_empty() || user_agent == Some(session.user_agent_id.as_str()) {
        Ok(())
    } else {
        Err(FlowError::NotFound)
    }
}

impl FlowService {
    /// # Errors
    /// Returns an error if a configured flow names an unknown or non-public
    /// root, or carries invalid step parameters.
    pub fn new(
        registry: Arc<Registry>,
        deps: Dependencies,
        store: Arc<dyn InstanceStore>,
        notifier: Arc<dyn Notifier>,
        flows: FlowConfig,
    ) -> Result<Self, RegistryError> {
        flows.validate(&registry)?;
        Ok(Self {
            registry,
            deps,
            store,
            notifier,
            flows,
            resolver: SessionOptionsResolver::default(),
            config: FlowServiceConfig::default(),
            in_flight: InFlight::default(),
        })
    }

    #[must_use]
    pub fn with_resolver(mut self, resolver: SessionOptionsResolver) -> Self {
        self.resolver = resolver;
        self
    }

    #[must_use]
    pub fn with_config(mut self, config: FlowServiceConfig) -> Self {
        self.config = config;
        self
    }

    #[must_use]
    pub fn store(&self) -> &Arc<dyn InstanceStore> {
        &self.store
    }

    #[must_use]
    pub fn flows(&self) -> &FlowConfig {
        &self.flows
    }

    fn engine(&self) -> Engine<'_> {
        Engine::new(&self.registry, &self.deps)
    }

    /// Resolve the session of a flow about to be created.
    ///
    /// # Errors
    /// Returns an internal error when the OAuth session backend fails.
    pub async fn resolve_session(
        &self,
        request: SessionRequest<'_>,
    ) -> Result<ResolvedSession, FlowError> {
        self.resolver
            .resolve(request)
            .await
            .map_err(FlowError::Internal)
    }

    /// Create a workflow for `reference` and run its automatic steps.
    ///
    /// # Errors
    /// Returns [`FlowError::UnknownFlow`] if no flow matches `reference`.
    #[instrument(skip(self, session), fields(flow = %reference, workflow_id = tracing::field::Empty))]
    pub async fn create_new_flow(
        &self,
        reference: &FlowReference,
        session: ResolvedSession,
    ) -> Result<ServiceOutput, ServiceError> {
        let definition = self
            .flows
            .find(reference)
            .ok_or_else(|| FlowError::UnknownFlow(reference.to_string()))?;
        let root = definition.root_spec();
        self.registry.instantiate_public_intent(&root)?;

        let workflow_id = Ulid::new().to_string();
        Span::current().record("workflow_id", workflow_id.as_str());

        let head = self
            .store
            .create(NewFlow {
                workflow_id: workflow_id.clone(),
                reference: reference.clone(),
                session: session.options.clone(),
                root: root.clone(),
            })
            .await?;
        let state = self.engine().start(&root, reference, &session.options)?;
        let mut cursor = Cursor {
            workflow_id,
            head,
            state,
        };
        info!("flow created");

        let result = self.run_automatic(&mut cursor).await;
        let mut output = self.settle(&cursor, result)?;
        output.cookies = session.cookies;
        Ok(output)
    }

    /// Create a workflow and feed `inputs` to it in order.
    ///
    /// Cookies from creation are attached to the result, including a failed
    /// batch's state.
    ///
    /// # Errors
    /// Same as [`Self::create_new_flow`] and [`Self::batch_input`].
    pub async fn create_with_batch(
        &self,
        reference: &FlowReference,
        session: ResolvedSession,
        inputs: &[Value],
    ) -> Result<ServiceOutput, ServiceError> {
        let user_agent = session.user_agent_id.clone();
        let created = self.create_new_flow(reference, session).await?;
        if inputs.is_empty() {
            return Ok(created);
        }
        match self
            .batch_input(
                &created.workflow_id,
                Some(&created.instance_id),
                inputs,
                Some(&user_agent),
            )
            .await
        {
            Ok(mut output) => {
                output.cookies = created.cookies;
                Ok(output)
            }
            Err(mut err) => {
                if let Some(state) = err.state.as_mut() {
                    state.cookies = created.cookies;
                }
                Err(err)
            }
        }
    }

    /// Feed one `{kind, data}` input.
    ///
    /// Without `instance_id` the current head is used. Any other instance
    /// than the head is stale and fails with [`FlowError::Conflict`] before
    /// a step runs.
    ///
    /// # Errors
    /// Protocol, flow state, conflict, domain and not-found errors.
    #[instrument(skip(self, input, user_agent), fields(workflow_id = %workflow_id))]
    pub async fn feed_input(
        &self,
        workflow_id: &str,
        instance_id: Option<&str>,
        input: &Value,
        user_agent: Option<&str>,
    ) -> Result<ServiceOutput, ServiceError> {
        let _claim = self.in_flight.claim(workflow_id)?;
        let mut cursor = self.load_head(workflow_id, instance_id, user_agent).await?;
        let input = self.registry.instantiate_input(input)?;

        let result = match self.engine().pending(&cursor.state)? {
            Pending::Auto { .. } if input.kind() == RETRY_INPUT_KIND => {
                self.run_automatic(&mut cursor).await
            }
            Pending::Auto { .. } => Err(FlowError::InvalidInputKind {
                got: input.kind().to_string(),
                expected: vec![RETRY_INPUT_KIND.to_string()],
            }),
            Pending::Input(_) | Pending::Finished => self.feed(&mut cursor, &input).await,
        };
        self.settle(&cursor, result)
    }

    /// Feed `inputs` one after the other.
    ///
    /// Stops at the first error, keeping what was appended before it, or as
    /// soon as the flow finishes.
    ///
    /// # Errors
    /// The error of the first failing input.
    pub async fn batch_input(
        &self,
        workflow_id: &str,
        instance_id: Option<&str>,
        inputs: &[Value],
        user_agent: Option<&str>,
    ) -> Result<ServiceOutput, ServiceError> {
        let Some((first, rest)) = inputs.split_first() else {
            return self.get(workflow_id, instance_id, user_agent).await;
        };
        let mut output = self
            .feed_input(workflow_id, instance_id, first, user_agent)
            .await?;
        for input in rest {
            if output.finished {
                break;
            }
            output = self
                .feed_input(workflow_id, Some(&output.instance_id), input, user_agent)
                .await?;
        }
        Ok(output)
    }

    /// Current state, without side effects.
    ///
    /// # Errors
    /// Returns [`FlowError::NotFound`] for unknown, expired or foreign flows.
    #[instrument(skip(self, user_agent), fields(workflow_id = %workflow_id))]
    pub async fn get(
        &self,
        workflow_id: &str,
        instance_id: Option<&str>,
        user_agent: Option<&str>,
    ) -> Result<ServiceOutput, ServiceError> {
        let cursor = self.load(workflow_id, instance_id, user_agent).await?;
        Ok(self.output(&cursor)?)
    }

    /// Wakeup signal for `workflow_id`.
    #[must_use]
    pub fn subscribe(&self, workflow_id: &str) -> Subscription {
        self.notifier.subscribe(workflow_id)
    }

    /// Replay up to `instance_id`, or the head when none is given.
    async fn load(
        &self,
        workflow_id: &str,
        instance_id: Option<&str>,
        user_agent: Option<&str>,
    ) -> Result<Cursor, FlowError> {
        let history: History = match instance_id.filter(|id| !id.is_empty()) {
            Some(instance_id) => self.store.read_at(workflow_id, instance_id).await?,
            None => self.store.read(workflow_id).await?,
        };
        check_user_agent(&history.session, user_agent)?;
        self.replay(&history)
    }

    /// Replay the head. `instance_id`, when given, must be that head.
    async fn load_head(
        &self,
        workflow_id: &str,
        instance_id: Option<&str>,
        user_agent: Option<&str>,
    ) -> Result<Cursor, FlowError> {
        let history = self.store.read(workflow_id).await?;
        check_user_agent(&history.session, user_agent)?;
        if let Some(instance_id) = instance_id.filter(|id| !id.is_empty()) {
            if instance_id != history.head() {
                let known = history.instance_ids.iter().any(|id| id == instance_id);
                debug!(instance_id, head = history.head(), known, "stale instance");
                return Err(if known {
                    FlowError::Conflict
                } else {
                    FlowError::NotFound
                });
            }
        }
        self.replay(&history)
    }

    fn replay(&self, history: &History) -> Result<Cursor, FlowError> {
        let state = self.engine().replay(history)?;
        Ok(Cursor {
            workflow_id: history.workflow_id.clone(),
            head: history.head().to_string(),
            state,
        })
    }

    async fn feed(&self, cursor: &mut Cursor, input: &Input) -> Result<(), FlowError> {
        let advance = self.engine().apply(&cursor.state, Some(input)).await;
        match self.moved_on(cursor, advance).await? {
            Advance::Finished => Ok(()),
            Advance::Appended(node) => {
                self.commit(cursor, &node).await?;
                self.run_automatic(cursor).await
            }
        }
    }

    /// Apply automatic steps until the flow waits for input or finishes.
    async fn run_automatic(&self, cursor: &mut Cursor) -> Result<(), FlowError> {
        let engine = self.engine();
        for _ in 0..self.config.max_auto_steps {
            if !matches!(engine.pending(&cursor.state)?, Pending::Auto { .. }) {
                return Ok(());
            }
            let advance = engine.apply(&cursor.state, None).await;
            match self.moved_on(cursor, advance).await? {
                Advance::Appended(node) => self.commit(cursor, &node).await?,
                Advance::Finished => return Ok(()),
            }
        }
        Err(FlowError::Internal(anyhow::anyhow!(
            "automatic steps did not settle after {} nodes",
            self.config.max_auto_steps
        )))
    }

    /// A step that failed against a state another caller already advanced
    /// reports the conflict, not its own error.
    async fn moved_on(
        &self,
        cursor: &Cursor,
        advance: Result<Advance, FlowError>,
    ) -> Result<Advance, FlowError> {
        let err = match advance {
            Ok(advance) => return Ok(advance),
            Err(err @ FlowError::Domain(_)) => err,
            Err(err) => return Err(err),
        };
        match self.store.read(&cursor.workflow_id).await {
            Ok(history) if history.head() != cursor.head => {
                debug!(workflow_id = %cursor.workflow_id, "head moved while applying: {err}");
                Err(FlowError::Conflict)
            }
            Ok(_) => Err(err),
            Err(read_err) => {
                warn!(workflow_id = %cursor.workflow_id, "failed to re-read head: {read_err}");
                Err(err)
            }
        }
    }

    /// Append `node`, fold it, then emit its events and notify subscribers.
    async fn commit(&self, cursor: &mut Cursor, node: &Node) -> Result<(), FlowError> {
        let head = self
            .store
            .append(&cursor.workflow_id, &cursor.head, node)
            .await?;
        self.engine().fold(&mut cursor.state, node)?;
        cursor.head = head;

        for event in &node.events {
            info!(
                workflow_id = %cursor.workflow_id,
                event = %event.name,
                payload = %event.payload,
                "flow event"
            );
        }
        if let Err(err) = self.notifier.publish(&cursor.workflow_id).await {
            warn!(workflow_id = %cursor.workflow_id, "failed to publish change: {err}");
        }
        Ok(())
    }

    /// Turn the result of a mutating call into its response. Errors the
    /// client can act on are returned with the state the flow ended up in.
    fn settle(
        &self,
        cursor: &Cursor,
        result: Result<(), FlowError>,
    ) -> Result<ServiceOutput, ServiceError> {
        match result {
            Ok(()) => Ok(self.output(cursor)?),
            Err(err) => {
                if let FlowError::Internal(inner) = &err {
                    debug!(workflow_id = %cursor.workflow_id, "flow failed: {inner:#}");
                }
                match self.output(cursor) {
                    Ok(state) => Err(ServiceError::with_state(err, state)),
                    Err(_) => Err(err.into()),
                }
            }
        }
    }

    fn output(&self, cursor: &Cursor) -> Result<ServiceOutput, FlowError> {
        let (action, finished) = match self.engine().pending(&cursor.state)? {
            Pending::Input(action) => (action, false),
            Pending::Auto { step } => {
                (Action::new(&step, &[RETRY_INPUT_KIND], json!({})), false)
            }
            Pending::Finished => (self.finished_action(&cursor.state), true),
        };
        Ok(ServiceOutput {
            workflow_id: cursor.workflow_id.clone(),
            instance_id: cursor.head.clone(),
            action,
            cookies: Vec::new(),
            finished,
        })
    }

    fn finished_action(&self, state: &ReplayState) -> Action {
        let redirect_uri = if state.session.redirect_uri.is_empty() {
            self.config.default_redirect_uri.as_str()
        } else {
            state.session.redirect_uri.as_str()
        };
        Action::new(
            FINISHED_ACTION,
            &[],
            json!({
                "user_id": state.facts.get(FACT_USER_ID).cloned().unwrap_or(Value::Null),
                "redirect_uri": redirect_uri,
            }),
        )
    }
}
