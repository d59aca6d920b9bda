//! # Authentication flow engine
//!
//! Signup, login and account recovery are modelled as flows: a declarative
//! list of steps (see [`config`]) whose state is never stored directly. Every
//! accepted input becomes an immutable [`Node`] appended to the workflow's log,
//! and the current position in the flow is rebuilt by folding those nodes
//! through the root [`Intent`] on every request.
//!
//! ## Layout
//!
//! - [`registry`]: kind string → intent factory / input parser. Only intents
//!   registered as public can be instantiated from client requests.
//! - [`engine`]: replay, pending-state computation, input validation and
//!   application. Side effects leave the engine as node data and event
//!   descriptors.
//! - [`store`]: append-only, compare-and-set node log with TTL.
//! - [`notify`]: "changed" signal keyed by workflow id for cross-device wakeup.
//! - [`session`]: immutable OAuth/UI context resolved once at creation.
//! - [`service`]: the façade used by the HTTP handlers.
//! - [`steps`] and [`deps`]: concrete steps and the collaborators they call.
//!
//! ## Concurrency
//!
//! Requests are independent. Two writers racing on the same workflow are
//! serialized by the store: the one appending against a stale head receives
//! [`FlowError::Conflict`] and must re-read. Nothing retries internally.

pub mod config;
pub mod deps;
pub mod engine;
mod error;
pub mod intent;
pub mod node;
pub mod notify;
pub mod registry;
pub mod service;
pub mod session;
pub mod steps;
pub mod store;
pub(crate) mod utils;

pub use config::{FlowConfig, FlowDefinition, FlowReference, FlowType};
pub use engine::{Advance, Engine, ReplayState};
pub use error::{DomainError, FlowError, StepError};
pub use intent::{Action, Facts, Intent, Pending, Reaction, StepContext};
pub use node::{FlowEvent, Input, InputPayload, Node, RecordedInput};
pub use registry::{Exposure, IntentSpec, Registry, RegistryError};
pub use service::{FlowService, FlowServiceConfig, ServiceError, ServiceOutput};
pub use session::{Cookie, SessionOptions};
