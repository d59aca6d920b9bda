//! "Changed" signal keyed by workflow id.
//!
//! Every committed append publishes the workflow id. Subscribers (WebSocket
//! connections) only learn that something changed and re-fetch the state;
//! the signal never carries flow data.

mod broadcast;
mod postgres;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::broadcast::{Receiver, error::RecvError};

pub use broadcast::BroadcastNotifier;
pub use postgres::{PgNotifier, NOTIFY_CHANNEL};

/// Text frame pushed to subscribers.
pub const CHANGED: &str = "changed";

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("notify failed: {0}")]
    Backend(String),
}

#[async_trait]
pub trait Notifier: Send + Sync {
    /// Signal that `workflow_id` has a new head.
    async fn publish(&self, workflow_id: &str) -> Result<(), NotifyError>;

    fn subscribe(&self, workflow_id: &str) -> Subscription;
}

/// Receiver filtered to one workflow.
#[derive(Debug)]
pub struct Subscription {
    workflow_id: String,
    rx: Receiver<String>,
}

impl Subscription {
    pub(crate) fn new(workflow_id: &str, rx: Receiver<String>) -> Self {
        Self {
            workflow_id: workflow_id.to_string(),
            rx,
        }
    }

    #[must_use]
    pub fn workflow_id(&self) -> &str {
        &self.workflow_id
    }

    /// Wait for the next change. Returns `false` once the channel is closed.
    ///
    /// A lagging receiver may have missed its workflow, so lag counts as a
    /// change.
    pub async fn changed(&mut self) -> bool {
        loop {
            match self.rx.recv().await {
                Ok(id) if id == self.workflow_id => return true,
                Ok(_) => {}
                Err(RecvError::Lagged(_)) => return true,
                Err(RecvError::Closed) => return false,
            }
        }
    }
}
