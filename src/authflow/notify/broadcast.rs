use async_trait::async_trait;
use tokio::sync::broadcast;
use tracing::debug;

use super::{Notifier, NotifyError, Subscription};

const DEFAULT_CAPACITY: usize = 256;

/// In-process fan-out. Enough when a single server instance handles a
/// workflow's writers and its sockets.
#[derive(Clone, Debug)]
pub struct BroadcastNotifier {
    tx: broadcast::Sender<String>,
}

impl BroadcastNotifier {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    #[must_use]
    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Deliver to local subscribers; having none is not an error.
    pub(crate) fn forward(&self, workflow_id: &str) {
        match self.tx.send(workflow_id.to_string()) {
            Ok(receivers) => debug!(workflow_id, receivers, "change signal sent"),
            Err(_) => debug!(workflow_id, "no subscribers for change signal"),
        }
    }
}

impl Default for BroadcastNotifier {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[async_trait]
impl Notifier for BroadcastNotifier {
    async fn publish(&self, workflow_id: &str) -> Result<(), NotifyError> {
        self.forward(workflow_id);
        Ok(())
    }

    fn subscribe(&self, workflow_id: &str) -> Subscription {
        Subscription::new(workflow_id, self.tx.subscribe())
    }
}
