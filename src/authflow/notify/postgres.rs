//! Cross-instance signal over `LISTEN/NOTIFY`.
//!
//! Publishing goes through `pg_notify`; a background listener forwards every
//! notification to the local broadcast channel the sockets subscribe to.

use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::PgPool;
use sqlx::postgres::PgListener;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{Instrument, error, info};

use super::{BroadcastNotifier, Notifier, NotifyError, Subscription};

pub const NOTIFY_CHANNEL: &str = "authflow_changed";

#[derive(Debug)]
pub struct PgNotifier {
    pool: PgPool,
    local: BroadcastNotifier,
    listener: JoinHandle<()>,
}

impl PgNotifier {
    /// Start listening on [`NOTIFY_CHANNEL`].
    ///
    /// # Errors
    /// Returns an error if the listener connection cannot be established.
    pub async fn listen(pool: PgPool) -> Result<Self> {
        let mut listener = PgListener::connect_with(&pool)
            .await
            .context("failed to connect notification listener")?;
        listener
            .listen(NOTIFY_CHANNEL)
            .await
            .context("failed to LISTEN on notification channel")?;
        info!(channel = NOTIFY_CHANNEL, "listening for flow changes");

        let local = BroadcastNotifier::default();
        let forward = local.clone();
        let listener = tokio::spawn(async move {
            loop {
                match listener.recv().await {
                    Ok(notification) => forward.forward(notification.payload()),
                    Err(err) => {
                        // PgListener reconnects on the next recv.
                        error!("notification listener error: {err}");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        });

        Ok(Self {
            pool,
            local,
            listener,
        })
    }
}

impl Drop for PgNotifier {
    fn drop(&mut self) {
        self.listener.abort();
    }
}

#[async_trait]
impl Notifier for PgNotifier {
    async fn publish(&self, workflow_id: &str) -> Result<(), NotifyError> {
        let query = "SELECT pg_notify($1, $2)";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "NOTIFY",
            db.statement = query
        );
        sqlx::query(query)
            .bind(NOTIFY_CHANNEL)
            .bind(workflow_id)
            .execute(&self.pool)
            .instrument(span)
            .await
            .map_err(|err| NotifyError::Backend(err.to_string()))?;
        Ok(())
    }

    fn subscribe(&self, workflow_id: &str) -> Subscription {
        self.local.subscribe(workflow_id)
    }
}
