//! `PostgreSQL` backend for the node log.
//!
//! The head check and the TTL renewal are one conditional `UPDATE`; the row
//! lock it takes serializes concurrent appends to the same workflow until the
//! transaction inserting the new instance commits.

use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use std::time::Duration;
use tracing::{Instrument, debug, warn};
use ulid::Ulid;

use super::{History, InstanceStore, Lifetime, NewFlow, StoreError};
use crate::authflow::config::FlowReference;
use crate::authflow::node::Node;
use crate::authflow::registry::IntentSpec;
use crate::authflow::session::SessionOptions;

const SCHEMA: &str = include_str!("../../../sql/schema.sql");

#[derive(Clone, Debug)]
pub struct PgStore {
    pool: PgPool,
    lifetime: Lifetime,
}

fn db_span(operation: &'static str, statement: &'static str) -> tracing::Span {
    tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = operation,
        db.statement = statement
    )
}

impl PgStore {
    #[must_use]
    pub fn new(pool: PgPool, lifetime: Lifetime) -> Self {
        Self { pool, lifetime }
    }

    /// Connect and make sure the schema exists.
    ///
    /// # Errors
    /// Returns an error if the database is unreachable or the schema cannot
    /// be applied.
    pub async fn connect(dsn: &str, lifetime: Lifetime) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .min_connections(1)
            .max_connections(5)
            .max_lifetime(Duration::from_secs(60 * 2))
            .test_before_acquire(true)
            .connect(dsn)
            .await
            .context("Failed to connect to database")?;
        let store = Self::new(pool, lifetime);
        store.migrate().await?;
        Ok(store)
    }

    /// # Errors
    /// Returns an error if the schema statements fail.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::raw_sql(SCHEMA)
            .execute(&self.pool)
            .instrument(db_span("CREATE", "sql/schema.sql"))
            .await
            .context("failed to apply authflow schema")?;
        Ok(())
    }

    #[must_use]
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Delete expired workflows. Instances go with them.
    ///
    /// # Errors
    /// Returns an error if the delete fails.
    pub async fn purge_expired(&self) -> Result<u64, StoreError> {
        let query = "DELETE FROM authflow_workflows WHERE expires_at <= NOW()";
        let result = sqlx::query(query)
            .execute(&self.pool)
            .instrument(db_span("DELETE", query))
            .await?;
        let purged = result.rows_affected();
        if purged > 0 {
            debug!(purged, "purged expired workflows");
        }
        Ok(purged)
    }
}

fn seconds(duration: Duration) -> f64 {
    duration.as_secs_f64()
}

#[async_trait]
impl InstanceStore for PgStore {
    async fn create(&self, flow: NewFlow) -> Result<String, StoreError> {
        self.purge_expired().await?;

        let instance_id = Ulid::new().to_string();
        let mut tx = self.pool.begin().await?;

        let query = r"
            INSERT INTO authflow_workflows
                (workflow_id, flow_reference, session_options, root_intent, head_instance_id, expires_at)
            VALUES ($1, $2, $3, $4, $5, LEAST(NOW() + $6 * INTERVAL '1 second', NOW() + $7 * INTERVAL '1 second'))
            ON CONFLICT (workflow_id) DO NOTHING
        ";
        let inserted = sqlx::query(query)
            .bind(&flow.workflow_id)
            .bind(Json(&flow.reference))
            .bind(Json(&flow.session))
            .bind(Json(&flow.root))
            .bind(&instance_id)
            .bind(seconds(self.lifetime.ttl))
            .bind(seconds(self.lifetime.max_lifetime))
            .execute(&mut *tx)
            .instrument(db_span("INSERT", query))
            .await?;
        if inserted.rows_affected() == 0 {
            if let Err(err) = tx.rollback().await {
                warn!(workflow_id = %flow.workflow_id, "failed to roll back create: {err}");
            }
            return Err(StoreError::Conflict);
        }

        let query = r"
            INSERT INTO authflow_instances (workflow_id, position, instance_id, node)
            VALUES ($1, 0, $2, NULL)
        ";
        sqlx::query(query)
            .bind(&flow.workflow_id)
            .bind(&instance_id)
            .execute(&mut *tx)
            .instrument(db_span("INSERT", query))
            .await?;

        tx.commit().await?;
        Ok(instance_id)
    }

    async fn append(
        &self,
        workflow_id: &str,
        after: &str,
        node: &Node,
    ) -> Result<String, StoreError> {
        let instance_id = Ulid::new().to_string();
        let mut tx = self.pool.begin().await?;

        let query = r"
            UPDATE authflow_workflows
            SET head_instance_id = $3,
                expires_at = LEAST(NOW() + $4 * INTERVAL '1 second', created_at + $5 * INTERVAL '1 second')
            WHERE workflow_id = $1 AND head_instance_id = $2 AND expires_at > NOW()
        ";
        let updated = sqlx::query(query)
            .bind(workflow_id)
            .bind(after)
            .bind(&instance_id)
            .bind(seconds(self.lifetime.ttl))
            .bind(seconds(self.lifetime.max_lifetime))
            .execute(&mut *tx)
            .instrument(db_span("UPDATE", query))
            .await?;

        if updated.rows_affected() == 0 {
            let query =
                "SELECT expires_at > NOW() AS live FROM authflow_workflows WHERE workflow_id = $1";
            let row = sqlx::query(query)
                .bind(workflow_id)
                .fetch_optional(&mut *tx)
                .instrument(db_span("SELECT", query))
                .await?;
            if let Err(err) = tx.rollback().await {
                warn!(workflow_id, "failed to roll back append: {err}");
            }
            return match row {
                Some(row) if row.try_get::<bool, _>("live")? => Err(StoreError::Conflict),
                _ => Err(StoreError::NotFound),
            };
        }

        let query = r"
            INSERT INTO authflow_instances (workflow_id, position, instance_id, node)
            SELECT $1, COALESCE(MAX(position), -1) + 1, $2, $3
            FROM authflow_instances WHERE workflow_id = $1
        ";
        sqlx::query(query)
            .bind(workflow_id)
            .bind(&instance_id)
            .bind(Json(node))
            .execute(&mut *tx)
            .instrument(db_span("INSERT", query))
            .await?;

        tx.commit().await?;
        Ok(instance_id)
    }

    async fn read(&self, workflow_id: &str) -> Result<History, StoreError> {
        let query = r"
            SELECT flow_reference, session_options, root_intent,
                   EXTRACT(EPOCH FROM (expires_at - NOW()))::float8 AS ttl_remaining
            FROM authflow_workflows
            WHERE workflow_id = $1 AND expires_at > NOW()
        ";
        let row = sqlx::query(query)
            .bind(workflow_id)
            .fetch_optional(&self.pool)
            .instrument(db_span("SELECT", query))
            .await?
            .ok_or(StoreError::NotFound)?;

        let Json(reference): Json<FlowReference> = row.try_get("flow_reference")?;
        let Json(session): Json<SessionOptions> = row.try_get("session_options")?;
        let Json(root): Json<IntentSpec> = row.try_get("root_intent")?;
        let ttl_remaining: f64 = row.try_get("ttl_remaining")?;

        let query = r"
            SELECT instance_id, node FROM authflow_instances
            WHERE workflow_id = $1
            ORDER BY position
        ";
        let rows = sqlx::query(query)
            .bind(workflow_id)
            .fetch_all(&self.pool)
            .instrument(db_span("SELECT", query))
            .await?;

        let mut instance_ids = Vec::with_capacity(rows.len());
        let mut nodes = Vec::with_capacity(rows.len().saturating_sub(1));
        for (position, row) in rows.iter().enumerate() {
            instance_ids.push(row.try_get::<String, _>("instance_id")?);
            let node: Option<Json<Node>> = row.try_get("node")?;
            match (position, node) {
                (0, None) => {}
                (0, Some(_)) => {
                    return Err(StoreError::Corrupt(format!(
                        "instance 0 of {workflow_id} carries a node"
                    )));
                }
                (_, Some(Json(node))) => nodes.push(node),
                (_, None) => {
                    return Err(StoreError::Corrupt(format!(
                        "instance {position} of {workflow_id} has no node"
                    )));
                }
            }
        }
        if instance_ids.is_empty() {
            return Err(StoreError::Corrupt(format!(
                "{workflow_id} has no instances"
            )));
        }

        Ok(History {
            workflow_id: workflow_id.to_string(),
            reference,
            session,
            root,
            nodes,
            instance_ids,
            ttl_remaining: Duration::try_from_secs_f64(ttl_remaining.max(0.0))
                .unwrap_or(Duration::ZERO),
        })
    }

    async fn ping(&self) -> Result<(), StoreError> {
        let query = "SELECT 1";
        sqlx::query(query)
            .execute(&self.pool)
            .instrument(db_span("SELECT", query))
            .await?;
        Ok(())
    }

    fn backend(&self) -> &'static str {
        "postgres"
    }
}
