//! Append-only node log per workflow.
//!
//! A workflow record holds the immutable creation data (flow reference,
//! session options, root intent spec) and an ordered list of instances.
//! Instance 0 is allocated at creation and carries no node; every later
//! instance carries exactly one. `append` is a compare-and-set on the head
//! instance id, which keeps the chain linear without holding a lock across
//! requests.
//!
//! Every append renews the TTL, capped by the maximum lifetime counted from
//! creation. An expired workflow reads as [`StoreError::NotFound`].

mod memory;
mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use std::time::Duration;
use thiserror::Error;

pub use memory::MemoryStore;
pub use postgres::PgStore;

use super::config::FlowReference;
use super::node::Node;
use super::registry::IntentSpec;
use super::session::SessionOptions;

const DEFAULT_TTL: Duration = Duration::from_secs(20 * 60);
const DEFAULT_MAX_LIFETIME: Duration = Duration::from_secs(2 * 60 * 60);

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("workflow not found")]
    NotFound,
    #[error("instance is not the current head")]
    Conflict,
    #[error("database error: {0}")]
    Database(String),
    #[error("corrupt record: {0}")]
    Corrupt(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        Self::Database(err.to_string())
    }
}

/// Creation data of a workflow.
#[derive(Clone, Debug, PartialEq)]
pub struct NewFlow {
    pub workflow_id: String,
    pub reference: FlowReference,
    pub session: SessionOptions,
    pub root: IntentSpec,
}

/// A workflow read back from the store, possibly truncated at an instance.
#[derive(Clone, Debug, PartialEq)]
pub struct History {
    pub workflow_id: String,
    pub reference: FlowReference,
    pub session: SessionOptions,
    pub root: IntentSpec,
    /// `nodes[i]` was appended as `instance_ids[i + 1]`.
    pub nodes: Vec<Node>,
    pub instance_ids: Vec<String>,
    pub ttl_remaining: Duration,
}

impl History {
    /// Id of the last instance in this (possibly truncated) history.
    #[must_use]
    pub fn head(&self) -> &str {
        self.instance_ids.last().map_or("", String::as_str)
    }

    /// Keep instances up to and including `instance_id`.
    ///
    /// # Errors
    /// Returns [`StoreError::NotFound`] if the instance is not in this history.
    pub fn truncate_at(mut self, instance_id: &str) -> Result<Self, StoreError> {
        let position = self
            .instance_ids
            .iter()
            .position(|id| id == instance_id)
            .ok_or(StoreError::NotFound)?;
        self.instance_ids.truncate(position + 1);
        self.nodes.truncate(position);
        Ok(self)
    }
}

/// TTL policy shared by the backends.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Lifetime {
    pub ttl: Duration,
    pub max_lifetime: Duration,
}

impl Default for Lifetime {
    fn default() -> Self {
        Self {
            ttl: DEFAULT_TTL,
            max_lifetime: DEFAULT_MAX_LIFETIME,
        }
    }
}

fn delta(duration: Duration) -> TimeDelta {
    TimeDelta::from_std(duration).unwrap_or(TimeDelta::MAX)
}

impl Lifetime {
    #[must_use]
    pub fn new(ttl: Duration, max_lifetime: Duration) -> Self {
        Self { ttl, max_lifetime }
    }

    /// Expiry after a write at `now` of a workflow created at `created_at`.
    #[must_use]
    pub fn expires_at(&self, created_at: DateTime<Utc>, now: DateTime<Utc>) -> DateTime<Utc> {
        let renewed = now
            .checked_add_signed(delta(self.ttl))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        let cap = created_at
            .checked_add_signed(delta(self.max_lifetime))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        renewed.min(cap)
    }

    #[must_use]
    pub fn remaining(expires_at: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
        (expires_at - now).to_std().unwrap_or(Duration::ZERO)
    }
}

#[async_trait]
pub trait InstanceStore: Send + Sync {
    /// Store a new workflow and return the id of instance 0.
    async fn create(&self, flow: NewFlow) -> Result<String, StoreError>;

    /// Append `node` after `after`, returning the new head.
    ///
    /// Fails with [`StoreError::Conflict`] when `after` is not the head.
    async fn append(&self, workflow_id: &str, after: &str, node: &Node)
    -> Result<String, StoreError>;

    async fn read(&self, workflow_id: &str) -> Result<History, StoreError>;

    /// History truncated at `instance_id`.
    async fn read_at(&self, workflow_id: &str, instance_id: &str) -> Result<History, StoreError> {
        self.read(workflow_id).await?.truncate_at(instance_id)
    }

    /// Backend health, used by `/health`.
    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }

    fn backend(&self) -> &'static str;
}
