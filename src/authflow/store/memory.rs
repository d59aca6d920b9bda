use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::Mutex;
use tracing::debug;
use ulid::Ulid;

use super::{History, InstanceStore, Lifetime, NewFlow, StoreError};
use crate::authflow::node::Node;

#[derive(Debug)]
struct Record {
    flow: NewFlow,
    instance_ids: Vec<String>,
    nodes: Vec<Node>,
    created_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

/// Process-local store. Expired workflows are dropped lazily on access.
#[derive(Debug, Default)]
pub struct MemoryStore {
    lifetime: Lifetime,
    records: Mutex<HashMap<String, Record>>,
}

impl MemoryStore {
    #[must_use]
    pub fn new(lifetime: Lifetime) -> Self {
        Self {
            lifetime,
            records: Mutex::new(HashMap::new()),
        }
    }
}

fn purge_expired(records: &mut HashMap<String, Record>, now: DateTime<Utc>) {
    let before = records.len();
    records.retain(|_, record| record.expires_at > now);
    let purged = before - records.len();
    if purged > 0 {
        debug!(purged, "purged expired workflows");
    }
}

#[async_trait]
impl InstanceStore for MemoryStore {
    async fn create(&self, flow: NewFlow) -> Result<String, StoreError> {
        let now = Utc::now();
        let mut records = self.records.lock().await;
        purge_expired(&mut records, now);
        if records.contains_key(&flow.workflow_id) {
            return Err(StoreError::Conflict);
        }
        let instance_id = Ulid::new().to_string();
        records.insert(
            flow.workflow_id.clone(),
            Record {
                flow,
                instance_ids: vec![instance_id.clone()],
                nodes: Vec::new(),
                created_at: now,
                expires_at: self.lifetime.expires_at(now, now),
            },
        );
        Ok(instance_id)
    }

    async fn append(
        &self,
        workflow_id: &str,
        after: &str,
        node: &Node,
    ) -> Result<String, StoreError> {
        let now = Utc::now();
        let mut records = self.records.lock().await;
        purge_expired(&mut records, now);
        let record = records.get_mut(workflow_id).ok_or(StoreError::NotFound)?;
        if record.instance_ids.last().map(String::as_str) != Some(after) {
            return Err(StoreError::Conflict);
        }
        let instance_id = Ulid::new().to_string();
        record.instance_ids.push(instance_id.clone());
        record.nodes.push(node.clone());
        record.expires_at = self.lifetime.expires_at(record.created_at, now);
        Ok(instance_id)
    }

    async fn read(&self, workflow_id: &str) -> Result<History, StoreError> {
        let now = Utc::now();
        let mut records = self.records.lock().await;
        purge_expired(&mut records, now);
        let record = records.get(workflow_id).ok_or(StoreError::NotFound)?;
        Ok(History {
            workflow_id: record.flow.workflow_id.clone(),
            reference: record.flow.reference.clone(),
            session: record.flow.session.clone(),
            root: record.flow.root.clone(),
            nodes: record.nodes.clone(),
            instance_ids: record.instance_ids.clone(),
            ttl_remaining: Lifetime::remaining(record.expires_at, now),
        })
    }

    fn backend(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authflow::config::{FlowReference, FlowType};
    use crate::authflow::intent::Facts;
    use crate::authflow::registry::IntentSpec;
    use crate::authflow::session::SessionOptions;
    use serde_json::json;
    use std::time::Duration;

    fn new_flow(id: &str) -> NewFlow {
        NewFlow {
            workflow_id: id.to_string(),
            reference: FlowReference::new(FlowType::Signup, "default"),
            session: SessionOptions::default(),
            root: IntentSpec::new("signup", json!({})),
        }
    }

    fn node(step: &str) -> Node {
        Node {
            step: step.to_string(),
            input: None,
            outcome: json!({}),
            facts: Facts::new(),
            events: vec![],
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn append_extends_head() -> anyhow::Result<()> {
        let store = MemoryStore::default();
        let first = store.create(new_flow("wf")).await?;
        let second = store.append("wf", &first, &node("identify")).await?;
        let third = store.append("wf", &second, &node("verify")).await?;

        let history = store.read("wf").await?;
        assert_eq!(history.instance_ids, vec![first.clone(), second.clone(), third]);
        assert_eq!(history.nodes.len(), 2);

        let earlier = store.read_at("wf", &second).await?;
        assert_eq!(earlier.head(), second);
        assert_eq!(earlier.nodes.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn stale_head_conflicts() -> anyhow::Result<()> {
        let store = MemoryStore::default();
        let first = store.create(new_flow("wf")).await?;
        store.append("wf", &first, &node("identify")).await?;
        assert!(matches!(
            store.append("wf", &first, &node("identify")).await,
            Err(StoreError::Conflict)
        ));
        assert_eq!(store.read("wf").await?.nodes.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn expired_workflows_read_as_not_found() -> anyhow::Result<()> {
        let store = MemoryStore::new(Lifetime::new(Duration::ZERO, Duration::from_secs(60)));
        let first = store.create(new_flow("wf")).await?;
        assert!(matches!(store.read("wf").await, Err(StoreError::NotFound)));
        assert!(matches!(
            store.append("wf", &first, &node("identify")).await,
            Err(StoreError::NotFound)
        ));
        Ok(())
    }

    #[tokio::test]
    async fn unknown_workflow_is_not_found() {
        let store = MemoryStore::default();
        assert!(matches!(
            store.read_at("missing", "i0").await,
            Err(StoreError::NotFound)
        ));
    }
}
