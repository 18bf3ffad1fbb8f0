mod common;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use common::{catalog, Capture};
use flotilla::error::StoreError;
use flotilla::keys;
use flotilla::scheduler::audit::{self, ReplicaMismatch, Unregistered};
use flotilla::scheduler::rollout::RolloutContext;
use flotilla::store::{put_json, CoordinationStore, KeyValue, LeaseId, MemoryStore, Watch};
use flotilla::types::{new_id, ReplicaRecord, ReplicaSet, ServiceRegistration};

fn context(store: Arc<dyn CoordinationStore>, notifier: Arc<Capture>) -> RolloutContext {
    RolloutContext {
        store,
        notifier,
        catalog: Arc::new(catalog("panel", 2, &["node1", "node2"])),
        recipients: vec!["ops@example.com".into()],
        timeout: Duration::from_secs(10),
        store_endpoint: "etcd:2379".into(),
    }
}

/// Announces `node` and publishes its running set.
async fn agent_reports(store: &MemoryStore, node: &str, services: &[&str]) {
    store
        .put(&keys::liveness(node), node.as_bytes())
        .await
        .unwrap();
    let set: ReplicaSet = services
        .iter()
        .map(|service| {
            let record = ReplicaRecord {
                detail_key: format!("image-{service}-{node}"),
                full_name: format!("registry:5000/{service}:v1"),
                env: BTreeMap::new(),
                node: node.to_string(),
                container_id: format!("{node}-container"),
                unit_id: None,
            };
            (service.to_string(), record)
        })
        .collect();
    put_json(store, &keys::running_set(node), &set).await.unwrap();
}

async fn register(store: &MemoryStore, service: &str, node: &str) {
    let registration = ServiceRegistration {
        id: new_id(),
        ip: "10.0.0.1".into(),
        port: "8999".into(),
        container_port: "80".into(),
        host: node.to_string(),
        address: "10.0.0.1:8999".into(),
        service_name: service.to_string(),
    };
    put_json(
        store,
        &keys::registration(service, &registration.id),
        &registration,
    )
    .await
    .unwrap();
}

#[tokio::test]
async fn short_fleet_is_reported() {
    let store = MemoryStore::new();
    agent_reports(&store, "node1", &["panel"]).await;
    agent_reports(&store, "node2", &[]).await;
    let notifier = Capture::new();
    let ctx = context(Arc::new(store), notifier.clone());

    let found = audit::fleet(&ctx).await.unwrap();
    assert_eq!(
        found,
        [ReplicaMismatch {
            service: "panel".into(),
            expected: 2,
            actual: 1,
        }]
    );
    let sent = notifier.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].0, audit::FLEET_SUBJECT);
    assert!(sent[0].1.contains("service panel expects 2 replicas, 1 running"));
}

#[tokio::test]
async fn withdrawn_agents_do_not_count() {
    let store = MemoryStore::new();
    agent_reports(&store, "node1", &["panel"]).await;
    agent_reports(&store, "node2", &["panel"]).await;
    store.delete(&keys::liveness("node2")).await.unwrap();
    let notifier = Capture::new();
    let ctx = context(Arc::new(store), notifier.clone());

    let found = audit::fleet(&ctx).await.unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].actual, 1);
}

#[tokio::test]
async fn unregistered_replica_is_reported() {
    let store = MemoryStore::new();
    agent_reports(&store, "node1", &["panel"]).await;
    agent_reports(&store, "node2", &["panel"]).await;
    register(&store, "panel", "node1").await;
    let notifier = Capture::new();
    let ctx = context(Arc::new(store), notifier.clone());

    let found = audit::registrations_check(&ctx).await.unwrap();
    assert_eq!(
        found,
        [Unregistered {
            service: "panel".into(),
            node: "node2".into(),
        }]
    );
    let sent = notifier.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].0, audit::REGISTRATION_SUBJECT);
    assert!(sent[0].1.contains("service panel runs on node2 but is not registered"));
}

#[tokio::test]
async fn healthy_fleet_sends_nothing() {
    let store = MemoryStore::new();
    agent_reports(&store, "node1", &["panel"]).await;
    agent_reports(&store, "node2", &["panel"]).await;
    register(&store, "panel", "node1").await;
    register(&store, "panel", "node2").await;
    let notifier = Capture::new();
    let ctx = context(Arc::new(store), notifier.clone());

    assert_eq!(audit::fleet(&ctx).await, Some(Vec::new()));
    assert_eq!(audit::registrations_check(&ctx).await, Some(Vec::new()));
    assert!(notifier.sent().is_empty());
}

/// Store whose every call fails.
struct Unreachable;

fn down() -> StoreError {
    StoreError::Unavailable("connection refused".into())
}

#[async_trait]
impl CoordinationStore for Unreachable {
    async fn put(&self, _: &str, _: &[u8]) -> Result<(), StoreError> {
        Err(down())
    }

    async fn put_with_lease(&self, _: &str, _: &[u8], _: LeaseId) -> Result<(), StoreError> {
        Err(down())
    }

    async fn get(&self, _: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Err(down())
    }

    async fn get_prefix(&self, _: &str) -> Result<Vec<KeyValue>, StoreError> {
        Err(down())
    }

    async fn delete(&self, _: &str) -> Result<(), StoreError> {
        Err(down())
    }

    async fn watch(&self, _: &str) -> Result<Watch, StoreError> {
        Err(down())
    }

    async fn watch_prefix(&self, _: &str) -> Result<Watch, StoreError> {
        Err(down())
    }

    async fn grant_lease(&self, _: Duration) -> Result<LeaseId, StoreError> {
        Err(down())
    }
}

#[tokio::test]
async fn audits_are_skipped_while_the_store_is_down() {
    let notifier = Capture::new();
    let ctx = context(Arc::new(Unreachable), notifier.clone());

    assert_eq!(audit::fleet(&ctx).await, None);
    assert_eq!(audit::registrations_check(&ctx).await, None);
    assert!(notifier.sent().is_empty());
}
