mod common;

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use common::{Call, FakeRuntime};
use flotilla::agent::NodeAgent;
use flotilla::keys;
use flotilla::runtime::ContainerRuntime;
use flotilla::store::{get_json, put_json, CoordinationStore, MemoryStore};
use flotilla::types::{
    new_id, short_id, DeploymentUnit, ImageDetail, RemovalInstruction, ReplicaRecord, ReplicaSet,
};

fn unit(node: &str, commit: &str) -> DeploymentUnit {
    DeploymentUnit {
        id: new_id(),
        full_name: format!("registry:5000/panel:{commit}"),
        service_name: "panel".into(),
        env: BTreeMap::from([
            ("Port".to_string(), "8999".to_string()),
            ("ContainerPort".to_string(), "80".to_string()),
            ("ServiceName".to_string(), "panel".to_string()),
        ]),
        node: node.into(),
        create_time: Utc::now(),
    }
}

fn agent(store: &MemoryStore, runtime: &Arc<FakeRuntime>) -> NodeAgent {
    let runtime: Arc<dyn ContainerRuntime> = runtime.clone();
    NodeAgent::new("node1", Arc::new(store.clone()), runtime, Duration::from_secs(60))
}

async fn ack(store: &MemoryStore) -> Option<String> {
    store
        .get(&keys::ack("panel"))
        .await
        .unwrap()
        .map(|v| String::from_utf8(v).unwrap())
}

async fn published(store: &MemoryStore) -> ReplicaSet {
    get_json(store, &keys::running_set("node1"))
        .await
        .unwrap()
        .unwrap_or_default()
}

fn assert_disjoint(agent: &NodeAgent) {
    for service in agent.running().keys() {
        assert!(!agent.failed().contains_key(service), "{service} in both maps");
    }
}

#[tokio::test]
async fn successful_apply_records_and_publishes() {
    let store = MemoryStore::new();
    let runtime = FakeRuntime::new();
    let mut agent = agent(&store, &runtime);

    assert_eq!(agent.apply_unit(&unit("node1", "v1")).await, Some(true));
    assert_eq!(ack(&store).await.as_deref(), Some("true"));

    let record = agent.running()["panel"].clone();
    assert!(runtime.live().contains(&record.container_id));
    assert_eq!(published(&store).await["panel"], record);

    let detail: ImageDetail = get_json(&store, &record.detail_key).await.unwrap().unwrap();
    assert!(record.detail_key.starts_with("image-panel-"));
    assert_eq!(detail.version, "v1");
    assert_eq!(detail.container_id, record.container_id);
}

#[tokio::test]
async fn units_for_other_nodes_are_ignored() {
    let store = MemoryStore::new();
    let runtime = FakeRuntime::new();
    let mut agent = agent(&store, &runtime);

    assert_eq!(agent.apply_unit(&unit("node2", "v1")).await, None);
    assert!(runtime.calls().is_empty());
    assert!(ack(&store).await.is_none());
}

#[tokio::test]
async fn duplicate_delivery_is_idempotent() {
    let store = MemoryStore::new();
    let runtime = FakeRuntime::new();
    let mut agent = agent(&store, &runtime);
    let u = unit("node1", "v1");

    agent.apply_unit(&u).await;
    let first = agent.running()["panel"].clone();
    assert_eq!(agent.apply_unit(&u).await, Some(true));

    assert_eq!(runtime.runs(), 1);
    assert_eq!(agent.running()["panel"], first);
    assert_eq!(runtime.live().len(), 1);
}

#[tokio::test]
async fn update_stops_previous_container_and_keeps_detail_key() {
    let store = MemoryStore::new();
    let runtime = FakeRuntime::new();
    let mut agent = agent(&store, &runtime);

    agent.apply_unit(&unit("node1", "v1")).await;
    let old = agent.running()["panel"].clone();
    agent.apply_unit(&unit("node1", "v2")).await;
    let new = agent.running()["panel"].clone();

    assert!(runtime.calls().contains(&Call::Stop(old.container_id.clone())));
    assert_ne!(old.container_id, new.container_id);
    assert_eq!(old.detail_key, new.detail_key);
    assert_eq!(runtime.live(), HashSet::from([new.container_id.clone()]));
    let detail: ImageDetail = get_json(&store, &new.detail_key).await.unwrap().unwrap();
    assert_eq!(detail.version, "v2");
}

#[tokio::test]
async fn pull_failure_leaves_old_container_alone() {
    let store = MemoryStore::new();
    let runtime = FakeRuntime::new();
    let mut agent = agent(&store, &runtime);

    agent.apply_unit(&unit("node1", "v1")).await;
    let old = agent.running()["panel"].clone();
    runtime.fail_pull("registry:5000/panel:v2");

    assert_eq!(agent.apply_unit(&unit("node1", "v2")).await, Some(false));
    assert_eq!(ack(&store).await.as_deref(), Some("false"));

    assert!(agent.running().is_empty());
    let failed = &agent.failed()["panel"];
    assert_eq!(failed.full_name, "registry:5000/panel:v2");
    assert_eq!(failed.container_id, old.container_id);
    assert!(runtime.live().contains(&old.container_id));
    assert!(!runtime.calls().iter().any(|c| matches!(c, Call::Stop(_))));
    assert!(published(&store).await.is_empty());
    assert_disjoint(&agent);
}

#[tokio::test]
async fn retry_promotes_recovered_replicas() {
    let store = MemoryStore::new();
    let runtime = FakeRuntime::new();
    let mut agent = agent(&store, &runtime);
    runtime.fail_run("registry:5000/panel:v1");

    agent.apply_unit(&unit("node1", "v1")).await;
    assert!(agent.failed().contains_key("panel"));

    agent.retry_failed().await;
    assert!(agent.failed().contains_key("panel"));
    assert_eq!(ack(&store).await.as_deref(), Some("false"));

    runtime.heal();
    agent.retry_failed().await;
    assert!(agent.failed().is_empty());
    assert!(agent.running().contains_key("panel"));
    assert_eq!(ack(&store).await.as_deref(), Some("true"));
    assert!(published(&store).await.contains_key("panel"));
    assert_disjoint(&agent);
}

#[tokio::test]
async fn malformed_image_reference_changes_nothing() {
    let store = MemoryStore::new();
    let runtime = FakeRuntime::new();
    let mut agent = agent(&store, &runtime);
    let mut bad = unit("node1", "v1");
    bad.full_name = "registry:5000/panel".into();

    assert_eq!(agent.apply_unit(&bad).await, Some(false));
    assert!(runtime.calls().is_empty());
    assert!(agent.running().is_empty());
    assert!(agent.failed().is_empty());
}

#[tokio::test]
async fn removal_requires_matching_container() {
    let store = MemoryStore::new();
    let runtime = FakeRuntime::new();
    let mut agent = agent(&store, &runtime);
    agent.apply_unit(&unit("node1", "v1")).await;
    let running = agent.running()["panel"].clone();

    let stale_key = keys::removal("node1", "a");
    let stale = RemovalInstruction {
        service_name: "panel".into(),
        container_id: "ffffffffffff".into(),
    };
    put_json(&store, &stale_key, &stale).await.unwrap();
    assert!(!agent.remove(&stale_key, &stale).await);
    assert!(agent.running().contains_key("panel"));
    assert!(store.get(&stale_key).await.unwrap().is_some());

    let key = keys::removal("node1", "b");
    let matching = RemovalInstruction {
        service_name: "panel".into(),
        container_id: short_id(&running.container_id).to_string(),
    };
    put_json(&store, &key, &matching).await.unwrap();
    assert!(agent.remove(&key, &matching).await);
    assert!(agent.running().is_empty());
    assert_eq!(agent.failed()["panel"], running);
    assert!(store.get(&key).await.unwrap().is_none());
    assert!(published(&store).await.is_empty());
}

#[tokio::test]
async fn recovery_restarts_previously_published_replicas() {
    let store = MemoryStore::new();
    let previous = ReplicaSet::from([(
        "panel".to_string(),
        ReplicaRecord {
            detail_key: "image-panel-old".into(),
            full_name: "registry:5000/panel:v1".into(),
            env: BTreeMap::new(),
            node: "node1".into(),
            container_id: "deadbeef".repeat(8),
            unit_id: None,
        },
    )]);
    put_json(&store, &keys::running_set("node1"), &previous)
        .await
        .unwrap();

    let runtime = FakeRuntime::new();
    let mut agent = agent(&store, &runtime);
    agent.recover().await;

    assert_eq!(
        runtime.calls()[..2],
        [
            Call::Pull("registry:5000/panel:v1".into()),
            Call::Stop("deadbeef".repeat(8)),
        ]
    );
    let record = &agent.running()["panel"];
    assert_ne!(record.container_id, "deadbeef".repeat(8));
    assert_eq!(record.detail_key, "image-panel-old");
    assert_eq!(published(&store).await["panel"], *record);
    assert_eq!(ack(&store).await.as_deref(), Some("true"));
}

#[tokio::test]
async fn run_loop_serves_units_and_withdraws_on_shutdown() {
    let store = MemoryStore::new();
    let runtime = FakeRuntime::new();
    let agent = agent(&store, &runtime);
    let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
    let handle = tokio::spawn(agent.run(async move {
        let _ = stop_rx.await;
    }));
    common::wait_for_agents(&store, 1).await;
    assert_eq!(
        store.get(&keys::liveness("node1")).await.unwrap(),
        Some(b"node1".to_vec())
    );

    let mut acks = store.watch(&keys::ack("panel")).await.unwrap();
    let u = unit("node1", "v1");
    put_json(&store, &keys::unit(&u.id), &u).await.unwrap();
    assert_eq!(acks.recv().await.unwrap().value, b"true");
    assert!(published(&store).await.contains_key("panel"));

    stop_tx.send(()).unwrap();
    handle.await.unwrap();
    assert!(store.get(&keys::liveness("node1")).await.unwrap().is_none());
}
