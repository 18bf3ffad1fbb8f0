#![allow(dead_code)]

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use flotilla::config::{Catalog, NodeConfig, ServiceConfig};
use flotilla::error::{NotifyError, RuntimeError};
use flotilla::keys;
use flotilla::notify::Notifier;
use flotilla::runtime::ContainerRuntime;
use flotilla::store::{CoordinationStore, MemoryStore};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Pull(String),
    Stop(String),
    Run(String),
}

#[derive(Default)]
struct FakeState {
    fail_pull: HashSet<String>,
    fail_run: HashSet<String>,
    next_id: u64,
    calls: Vec<Call>,
    live: HashSet<String>,
}

/// Scripted container runtime: every call is recorded, failures are
/// configured per image.
#[derive(Default)]
pub struct FakeRuntime {
    state: Mutex<FakeState>,
}

impl FakeRuntime {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_pull(&self, image: &str) {
        self.state.lock().unwrap().fail_pull.insert(image.to_string());
    }

    pub fn fail_run(&self, image: &str) {
        self.state.lock().unwrap().fail_run.insert(image.to_string());
    }

    pub fn heal(&self) {
        let mut state = self.state.lock().unwrap();
        state.fail_pull.clear();
        state.fail_run.clear();
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn runs(&self) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, Call::Run(_)))
            .count()
    }

    pub fn live(&self) -> HashSet<String> {
        self.state.lock().unwrap().live.clone()
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn pull(&self, image: &str) -> Result<(), RuntimeError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(Call::Pull(image.to_string()));
        if state.fail_pull.contains(image) {
            return Err(RuntimeError::Pull {
                image: image.to_string(),
                reason: "manifest unknown".into(),
            });
        }
        Ok(())
    }

    async fn stop(&self, container_id: &str) -> Result<(), RuntimeError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(Call::Stop(container_id.to_string()));
        state.live.remove(container_id);
        Ok(())
    }

    async fn run(
        &self,
        image: &str,
        _env: &BTreeMap<String, String>,
    ) -> Result<String, RuntimeError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(Call::Run(image.to_string()));
        if state.fail_run.contains(image) {
            return Err(RuntimeError::Run {
                image: image.to_string(),
                reason: "port already allocated".into(),
            });
        }
        state.next_id += 1;
        let id = format!("{:012x}{}", state.next_id, "c".repeat(52));
        state.live.insert(id.clone());
        Ok(id)
    }
}

/// Notifier that keeps every notification.
#[derive(Default)]
pub struct Capture {
    sent: Mutex<Vec<(String, String)>>,
}

impl Capture {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn sent(&self) -> Vec<(String, String)> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl Notifier for Capture {
    async fn send(&self, _: &[String], subject: &str, body: &str) -> Result<(), NotifyError> {
        self.sent
            .lock()
            .unwrap()
            .push((subject.to_string(), body.to_string()));
        Ok(())
    }
}

pub fn node(name: &str) -> NodeConfig {
    NodeConfig {
        hostname: name.to_string(),
        private_ip: format!("10.0.0.{}", name.trim_start_matches("node")),
        public_ip: String::new(),
        has_public: true,
    }
}

pub fn catalog(service: &str, replica: usize, nodes: &[&str]) -> Catalog {
    let svc = ServiceConfig {
        name: service.to_string(),
        replica,
        image_prefix: format!("registry:5000/{service}"),
        port: "8999".into(),
        container_port: "80".into(),
        need_public_network: false,
        store_endpoint: None,
    };
    Catalog {
        services: BTreeMap::from([(service.to_string(), svc)]),
        nodes: nodes.iter().map(|n| node(n)).collect(),
    }
}

/// Waits until `n` node agents have announced themselves.
pub async fn wait_for_agents(store: &MemoryStore, n: usize) {
    for _ in 0..500 {
        if store.get_prefix(keys::LIVENESS_PREFIX).await.unwrap().len() >= n {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("agents did not come up");
}
