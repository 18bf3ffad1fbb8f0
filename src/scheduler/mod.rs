//! Deployment scheduler.
//!
//! Accepts rollout requests, runs at most one rollout per service at a
//! time (later requests wait in a per-service FIFO backlog) and audits
//! the fleet on two timers.  All of it is driven from [`Scheduler::run`].

pub mod audit;
pub mod design;
pub mod http;
pub mod rollout;

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use log::{info, warn};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use crate::config::{Catalog, Config};
use crate::notify::Notifier;
use crate::store::CoordinationStore;
use crate::types::RolloutRequest;
use rollout::{Outcome, RolloutContext};

/// Busy flags and backlogs, always read and written together.
#[derive(Debug, Default)]
struct Ledger {
    rolling: HashSet<String>,
    backlog: HashMap<String, VecDeque<RolloutRequest>>,
}

/// Shared per-service rollout bookkeeping.
#[derive(Debug, Clone, Default)]
pub struct RolloutBook {
    inner: Arc<Mutex<Ledger>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// The caller owns the service now and must run the rollout.
    Start,
    /// Another rollout is in flight; the request waits at `position`
    /// (1-based) in the service's backlog.
    Queued { position: usize },
}

impl RolloutBook {
    pub async fn admit(&self, request: RolloutRequest) -> Admission {
        let mut ledger = self.inner.lock().await;
        if ledger.rolling.insert(request.service_name.clone()) {
            return Admission::Start;
        }
        let queue = ledger
            .backlog
            .entry(request.service_name.clone())
            .or_default();
        queue.push_back(request);
        Admission::Queued {
            position: queue.len(),
        }
    }

    /// Called when a rollout of `service` ends.  Hands back the next
    /// queued request, in which case the service stays busy, or marks the
    /// service idle.
    pub async fn finish(&self, service: &str) -> Option<RolloutRequest> {
        let mut ledger = self.inner.lock().await;
        let next = ledger.backlog.get_mut(service).and_then(VecDeque::pop_front);
        if ledger.backlog.get(service).is_some_and(VecDeque::is_empty) {
            ledger.backlog.remove(service);
        }
        if next.is_none() {
            ledger.rolling.remove(service);
        }
        next
    }

    pub async fn is_rolling(&self, service: &str) -> bool {
        self.inner.lock().await.rolling.contains(service)
    }

    pub async fn queued(&self, service: &str) -> usize {
        self.inner
            .lock()
            .await
            .backlog
            .get(service)
            .map_or(0, VecDeque::len)
    }
}

/// Timers and limits of the scheduler loop.
#[derive(Debug, Clone)]
pub struct SchedulerOptions {
    pub rollout_timeout: Duration,
    pub fleet_audit_every: Duration,
    pub registration_audit_every: Duration,
    pub recipients: Vec<String>,
    pub store_endpoint: String,
}

impl SchedulerOptions {
    pub fn from_config(config: &Config) -> Self {
        let s = &config.scheduler;
        Self {
            rollout_timeout: Duration::from_secs(s.rollout_timeout_secs),
            fleet_audit_every: Duration::from_secs(s.fleet_audit_secs),
            registration_audit_every: Duration::from_secs(s.registration_audit_secs),
            recipients: s.recipients.clone(),
            store_endpoint: config.store.endpoint.clone().unwrap_or_default(),
        }
    }
}

pub struct Scheduler {
    ctx: Arc<RolloutContext>,
    book: RolloutBook,
    fleet_audit_every: Duration,
    registration_audit_every: Duration,
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        notifier: Arc<dyn Notifier>,
        catalog: Catalog,
        options: SchedulerOptions,
    ) -> Self {
        let ctx = RolloutContext {
            store,
            notifier,
            catalog: Arc::new(catalog),
            recipients: options.recipients,
            timeout: options.rollout_timeout,
            store_endpoint: options.store_endpoint,
        };
        Self {
            ctx: Arc::new(ctx),
            book: RolloutBook::default(),
            fleet_audit_every: options.fleet_audit_every,
            registration_audit_every: options.registration_audit_every,
        }
    }

    pub fn book(&self) -> &RolloutBook {
        &self.book
    }

    pub fn context(&self) -> &RolloutContext {
        &self.ctx
    }

    /// Starts a rollout of the request's service, or queues it behind the
    /// one in flight.  A started rollout's task keeps draining the backlog
    /// of that service before it exits; its handle is returned.
    pub async fn submit(&self, request: RolloutRequest) -> Option<JoinHandle<()>> {
        let service = request.service_name.clone();
        match self.book.admit(request.clone()).await {
            Admission::Start => Some(self.spawn_rollouts(request)),
            Admission::Queued { position } => {
                info!(
                    "Rollout of {} at {} queued at position {}",
                    service, request.commit_hash, position
                );
                None
            }
        }
    }

    fn spawn_rollouts(&self, first: RolloutRequest) -> JoinHandle<()> {
        let ctx = Arc::clone(&self.ctx);
        let book = self.book.clone();
        tokio::spawn(async move {
            let mut next = Some(first);
            while let Some(request) = next.take() {
                let service = request.service_name.clone();
                match rollout::drive(&ctx, request).await {
                    Outcome::Succeeded => info!("Rollout of {} succeeded", service),
                    Outcome::Aborted(reason) => warn!("Rollout of {} aborted: {}", service, reason),
                }
                next = book.finish(&service).await;
                if let Some(queued) = &next {
                    info!(
                        "Starting queued rollout of {} at {}",
                        service, queued.commit_hash
                    );
                }
            }
        })
    }

    /// Main loop: submissions and the two audit timers, one at a time.
    /// Returns once the submission channel closes.
    pub async fn run(self, mut submissions: mpsc::Receiver<RolloutRequest>) {
        let mut fleet = interval_at(
            Instant::now() + self.fleet_audit_every,
            self.fleet_audit_every,
        );
        let mut registrations = interval_at(
            Instant::now() + self.registration_audit_every,
            self.registration_audit_every,
        );
        fleet.set_missed_tick_behavior(MissedTickBehavior::Delay);
        registrations.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            "Scheduler running with {} services on {} nodes",
            self.ctx.catalog.services.len(),
            self.ctx.catalog.nodes.len()
        );
        loop {
            tokio::select! {
                request = submissions.recv() => match request {
                    Some(request) => {
                        self.submit(request).await;
                    }
                    None => {
                        info!("Submission channel closed, scheduler loop exiting");
                        break;
                    }
                },
                _ = fleet.tick() => {
                    audit::fleet(&self.ctx).await;
                }
                _ = registrations.tick() => {
                    audit::registrations_check(&self.ctx).await;
                }
            }
        }
    }
}
