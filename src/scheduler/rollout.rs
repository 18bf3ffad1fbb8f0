//! Rollout state machine and the task that drives it.
//!
//! A rollout publishes one unit, waits for the node agent's
//! acknowledgment on `rolling-update-<service>`, and only then publishes
//! the next.  Every way out (success, node failure, malformed
//! acknowledgment, store failure, timeout) is a transition of
//! [`Rollout`]; the driver only performs the I/O the transition asks for.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use log::{error, info, warn};
use tokio::time::Instant;

use super::design::design_units;
use crate::config::Catalog;
use crate::error::DesignError;
use crate::keys;
use crate::notify::{deliver, Journal, Notifier};
use crate::store::{put_json, CoordinationStore, EventKind};
use crate::types::{DeploymentUnit, RolloutRequest};

/// Why a rollout stopped before every unit was acknowledged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AbortReason {
    NoEligibleNodes,
    Unplaceable(DesignError),
    NodeFailure { node: String },
    MalformedAck(String),
    Store(String),
    Timeout,
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoEligibleNodes => write!(f, "no deployable units (unknown service or no eligible nodes)"),
            Self::Unplaceable(e) => write!(f, "no deployable units: {e}"),
            Self::NodeFailure { node } => write!(f, "replica failed to start on {node}"),
            Self::MalformedAck(raw) => write!(f, "malformed feedback {raw:?}"),
            Self::Store(e) => write!(f, "store failure: {e}"),
            Self::Timeout => write!(f, "rolling update timeout"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Succeeded,
    Aborted(AbortReason),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RolloutPhase {
    Idle,
    /// Unit `awaiting` has been published and not yet acknowledged.
    Rolling { awaiting: usize },
    Aborting(AbortReason),
    Completed(Outcome),
}

/// Inputs to the state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Signal {
    Ack(bool),
    MalformedAck(String),
    PublishFailed(String),
    WatchLost,
    TimedOut,
}

/// What the driver must do next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    Publish(usize),
    Wait,
    Succeed,
    Abort(AbortReason),
}

#[derive(Debug)]
pub struct Rollout {
    pub request: RolloutRequest,
    pub units: Vec<DeploymentUnit>,
    phase: RolloutPhase,
}

impl Rollout {
    pub fn new(request: RolloutRequest, units: Vec<DeploymentUnit>) -> Self {
        Self {
            request,
            units,
            phase: RolloutPhase::Idle,
        }
    }

    pub fn phase(&self) -> &RolloutPhase {
        &self.phase
    }

    pub fn start(&mut self) -> Step {
        if self.phase != RolloutPhase::Idle {
            return Step::Wait;
        }
        if self.units.is_empty() {
            self.abort(AbortReason::NoEligibleNodes)
        } else {
            self.phase = RolloutPhase::Rolling { awaiting: 0 };
            Step::Publish(0)
        }
    }

    pub fn on_signal(&mut self, signal: Signal) -> Step {
        let awaiting = match self.phase {
            RolloutPhase::Rolling { awaiting } => awaiting,
            _ => return Step::Wait,
        };
        match signal {
            Signal::Ack(true) if awaiting + 1 >= self.units.len() => {
                self.phase = RolloutPhase::Completed(Outcome::Succeeded);
                Step::Succeed
            }
            Signal::Ack(true) => {
                self.phase = RolloutPhase::Rolling {
                    awaiting: awaiting + 1,
                };
                Step::Publish(awaiting + 1)
            }
            Signal::Ack(false) => self.abort(AbortReason::NodeFailure {
                node: self.units[awaiting].node.clone(),
            }),
            Signal::MalformedAck(raw) => self.abort(AbortReason::MalformedAck(raw)),
            Signal::PublishFailed(e) => self.abort(AbortReason::Store(e)),
            Signal::WatchLost => {
                self.abort(AbortReason::Store("acknowledgment watch closed".into()))
            }
            Signal::TimedOut => self.abort(AbortReason::Timeout),
        }
    }

    /// Aborts a rollout that never started, e.g. because its service
    /// could not be placed.
    pub fn refuse(&mut self, reason: AbortReason) -> Step {
        if self.phase != RolloutPhase::Idle {
            return Step::Wait;
        }
        self.abort(reason)
    }

    fn abort(&mut self, reason: AbortReason) -> Step {
        self.phase = RolloutPhase::Aborting(reason.clone());
        Step::Abort(reason)
    }

    /// Moves an aborting or succeeded rollout to `Completed` and returns
    /// how it ended.
    pub fn finish(&mut self) -> Outcome {
        let outcome = match &self.phase {
            RolloutPhase::Completed(outcome) => outcome.clone(),
            RolloutPhase::Aborting(reason) => Outcome::Aborted(reason.clone()),
            RolloutPhase::Idle | RolloutPhase::Rolling { .. } => {
                Outcome::Aborted(AbortReason::Store("rollout finished while in flight".into()))
            }
        };
        self.phase = RolloutPhase::Completed(outcome.clone());
        outcome
    }
}

/// Parses an acknowledgment payload.  Accepts the usual boolean
/// spellings (`true`, `false`, `1`, `0`, `t`, `f`, any case).
pub fn parse_ack(raw: &[u8]) -> Result<bool, String> {
    let text = String::from_utf8_lossy(raw);
    match text.trim().to_ascii_lowercase().as_str() {
        "true" | "t" | "1" => Ok(true),
        "false" | "f" | "0" => Ok(false),
        _ => Err(text.into_owned()),
    }
}

/// Shared collaborators of every rollout task.
pub struct RolloutContext {
    pub store: Arc<dyn CoordinationStore>,
    pub notifier: Arc<dyn Notifier>,
    pub catalog: Arc<Catalog>,
    pub recipients: Vec<String>,
    pub timeout: Duration,
    /// Store address handed to containers.
    pub store_endpoint: String,
}

pub fn subject(service: &str) -> String {
    format!("Rolling-Update-Info, service-name: {service}")
}

/// Runs one rollout to a terminal state, cleans up its acknowledgment
/// key and sends the consolidated notification.
pub async fn drive(ctx: &RolloutContext, request: RolloutRequest) -> Outcome {
    let service = request.service_name.clone();
    let commit = request.commit_hash.clone();
    let mut journal = Journal::new();
    journal.record(format!(
        "Rolling-Info: service: {service}, commitHash: {commit}, rolling-update start"
    ));
    info!("Rolling update of {} at {} started", service, commit);

    let design = match ctx.catalog.service(&service) {
        Some(cfg) => design_units(
            cfg,
            &ctx.catalog.nodes,
            &commit,
            request.create_time,
            &ctx.store_endpoint,
        ),
        None => {
            warn!("Rolling update requested for unknown service {}", service);
            Ok(Vec::new())
        }
    };
    let (units, refusal) = match design {
        Ok(units) => (units, None),
        Err(e) => (Vec::new(), Some(AbortReason::Unplaceable(e))),
    };
    let mut rollout = Rollout::new(request, units);
    let ack_key = keys::ack(&service);

    let mut step = match refusal {
        Some(reason) => rollout.refuse(reason),
        None => rollout.start(),
    };
    let mut published = 0;
    let mut watch = None;
    if let Step::Publish(_) = step {
        if let Err(e) = ctx.store.delete(&ack_key).await {
            warn!("Could not clear stale feedback {}: {}", ack_key, e);
        }
        match ctx.store.watch(&ack_key).await {
            Ok(w) => watch = Some(w),
            Err(e) => step = rollout.on_signal(Signal::PublishFailed(e.to_string())),
        }
    }

    let mut deadline = Instant::now() + ctx.timeout;
    loop {
        match step {
            Step::Publish(index) => {
                let unit = &rollout.units[index];
                let msg = format!(
                    "Rolling-Info: put unit {}/{} to store, image: {}, node: {}",
                    index + 1,
                    rollout.units.len(),
                    unit.full_name,
                    unit.node
                );
                info!("{}", msg);
                journal.record(msg);
                match put_json(ctx.store.as_ref(), &keys::unit(&unit.id), unit).await {
                    Ok(()) => {
                        published = index + 1;
                        deadline = Instant::now() + ctx.timeout;
                        step = Step::Wait;
                    }
                    Err(e) => {
                        error!("Put of unit {} failed: {}", unit.id, e);
                        step = rollout.on_signal(Signal::PublishFailed(e.to_string()));
                    }
                }
            }
            Step::Wait => {
                let Some(w) = watch.as_mut() else {
                    step = rollout.on_signal(Signal::WatchLost);
                    continue;
                };
                let signal = match tokio::time::timeout_at(deadline, w.recv()).await {
                    Err(_) => Signal::TimedOut,
                    Ok(None) => Signal::WatchLost,
                    Ok(Some(event)) if event.kind == EventKind::Delete => continue,
                    Ok(Some(event)) => match parse_ack(&event.value) {
                        Ok(ok) => Signal::Ack(ok),
                        Err(raw) => Signal::MalformedAck(raw),
                    },
                };
                let msg = format!(
                    "Rolling-Info: service: {service}, commitHash: {commit}, feedback: {signal:?}"
                );
                info!("{}", msg);
                journal.record(msg);
                step = rollout.on_signal(signal);
            }
            Step::Succeed => {
                journal.record(format!(
                    "Rolling-AllServ-Successful: service: {service}, all {} replicas run successfully",
                    rollout.units.len()
                ));
                break;
            }
            Step::Abort(reason) => {
                let msg = format!("Rolling-Error: service: {service}, commitHash: {commit}, {reason}");
                error!("{}", msg);
                journal.record(msg);
                break;
            }
        }
    }

    let outcome = rollout.finish();
    journal.record(format!("Rolling-Completed: service {service}: rolling-update completed"));
    // Published units have been delivered to their agents by now.
    for unit in &rollout.units[..published] {
        if let Err(e) = ctx.store.delete(&keys::unit(&unit.id)).await {
            warn!("Failed to delete unit {}: {}", unit.id, e);
        }
    }
    if let Err(e) = ctx.store.delete(&ack_key).await {
        error!("Failed to delete feedback key {}: {}", ack_key, e);
    }
    deliver(
        ctx.notifier.as_ref(),
        &ctx.recipients,
        &subject(&service),
        &mut journal,
    )
    .await;
    info!("Rolling update of {} finished: {:?}", service, outcome);
    outcome
}
