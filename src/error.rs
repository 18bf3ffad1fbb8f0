//! Error types shared across the scheduler, agent and gateway.
//!
//! Each concern gets its own enum so callers can decide what is fatal:
//! only a store failure during startup ends the process, everything else
//! is logged and absorbed by the owning loop.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

/// Failures talking to the coordination store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("store request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("malformed store response: {0}")]
    Decode(String),

    #[error("unknown lease {0}")]
    UnknownLease(i64),

    #[error("watch closed")]
    WatchClosed,
}

/// Failures from the local container runtime.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("docker error: {0}")]
    Docker(#[from] bollard::errors::Error),

    #[error("pull of {image} failed: {reason}")]
    Pull { image: String, reason: String },

    #[error("run of {image} failed: {reason}")]
    Run { image: String, reason: String },

    #[error("missing required environment: {0}")]
    MissingPorts(String),
}

/// An image reference that does not have the `registry/name:version` shape.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("malformed image reference {0:?}")]
pub struct ImageRefError(pub String);

/// Why a service could not be placed on the node pool.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DesignError {
    #[error("no eligible nodes (public network required: {need_public})")]
    NoEligibleNodes { need_public: bool },

    #[error("{wanted} replicas wanted but only {eligible} eligible nodes")]
    InsufficientNodes { wanted: usize, eligible: usize },
}

/// Why a node agent could not bring a replica up.
#[derive(Debug, Error)]
pub enum ApplyError {
    #[error(transparent)]
    Image(#[from] ImageRefError),

    #[error(transparent)]
    Runtime(#[from] RuntimeError),
}

/// Failures delivering an operator notification.
#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("webhook delivery failed: {0}")]
    Webhook(#[from] reqwest::Error),

    #[error("webhook rejected notification with status {0}")]
    Rejected(u16),
}

/// Errors surfaced to gateway clients.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("no service")]
    NoService(String),

    #[error("invalid request: {0}")]
    BadRequest(String),

    #[error("upstream request failed: {0}")]
    Upstream(String),
}

impl GatewayError {
    pub const fn status_code(&self) -> StatusCode {
        match self {
            Self::NoService(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Upstream(_) => StatusCode::BAD_GATEWAY,
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        (self.status_code(), self.to_string()).into_response()
    }
}

/// Problems with the static configuration or catalog.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] Box<figment::Error>),

    #[error("cannot determine node name: set FLOTILLA_NODE_NAME or HOSTNAME")]
    NodeName,

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        Self::Load(Box::new(err))
    }
}
