//! Flotilla: rolling deployments, node agents and a registry gateway
//! coordinated through a watchable key-value store.

pub mod agent;
pub mod config;
pub mod error;
pub mod gateway;
pub mod keys;
pub mod notify;
pub mod registration;
pub mod runtime;
pub mod scheduler;
pub mod store;
pub mod types;
