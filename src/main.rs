//! Flotilla daemon entry point.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use log::{error, info, warn};
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::mpsc;

use flotilla::agent::NodeAgent;
use flotilla::config::{Catalog, Config, Role};
use flotilla::gateway::{self, proxy, RoutingTable};
use flotilla::notify::{LogNotifier, Notifier, WebhookNotifier};
use flotilla::registration::{registration_from_env, Registrar};
use flotilla::runtime::{ContainerRuntime, DockerRuntime};
use flotilla::scheduler::{self, Scheduler, SchedulerOptions};
use flotilla::store::{CoordinationStore, EtcdStore, MemoryStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    env_logger::init();

    // Load configuration
    let cfg = Config::load()?;
    info!("Starting flotilla {:?} with config: {:?}", cfg.role, cfg);

    // Coordination store; nothing works without it
    let store = connect_store(&cfg).await?;

    match cfg.role {
        Role::Scheduler => run_scheduler(cfg, store).await,
        Role::Agent => run_agent(cfg, store).await,
        Role::Gateway => run_gateway(cfg, store).await,
        Role::Register => run_register(cfg, store).await,
    }
}

async fn connect_store(cfg: &Config) -> anyhow::Result<Arc<dyn CoordinationStore>> {
    match &cfg.store.endpoint {
        Some(endpoint) => {
            let timeout = Duration::from_secs(cfg.store.dial_timeout_secs);
            let store = EtcdStore::connect(endpoint, timeout)
                .await
                .with_context(|| format!("cannot connect to store at {endpoint}"))?;
            Ok(Arc::new(store))
        }
        None => {
            warn!("No store endpoint configured, using an in-process store");
            Ok(Arc::new(MemoryStore::new()))
        }
    }
}

async fn shutdown_signal() {
    match signal::ctrl_c().await {
        Ok(()) => info!("Received Ctrl+C, shutting down..."),
        Err(err) => error!("Unable to listen for shutdown signal: {}", err),
    }
}

async fn run_scheduler(cfg: Config, store: Arc<dyn CoordinationStore>) -> anyhow::Result<()> {
    let catalog = Catalog::load(&cfg.scheduler.catalog_file)?;
    let notifier: Arc<dyn Notifier> = match &cfg.scheduler.webhook_url {
        Some(url) => Arc::new(WebhookNotifier::new(url.clone())?),
        None => Arc::new(LogNotifier),
    };
    let scheduler = Scheduler::new(store, notifier, catalog, SchedulerOptions::from_config(&cfg));

    // Submission channel between the HTTP intake and the scheduler loop
    let (submit_tx, submit_rx) = mpsc::channel(128);
    let loop_handle = tokio::spawn(scheduler.run(submit_rx));

    let listener = TcpListener::bind(cfg.scheduler.bind).await?;
    info!("Scheduler listening on {}", cfg.scheduler.bind);
    let app = scheduler::http::router(&cfg.scheduler.api_prefix, submit_tx);
    let http_handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!("Scheduler HTTP server failed: {}", e);
        }
    });

    shutdown_signal().await;
    http_handle.abort();
    loop_handle.abort();
    info!("Shutdown complete.");
    Ok(())
}

async fn run_agent(cfg: Config, store: Arc<dyn CoordinationStore>) -> anyhow::Result<()> {
    let node = cfg.node_name()?;
    let runtime: Arc<dyn ContainerRuntime> = Arc::new(DockerRuntime::connect()?);
    let agent = NodeAgent::new(node, store, runtime, cfg.retry_interval());
    agent.run(shutdown_signal()).await;
    info!("Shutdown complete.");
    Ok(())
}

async fn run_gateway(cfg: Config, store: Arc<dyn CoordinationStore>) -> anyhow::Result<()> {
    let table = RoutingTable::default();
    let sync_handle = tokio::spawn(gateway::sync(table.clone(), store));

    let listener = TcpListener::bind(cfg.gateway.bind).await?;
    info!("Gateway listening on {}", cfg.gateway.bind);
    let app = proxy::router(table, &cfg.gateway.route_prefix);
    let http_handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!("Gateway HTTP server failed: {}", e);
        }
    });

    shutdown_signal().await;
    http_handle.abort();
    sync_handle.abort();
    info!("Shutdown complete.");
    Ok(())
}

async fn run_register(cfg: Config, store: Arc<dyn CoordinationStore>) -> anyhow::Result<()> {
    let registration = registration_from_env(|key| std::env::var(key).ok())?;
    let container_id = cfg.node_name()?;
    let registrar = Arc::new(Registrar::new(
        store,
        registration,
        container_id,
        Duration::from_secs(cfg.registration.ttl_secs),
        Duration::from_secs(cfg.registration.heartbeat_secs),
    ));
    registrar.register().await?;
    info!("Registered {}", registrar.key());

    let beating = Arc::clone(&registrar);
    let heartbeat_handle = tokio::spawn(async move { beating.keep_alive().await });

    shutdown_signal().await;
    heartbeat_handle.abort();
    if let Err(e) = registrar.deregister().await {
        error!("Deregistration failed: {}", e);
    }
    info!("Shutdown complete.");
    Ok(())
}
