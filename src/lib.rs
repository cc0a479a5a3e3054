//! elasticalert -- Leader-elected rule evaluation and alerting for search indices.
//!
//! This crate provides the rule loader, the per-rule scheduler and its
//! evaluators, shared dedup, alert dispatch, leader election, and the admin
//! HTTP surface.

pub mod api;
pub mod config;
pub mod controller;
pub mod dedup;
pub mod dispatch;
pub mod error;
pub mod evaluator;
pub mod leader;
pub mod rules;
pub mod scheduler;
pub mod search;
pub mod status;
pub mod storage;

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::{AppConfig, DedupBackend};
use crate::controller::{Controller, ControllerHandle, ServicesBuilder};
use crate::dedup::{DedupStore, MemoryDedupStore, SqliteDedupStore};
use crate::dispatch::AlertDispatcher;
use crate::leader::{LeaderElector, LeaseElector, StandaloneElector};
use crate::scheduler::clock::Clock;
use crate::scheduler::{Services, SystemClock};
use crate::search::ElasticGateway;
use crate::storage::Pool;

/// Builds services from a configuration. The memory dedup store is created
/// once so silences survive a config swap.
pub fn services_builder(pool: Pool) -> ServicesBuilder {
    let memory = Arc::new(MemoryDedupStore::new());
    Box::new(move |config: &AppConfig| {
        let dedup: Arc<dyn DedupStore> = match config.dedup.backend {
            DedupBackend::Sqlite => Arc::new(SqliteDedupStore::new(pool.clone())),
            DedupBackend::Memory => memory.clone(),
        };
        Ok(Services {
            gateway: Arc::new(ElasticGateway::new(&config.search)?),
            dedup,
            dispatcher: Arc::new(AlertDispatcher::from_config(&config.alert)?),
            settings: config.scheduler.clone(),
        })
    })
}

/// Start the daemon: leader election, lifecycle controller, admin server.
///
/// Returns after SIGINT/SIGTERM once in-flight cycles have drained.
pub async fn serve(config: AppConfig, config_path: Option<PathBuf>) -> Result<()> {
    // 1. Storage
    info!(path = %config.storage.path.display(), "initializing database");
    let pool = storage::open_pool(&config.storage.path)?;

    // 2. Search backend reachability
    if config.search.verify_on_start {
        ElasticGateway::new(&config.search)?
            .ping()
            .await
            .context("search backend is not reachable")?;
        info!(addresses = config.search.addresses.len(), "search backend reachable");
    }

    // 3. Controller
    let identity = config.leader_election.resolve_identity();
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let (controller, handle) = Controller::new(
        config.clone(),
        services_builder(pool.clone()),
        clock.clone(),
        &identity,
    )?;
    let controller_task = tokio::spawn(controller.run());

    // 4. Leader election
    let elector: Arc<dyn LeaderElector> = if config.leader_election.enabled {
        Arc::new(LeaseElector::new(pool, &config.leader_election, clock).with_identity(&identity))
    } else {
        Arc::new(StandaloneElector::new(&identity))
    };
    let shutdown = CancellationToken::new();
    let (events_tx, events_rx) = mpsc::channel(16);
    let elector_task = {
        let elector = elector.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move { elector.run(events_tx, shutdown).await })
    };
    let forwarder = {
        let handle = handle.clone();
        tokio::spawn(async move { handle.forward_leadership(events_rx).await })
    };

    // 5. Admin server
    if config.server.enabled {
        let addr: SocketAddr = config
            .server
            .listen_addr
            .parse()
            .with_context(|| format!("invalid listen address: {}", config.server.listen_addr))?;
        let app = api::router(api::state::AppState {
            controller: handle.clone(),
            exporter_enabled: config.exporter.enabled,
        });
        let listener = tokio::net::TcpListener::bind(addr).await?;
        info!(%addr, "admin server listening");
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async move { shutdown.cancelled().await })
                .await;
            if let Err(e) = result {
                error!(error = %e, "admin server failed");
            }
        });
    }

    wait_for_signals(&handle, config_path.as_deref()).await?;

    // Drain the scheduler before giving up the lease.
    handle.shutdown().await;
    if let Err(e) = controller_task.await {
        warn!(error = %e, "controller task ended abnormally");
    }
    shutdown.cancel();
    if let Err(e) = elector_task.await {
        warn!(error = %e, "elector task ended abnormally");
    }
    forwarder.abort();
    info!("elasticalert stopped");
    Ok(())
}

/// Handle SIGHUP (config reload) until SIGINT or SIGTERM.
async fn wait_for_signals(handle: &ControllerHandle, config_path: Option<&Path>) -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangup = signal(SignalKind::hangup())?;
    let mut terminate = signal(SignalKind::terminate())?;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("received SIGINT, shutting down");
                return Ok(());
            }
            _ = terminate.recv() => {
                info!("received SIGTERM, shutting down");
                return Ok(());
            }
            _ = hangup.recv() => {
                info!("received SIGHUP, reloading configuration");
                match AppConfig::resolve(config_path) {
                    Ok((config, _)) => {
                        handle.set_config(config).await;
                    }
                    Err(e) => {
                        error!(error = %e, "configuration reload failed, keeping the current one");
                    }
                }
            }
        }
    }
}
