//! tablewatch -- log-driven issue monitor for a multiplayer card-game stack.
//!
//! This crate tails the game server log, classifies lines into issues,
//! correlates them into one focus group at a time, and walks each group through
//! investigation, pausing, fix verification and resumption.

pub mod api;
pub mod config;
pub mod control;
pub mod detect;
pub mod fix;
pub mod focus;
pub mod investigation;
pub mod monitor;
pub mod status;
pub mod storage;
pub mod tail;
pub mod verify;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::MonitorConfig;
use crate::control::{LocalControl, ServiceControl};
use crate::investigation::Investigator;
use crate::monitor::Monitor;

/// Records the control loop may have in flight to the recorder.
const RECORD_BUFFER: usize = 4096;

/// Start the tablewatch daemon: control loop, log tailer, fix watcher, status
/// writer, recorder and (optionally) the API server. Returns on Ctrl-C.
pub async fn serve(config: MonitorConfig) -> Result<()> {
    // 1. Initialize Storage
    let db_path = config.paths.database.clone();
    tracing::info!(db = %db_path.display(), "Initializing database");
    let pool = storage::open_pool(&db_path)?;
    let (store, load_warning) = storage::load_focus_state(&pool, config.store_settings())?;

    // 2. Collaborators
    let retry = config.retry_policy();
    let control: Arc<dyn ServiceControl> = Arc::new(
        LocalControl::new(config.services.clone(), config.client_bridge.clone(), retry.call_timeout)
            .context("failed to build service control client")?,
    );

    // 3. Control loop
    let mut investigator = Investigator::new(config.investigation_settings(), config.verification.clone(), store);
    if let Some(message) = load_warning {
        investigator.warn(message, chrono::Utc::now());
    }
    let (records_tx, records_rx) = mpsc::channel(RECORD_BUFFER);
    let (monitor, inbox) = Monitor::new(investigator, control.clone(), retry, config.verification.clone());
    let monitor = monitor.with_recorder(records_tx);
    let events = monitor.sender();
    let snapshots = monitor.subscribe();

    let shutdown = CancellationToken::new();
    let recorder = storage::spawn_recorder(pool.clone(), records_rx, events.clone());
    let poll = Duration::from_millis(config.log.poll_interval_ms);
    let mut tasks = vec![
        tail::spawn_tailer(
            tail::LogTailer::new(&config.log.path, config.log.start_at_end),
            poll,
            events.clone(),
            shutdown.clone(),
        ),
        fix::spawn_fix_watcher(config.paths.fix_file.clone(), poll, events.clone(), shutdown.clone()),
        status::spawn_status_writer(
            snapshots.clone(),
            config.paths.status_file.clone(),
            events.clone(),
            shutdown.clone(),
        ),
    ];
    if config.control.health_poll_secs > 0 {
        tasks.push(monitor::spawn_health_poller(
            control,
            Duration::from_secs(config.control.health_poll_secs),
            retry.call_timeout,
            events.clone(),
            shutdown.clone(),
        ));
    }
    let monitor_task = tokio::spawn(monitor.run(inbox, shutdown.clone()));

    // 4. Start API Server
    if config.api.enabled {
        let addr: std::net::SocketAddr = config
            .api
            .bind
            .parse()
            .with_context(|| format!("invalid api.bind '{}'", config.api.bind))?;
        let app = api::router(api::state::AppState {
            pool,
            snapshots,
            events,
        });
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind {}", addr))?;
        tracing::info!(%addr, "tablewatch API listening");

        let token = shutdown.clone();
        tasks.push(tokio::spawn(async move {
            let server = axum::serve(listener, app).with_graceful_shutdown(async move { token.cancelled().await });
            if let Err(e) = server.await {
                tracing::error!(error = %e, "API server failed");
            }
        }));
    } else {
        drop(events);
    }

    tracing::info!(log = %config.log.path.display(), "tablewatch running, Ctrl-C to stop");
    tokio::signal::ctrl_c().await.context("failed to listen for Ctrl-C")?;
    tracing::info!("shutting down");
    shutdown.cancel();

    for task in tasks {
        let _ = task.await;
    }
    // the monitor owns the last recorder sender; the recorder drains once it exits
    let _ = monitor_task.await;
    let _ = recorder.await;
    Ok(())
}
