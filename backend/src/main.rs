// main.rs

use gcs_backend::codec::MavlinkCodec;
use gcs_backend::config::GcsConfig;
use gcs_backend::db;
use gcs_backend::link::{spawn_link_task, LinkWorker};
use gcs_backend::mission::MissionEngine;
use gcs_backend::mission_task::mission_task;
use gcs_backend::state::AppState;
use gcs_backend::web;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cfg = GcsConfig::from_env();
    tracing::info!(
        "Link {} (MAVLink {:?}), GCS {}/{}, target {}/{}",
        cfg.link.describe(),
        cfg.mavlink_version,
        cfg.system_id,
        cfg.component_id,
        cfg.target_system,
        cfg.target_component
    );

    // --- DB ---
    let db = db::open(&cfg.db_path).await?;

    // --- Channels ---
    let (cmd_tx, cmd_rx) = mpsc::channel(32);
    let (inbound_tx, inbound_rx) = mpsc::channel(64);
    let (outbound_tx, outbound_rx) = mpsc::channel(64);
    let (message_tx, message_rx) = mpsc::channel(32);
    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    // --- Shared state ---
    let state = Arc::new(AppState::new(db, cmd_tx, message_tx));

    // --- Background tasks ---
    let link = spawn_link_task(
        cfg.link.clone(),
        LinkWorker {
            label: cfg.link.describe(),
            codec: MavlinkCodec::new(cfg.mavlink_version),
            system_id: cfg.system_id,
            component_id: cfg.component_id,
            inbound_tx,
            outbound_rx,
            message_rx,
            telemetry_tx: state.telemetry_tx.clone(),
            shutdown_rx: shutdown_tx.subscribe(),
        },
    );
    let mission = tokio::spawn(mission_task(
        state.clone(),
        MissionEngine::new(cfg.engine()),
        cmd_rx,
        inbound_rx,
        outbound_tx,
        shutdown_tx.subscribe(),
    ));

    // --- Webserver ---
    let app = web::router(state.clone());
    let listener = tokio::net::TcpListener::bind(&cfg.http_addr).await?;
    tracing::info!("Serving on http://{}", cfg.http_addr);

    let shutdown_for_server = shutdown_tx.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for ctrl-c: {e}");
            }
            tracing::info!("Shutting down");
            let _ = shutdown_for_server.send(());
        })
        .await?;

    // Server may also exit on its own; make sure the tasks hear about it.
    let _ = shutdown_tx.send(());
    if let Err(e) = mission.await {
        tracing::error!("Mission task ended abnormally: {e}");
    }
    if let Err(e) = link.await {
        tracing::error!("Link task ended abnormally: {e}");
    }
    state.wait_for_db_writes().await;
    state.db.close().await;
    Ok(())
}
