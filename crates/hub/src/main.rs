mod access;
mod config;
mod db;
mod health;
mod ingest;
mod model;
mod scheduler;
mod state;
mod threshold;
mod web;

use anyhow::Result;
use std::env;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use db::Db;
use state::SystemState;
use web::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // ── Env config ──────────────────────────────────────────────────
    let db_url = env::var("DB_URL")
        .unwrap_or_else(|_| "sqlite:plant-monitor.db?mode=rwc".to_string());
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());

    // ── Database ────────────────────────────────────────────────────
    let db = Db::connect(&db_url).await?;
    db.migrate().await?;

    // ── Config file (seed zones, devices, sensors, plants, schedules) ─
    let cfg = config::load(&config_path)?;
    config::apply(&cfg, &db).await?;
    let offset = cfg.hub.utc_offset()?;

    let summary = db.system_summary().await?;
    if summary.total_plants == 0 {
        warn!("no plants configured yet");
    }
    info!(
        plants = summary.total_plants,
        sensors = summary.total_sensors,
        devices = summary.total_devices,
        active_alerts = summary.active_alerts,
        "db ready"
    );

    // ── Shared state (ephemeral, for /api/status) ───────────────────
    let shared = SystemState::shared();
    shared.write().await.record_system("hub started".to_string());

    // ── Scheduler ───────────────────────────────────────────────────
    let sweeper = tokio::spawn(scheduler::run(
        db.clone(),
        shared.clone(),
        cfg.hub.sweep_interval(),
        offset,
    ));

    // ── Web server ──────────────────────────────────────────────────
    let app = AppState {
        db,
        shared,
        health_window_days: cfg.hub.health_window_days,
        utc_offset: offset,
    };
    let result = web::serve(app).await;
    if let Err(e) = &result {
        error!("web server stopped: {e:#}");
    }
    sweeper.abort();
    result
}
