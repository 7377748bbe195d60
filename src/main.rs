//! Process wiring for the ingestion pipeline.
//!
//! Single-process deployment: scheduler, live loop, frame aggregator and
//! fan-out bridge run as tasks over one shared tick store, with the
//! operator surface and subscriber WebSocket served by axum.

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower_http::cors::CorsLayer;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use footybrain_backend::api::{self, AppState, HealthFlag, HealthStatus};
use footybrain_backend::bridge::Bridge;
use footybrain_backend::config::{AppConfig, IngestSettings, SettingsHandle};
use footybrain_backend::live::LiveLoop;
use footybrain_backend::metrics::Metrics;
use footybrain_backend::scheduler::{JobContext, Scheduler};
use footybrain_backend::store::{FrameAggregator, TickStore};
use footybrain_backend::upstream::{ApiFootballClient, RateGovernor};

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "footybrain_backend=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() {
    init_tracing();
    let code = match run().await {
        Ok(code) => code,
        Err(e) => {
            error!(error = %e, "fatal init failure");
            1
        }
    };
    std::process::exit(code);
}

async fn run() -> Result<i32> {
    let cfg = AppConfig::from_env().context("failed to read configuration")?;
    info!(
        base_url = %cfg.upstream_base_url,
        key = %cfg.masked_key(),
        db = %cfg.db_path,
        "starting ingestion pipeline"
    );
    if let Some(bus) = &cfg.bus_dsn {
        info!(bus = %bus, "BUS_DSN set but unused: single-process deployment fans out in-memory");
    }

    let metrics = Arc::new(Metrics::new());
    let store = Arc::new(
        TickStore::new(&cfg.db_path, metrics.clone()).context("tick store init failed")?,
    );
    store.seed_jobs_if_missing().context("job catalog seed failed")?;

    // Settings: persisted snapshot wins over the seed file.
    let settings = match store.config_get("ingest_settings")? {
        Some(raw) => {
            let parsed: IngestSettings =
                serde_json::from_str(&raw).context("stored ingest settings corrupt")?;
            SettingsHandle::new(parsed)
        }
        None => SettingsHandle::from_file(cfg.config_path.as_deref())
            .context("config file load failed")?,
    };

    let governor = RateGovernor::new(cfg.rate.clone());
    let client = ApiFootballClient::new(&cfg, governor.clone(), metrics.clone())
        .context("upstream client init failed")?;

    let live = Arc::new(LiveLoop::new(
        &cfg,
        store.clone(),
        client.clone(),
        settings.clone(),
        metrics.clone(),
    ));
    let frames = Arc::new(FrameAggregator::new(store.clone(), metrics.clone()));
    let bridge = Bridge::new(store.clone(), metrics.clone());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let ctx = Arc::new(JobContext::new(
        store.clone(),
        live,
        frames,
        client,
        settings.clone(),
    ));
    let scheduler = Scheduler::spawn(
        store.clone(),
        ctx,
        metrics.clone(),
        shutdown_rx.clone(),
    );
    tokio::spawn(bridge.clone().run(shutdown_rx.clone()));

    let health = Arc::new(HealthFlag::default());
    tokio::spawn(dependency_watchdog(
        store.clone(),
        metrics.clone(),
        health.clone(),
        cfg.fatal_after,
        shutdown_rx.clone(),
    ));
    tokio::spawn(pool_pressure_watchdog(store.clone(), shutdown_rx.clone()));

    let state = AppState {
        store,
        metrics,
        governor,
        settings,
        scheduler,
        bridge,
        health,
    };
    let app = api::router(state).layer(CorsLayer::permissive());

    let listener = TcpListener::bind(&cfg.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", cfg.bind_addr))?;
    info!(addr = %cfg.bind_addr, "operator surface listening");

    let server = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!(error = %e, "server error");
        }
    });

    tokio::signal::ctrl_c().await.ok();
    info!(
        drain_secs = cfg.drain_timeout.as_secs(),
        "shutdown signal received, draining"
    );
    let _ = shutdown_tx.send(true);
    // Workers observe the flag and finish or cancel; give them the drain
    // window before the process exits.
    tokio::time::sleep(cfg.drain_timeout.min(Duration::from_secs(30))).await;
    server.abort();
    info!("shutdown complete");
    Ok(0)
}

/// Samples store connection utilization four times a second and logs when
/// it has stayed above 80% for more than 30 s.
async fn pool_pressure_watchdog(store: Arc<TickStore>, mut shutdown: watch::Receiver<bool>) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(250)) => {}
            _ = shutdown.changed() => return,
        }
        if let Some(pressure) = store.sample_pool_usage() {
            warn!(
                utilization_pct = (pressure.utilization * 100.0).round() as u32,
                sustained_secs = pressure.sustained.as_secs(),
                "store connection utilization above 80% for over 30s"
            );
        }
    }
}

/// Watches the store; sustained loss flips the health flag and, past the
/// fatal window, terminates the process with exit code 2.
async fn dependency_watchdog(
    store: Arc<TickStore>,
    metrics: Arc<Metrics>,
    health: Arc<HealthFlag>,
    fatal_after: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut db_down_since: Option<Instant> = None;
    let mut last_unavailable = 0u64;
    loop {
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs(10)) => {}
            _ = shutdown.changed() => return,
        }

        let db_ok = store.config_get("frame_watermark_ms").is_ok();
        let unavailable = metrics
            .upstream_unavailable
            .load(std::sync::atomic::Ordering::Relaxed);
        let upstream_degraded = unavailable > last_unavailable;
        last_unavailable = unavailable;

        if db_ok {
            db_down_since = None;
            health.set(if upstream_degraded {
                HealthStatus::Degraded
            } else {
                HealthStatus::Ok
            });
        } else {
            let since = *db_down_since.get_or_insert_with(Instant::now);
            health.set(HealthStatus::Down);
            warn!(down_secs = since.elapsed().as_secs(), "tick store unreachable");
            if since.elapsed() > fatal_after {
                error!("tick store lost beyond the fatal window, exiting");
                std::process::exit(2);
            }
        }
    }
}
