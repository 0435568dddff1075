use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use herald_core::config::HeraldConfig;
use herald_push::{DryRunGateway, FcmGateway, PushGateway, SqliteTokenRegistry};
use herald_scheduler::{
    DeliveryExecutor, JobStore, NotificationScheduler, RetryPolicy, SchedulerLoop, SqliteJobStore,
};
use tracing::{info, warn};

mod app;
mod http;

/// Push-notification dispatch and scheduling service.
#[derive(Parser, Debug)]
#[command(name = "herald", version, about)]
struct Cli {
    /// Path to herald.toml (defaults to ~/.herald/herald.toml).
    #[arg(short, long, env = "HERALD_CONFIG")]
    config: Option<String>,

    /// Override the listen port from the config file.
    #[arg(short, long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "herald_server=info,herald_scheduler=info,herald_push=info,tower_http=debug".into()
            }),
        )
        .init();

    let cli = Cli::parse();
    let mut config = HeraldConfig::load(cli.config.as_deref()).unwrap_or_else(|e| {
        warn!("Config load failed ({}), using defaults", e);
        HeraldConfig::default()
    });
    if let Some(port) = cli.port {
        config.server.port = port;
    }

    // One SQLite file; the job store and the token registry each get a connection.
    let db_path = config.database.path.clone();
    ensure_parent_dir(&db_path);
    info!(path = %db_path, "opening SQLite database");
    let busy = config.database.busy_timeout();
    let store: Arc<dyn JobStore> = Arc::new(SqliteJobStore::new(
        herald_scheduler::db::open(&db_path, busy)?,
        RetryPolicy::from(&config.scheduler.retry),
    )?);
    let registry = Arc::new(SqliteTokenRegistry::new(herald_scheduler::db::open(
        &db_path, busy,
    )?)?);
    info!("database migrations complete");

    let gateway: Arc<dyn PushGateway> = match config.push.fcm {
        Some(ref fcm) => {
            info!(project_id = %fcm.project_id, "push gateway: FCM");
            Arc::new(FcmGateway::new(fcm))
        }
        None => {
            warn!("No [push.fcm] section configured; notifications are logged, not sent");
            Arc::new(DryRunGateway::new())
        }
    };

    let executor = Arc::new(DeliveryExecutor::new(
        gateway.clone(),
        registry.clone(),
        config.push.send_timeout(),
        config.push.fanout_limit,
    ));
    let scheduler = NotificationScheduler::new(
        store.clone(),
        executor.clone(),
        config.scheduler.misfire_grace(),
    );

    for recurring in &config.recurring {
        match scheduler.ensure_recurring(recurring) {
            Ok(outcome) => info!(name = %recurring.name, ?outcome, "recurring job ready"),
            Err(e) => warn!(name = %recurring.name, error = %e, "recurring job rejected"),
        }
    }

    // spawn scheduler loop in background
    let engine = SchedulerLoop::new(store, executor, &config.scheduler);
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let engine_task = tokio::spawn(async move { engine.run(shutdown_rx).await });

    let addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port).parse()?;
    let state = Arc::new(app::AppState::new(config, scheduler, registry, gateway));
    let router = app::build_router(state);

    info!("Herald listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // signal scheduler to stop and let in-flight jobs finish
    let _ = shutdown_tx.send(true);
    if let Err(e) = engine_task.await {
        warn!(error = %e, "scheduler task ended abnormally");
    }
    info!("Herald stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}

/// Ensure the parent directory for a file path exists.
fn ensure_parent_dir(path: &str) {
    if let Some(parent) = std::path::Path::new(path).parent() {
        let _ = std::fs::create_dir_all(parent);
    }
}
