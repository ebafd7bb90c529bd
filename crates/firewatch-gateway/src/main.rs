use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use firewatch_core::FirewatchConfig;
use firewatch_fetch::{HttpTransport, ReqwestTransport};
use firewatch_scheduler::RoutineControl;
use firewatch_sync::{DispatchRoutine, RecordStore, SqliteStore};
use tracing::{info, warn};

mod app;
mod http;
mod registry;

use registry::{ResyncTrigger, RoutineRegistry};

#[derive(Debug, Parser)]
#[command(name = "firewatch-gateway", version, about = "Dispatch feed poller and control surface")]
struct Cli {
    /// Path to firewatch.toml. Falls back to FIREWATCH_CONFIG.
    #[arg(long, short)]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "firewatch_gateway=info,firewatch_scheduler=info,firewatch_sync=info,\
                 firewatch_fetch=info,tower_http=debug"
                    .into()
            }),
        )
        .init();

    // explicit flag > FIREWATCH_CONFIG env > ~/.firewatch/firewatch.toml
    let cli = Cli::parse();
    let config_path = cli.config.or_else(|| std::env::var("FIREWATCH_CONFIG").ok());
    let config = FirewatchConfig::load(config_path.as_deref()).unwrap_or_else(|e| {
        warn!("Config load failed ({}), using defaults", e);
        FirewatchConfig::default()
    });
    let config = Arc::new(config);

    let db_path = &config.database.path;
    info!(path = %db_path, "opening SQLite database");
    let store: Arc<dyn RecordStore> = Arc::new(SqliteStore::open(db_path)?);

    let transport: Arc<dyn HttpTransport> =
        Arc::new(ReqwestTransport::new(config.upstream.timeout())?);

    let dispatch = Arc::new(DispatchRoutine::new(Arc::clone(&config), store, transport).spawn());
    let mut routines = RoutineRegistry::new();
    let control: Arc<dyn RoutineControl> = dispatch.clone();
    let resync: Arc<dyn ResyncTrigger> = dispatch.clone();
    routines.register(control, Some(resync));

    let state = Arc::new(app::AppState::new(Arc::clone(&config), routines));
    let router = app::build_router(Arc::clone(&state));

    let addr: SocketAddr = format!("{}:{}", config.gateway.bind, config.gateway.port).parse()?;
    info!("Firewatch gateway listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;

    if config.dispatch.auto_start {
        // The first poll can take a while; do not hold up the listener.
        tokio::spawn(async move {
            match dispatch.start().await {
                Ok(status) => info!(executions = status.execution_count, "dispatch auto-started"),
                Err(e) => warn!(error = %e, "dispatch auto-start failed"),
            }
        });
    }

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    state.routines.stop_all("gateway shutdown").await;
    info!("Firewatch gateway stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    info!("shutdown signal received");
}
