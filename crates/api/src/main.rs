//! API server entry point.

use std::sync::Arc;

use api::config::{Config, LogFormat};
use event_store::{EventStore, InMemoryEventStore, PostgresEventStore};
use metrics_exporter_prometheus::PrometheusHandle;
use saga::{
    DedupeLedger, InMemoryDedupeLedger, InMemoryWaitRegistry, PostgresDedupeLedger,
    PostgresWaitRegistry, TimeoutSweeper, WaitRegistry,
};
use tokio::signal;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Waits for a shutdown signal (SIGINT or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install SIGINT handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("received SIGINT, starting graceful shutdown");
        }
        () = terminate => {
            tracing::info!("received SIGTERM, starting graceful shutdown");
        }
    }
}

fn init_tracing(config: &Config) {
    let filter = EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    match config.log_format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        LogFormat::Pretty => registry.with(tracing_subscriber::fmt::layer()).init(),
    }
}

/// Recovers unfinished instances, then serves until a shutdown signal.
async fn serve<S: EventStore + Clone + 'static>(
    config: &Config,
    store: S,
    waits: Arc<dyn WaitRegistry>,
    ledger: Arc<dyn DedupeLedger>,
    metrics_handle: PrometheusHandle,
) -> Result<(), BoxError> {
    let (state, _services) = api::create_state(store, waits, ledger, config.engine_config())?;
    let _notification_log = api::spawn_notification_log(&state.notifications);

    // Re-drive anything a previous process left in flight
    let report = state.engine.recover().await?;
    tracing::info!(
        redriven = report.redriven,
        tokens_restored = report.tokens_restored,
        timeouts_fired = report.timeouts_fired,
        errors = report.errors,
        "startup recovery complete"
    );
    state.projection_processor.run_catch_up().await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let sweeper = TimeoutSweeper::new(state.engine.clone()).spawn(shutdown_rx);

    let app = api::create_app(state, metrics_handle);
    let addr = config.addr();
    tracing::info!(%addr, "starting API server");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    let _ = shutdown_tx.send(true);
    sweeper.await?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    let config = Config::from_env();

    // 1. Initialize tracing
    init_tracing(&config);

    // 2. Install Prometheus metrics recorder
    let metrics_handle = metrics_exporter_prometheus::PrometheusBuilder::new().install_recorder()?;

    // 3. Pick the stores and serve
    match &config.database_url {
        Some(url) => {
            let pool = sqlx::postgres::PgPoolOptions::new()
                .max_connections(10)
                .connect(url)
                .await?;
            let store = PostgresEventStore::new(pool.clone());
            store.run_migrations().await?;
            tracing::info!("using PostgreSQL stores");

            serve(
                &config,
                store,
                Arc::new(PostgresWaitRegistry::new(pool.clone())),
                Arc::new(PostgresDedupeLedger::new(pool)),
                metrics_handle,
            )
            .await?;
        }
        None => {
            tracing::info!("DATABASE_URL not set; using in-memory stores");
            serve(
                &config,
                InMemoryEventStore::new(),
                Arc::new(InMemoryWaitRegistry::new()),
                Arc::new(InMemoryDedupeLedger::new()),
                metrics_handle,
            )
            .await?;
        }
    }

    tracing::info!("server shut down gracefully");
    Ok(())
}
