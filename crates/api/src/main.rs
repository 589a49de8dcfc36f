//! API server entry point.

use std::sync::Arc;

use api::config::Config;
use metrics_exporter_prometheus::PrometheusHandle;
use saga_engine::TemplateCatalog;
use saga_log::{InMemorySagaRepository, PostgresSagaRepository, SagaRepository};
use tokio::signal;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

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

/// Loads the saga templates, or an empty catalog if no file is configured.
fn load_catalog(config: &Config) -> TemplateCatalog {
    match config.templates_path.as_deref() {
        Some(path) => {
            let catalog = TemplateCatalog::load(path).expect("failed to load saga templates");
            tracing::info!(path, templates = catalog.len(), "loaded saga templates");
            catalog
        }
        None => {
            tracing::warn!("SAGA_TEMPLATES_PATH not set, no saga can be opened");
            TemplateCatalog::new()
        }
    }
}

/// Builds the application over `repository` and serves it until shutdown.
async fn serve<R: SagaRepository + Clone + 'static>(
    config: &Config,
    repository: R,
    catalog: TemplateCatalog,
    metrics_handle: PrometheusHandle,
) {
    let (state, processor) =
        api::create_default_state(repository, Arc::new(catalog), config.max_commit_attempts);

    // Rebuild the read models from the committed log
    let delivered = processor.run_catch_up().await.expect("catch-up failed");
    tracing::info!(delivered, "read models caught up");

    let app = api::create_app(state, metrics_handle);

    let addr = config.addr();
    tracing::info!(%addr, "starting API server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("failed to bind address");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("server error");
}

#[tokio::main]
async fn main() {
    let config = Config::from_env();

    // 1. Initialize tracing
    tracing_subscriber::registry()
        .with(EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    // 2. Install Prometheus metrics recorder
    let prometheus_builder = metrics_exporter_prometheus::PrometheusBuilder::new();
    let metrics_handle = prometheus_builder
        .install_recorder()
        .expect("failed to install Prometheus recorder");

    // 3. Load templates and pick the transaction log
    let catalog = load_catalog(&config);

    match config.database_url.as_deref() {
        Some(url) => {
            let pool = sqlx::PgPool::connect(url)
                .await
                .expect("failed to connect to PostgreSQL");
            let repository = PostgresSagaRepository::new(pool);
            repository
                .run_migrations()
                .await
                .expect("failed to run migrations");
            tracing::info!("using PostgreSQL saga log");
            serve(&config, repository, catalog, metrics_handle).await;
        }
        None => {
            tracing::info!("using in-memory saga log");
            serve(&config, InMemorySagaRepository::new(), catalog, metrics_handle).await;
        }
    }

    tracing::info!("server shut down gracefully");
}
