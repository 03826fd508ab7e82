//! Order service entry point.

use std::sync::Arc;

use api::AppState;
use api::config::{Config, LogFormat};
use ingest::{InMemoryBroker, IngestPipeline};
use order_cache::OrderCache;
use order_store::PostgresOrderStore;
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

fn init_tracing(config: &Config) {
    let filter = EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    match config.log_format {
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json())
            .init(),
        LogFormat::Pretty => registry.with(tracing_subscriber::fmt::layer()).init(),
    }
}

#[tokio::main]
async fn main() {
    let config = Config::from_env();

    // 1. Initialize tracing and the Prometheus recorder
    init_tracing(&config);
    let metrics_handle = metrics_exporter_prometheus::PrometheusBuilder::new()
        .install_recorder()
        .expect("failed to install Prometheus recorder");

    // 2. Connect the store; the service cannot run without it
    let store = PostgresOrderStore::connect(&config.database_url, config.database_max_connections)
        .await
        .expect("failed to connect to the order store");
    if config.run_migrations {
        store
            .run_migrations()
            .await
            .expect("failed to run schema migrations");
    }

    // 3. Rebuild the cache before anything can read or write it
    let cache = OrderCache::with_policy(config.eviction_policy());
    let report = ingest::bootstrap(&store, &cache).await;
    tracing::info!(
        loaded = report.loaded,
        complete = report.is_complete(),
        elapsed_ms = report.elapsed.as_millis() as u64,
        policy = %cache.policy(),
        "cache bootstrap finished"
    );

    // 4. Subscribe and start the ingest pipeline
    let broker = InMemoryBroker::with_max_deliver(config.max_deliver);
    let subscription = broker
        .subscribe(&config.orders_subject, &config.durable_name)
        .expect("failed to open the orders subscription");
    let pipeline = Arc::new(IngestPipeline::new(
        store.clone(),
        cache.clone(),
        config.pipeline_config(),
    ));
    let pipeline_handle = pipeline.spawn(subscription);

    // 5. Serve HTTP
    let state = Arc::new(AppState::new(
        cache,
        broker.clone(),
        config.orders_subject.clone(),
    ));
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

    // 6. Drain the pipeline, then release the broker and the pool
    pipeline_handle.shutdown().await;
    broker.close();
    store.close().await;

    tracing::info!("server shut down gracefully");
}
