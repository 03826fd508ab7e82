//! HTTP API server for the order service.
//!
//! Serves point lookups from the order cache, accepts orders for publishing
//! onto the in-process broker, and exposes health and Prometheus metrics.

pub mod config;
pub mod error;
pub mod routes;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};
use ingest::InMemoryBroker;
use metrics_exporter_prometheus::PrometheusHandle;
use order_cache::OrderCache;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Shared application state accessible from all handlers.
pub struct AppState {
    /// Read model for lookups.
    pub cache: OrderCache,
    /// Broker the publish endpoint writes to.
    pub broker: InMemoryBroker,
    /// Subject orders are published on.
    pub subject: String,
}

impl AppState {
    pub fn new(cache: OrderCache, broker: InMemoryBroker, subject: impl Into<String>) -> Self {
        Self {
            cache,
            broker,
            subject: subject.into(),
        }
    }
}

/// Creates the Axum application router with all routes and shared state.
pub fn create_app(state: Arc<AppState>, metrics_handle: PrometheusHandle) -> Router {
    let metrics_router = Router::new()
        .route("/metrics", get(routes::metrics::get))
        .with_state(metrics_handle);

    Router::new()
        .route("/", get(routes::index::page))
        .route("/health", get(routes::health::check))
        .route("/api/order/{id}", get(routes::orders::get))
        .route("/api/orders", post(routes::orders::publish))
        .with_state(state)
        .merge(metrics_router)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
}
