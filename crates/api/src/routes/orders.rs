//! Order lookup and publish endpoints.

use std::sync::Arc;

use axum::Json;
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use domain::Order;
use serde::Serialize;

use crate::AppState;
use crate::error::ApiError;

#[derive(Serialize)]
pub struct PublishedResponse {
    pub subject: String,
    pub durables: usize,
}

/// GET /api/order/{id}: returns the cached order.
///
/// Served from the cache only. An order that is not cached yet is
/// indistinguishable from one that never existed.
#[tracing::instrument(skip(state))]
pub async fn get(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Arc<Order>>, ApiError> {
    let order = state
        .cache
        .get(&id)
        .await
        .ok_or_else(|| ApiError::NotFound(format!("Order {id} not found")))?;

    Ok(Json(order))
}

/// POST /api/orders: publishes the raw body onto the orders subject.
///
/// No validation happens here; the ingest pipeline decides what to keep.
#[tracing::instrument(skip(state, body), fields(bytes = body.len()))]
pub async fn publish(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<(StatusCode, Json<PublishedResponse>), ApiError> {
    if body.is_empty() {
        return Err(ApiError::BadRequest("Request body is empty".to_string()));
    }

    let durables = state.broker.publish(&state.subject, body.to_vec())?;
    metrics::counter!("api_orders_published_total").increment(1);

    Ok((
        StatusCode::ACCEPTED,
        Json(PublishedResponse {
            subject: state.subject.clone(),
            durables,
        }),
    ))
}
