//! Static order lookup page.

use axum::response::Html;

const INDEX_HTML: &str = include_str!("../../static/index.html");

/// GET /: serves the lookup page, which calls `GET /api/order/{id}`.
pub async fn page() -> Html<&'static str> {
    Html(INDEX_HTML)
}
