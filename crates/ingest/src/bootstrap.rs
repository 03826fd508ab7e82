//! Cache bootstrap from the durable store.

use std::time::{Duration, Instant};

use order_cache::OrderCache;
use order_store::OrderStore;

/// What the bootstrap sequence achieved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootstrapReport {
    /// Orders written into the cache.
    pub loaded: usize,
    /// Why the load failed, if it did. The cache is then left empty.
    pub failed: Option<String>,
    pub elapsed: Duration,
}

impl BootstrapReport {
    /// Returns true when every stored order was loaded.
    pub fn is_complete(&self) -> bool {
        self.failed.is_none()
    }
}

/// Loads every persisted order into `cache`.
///
/// Must run before the subscription and the read path start. A failing load
/// is logged and reported, never returned as an error: the service starts
/// with an empty cache and fills it from new messages.
#[tracing::instrument(skip_all)]
pub async fn bootstrap<S>(store: &S, cache: &OrderCache) -> BootstrapReport
where
    S: OrderStore + ?Sized,
{
    let start = Instant::now();

    let report = match store.load_all().await {
        Ok(orders) => {
            let loaded = cache.bulk_load(orders).await;
            tracing::info!(loaded, "cache restored from store");
            BootstrapReport {
                loaded,
                failed: None,
                elapsed: start.elapsed(),
            }
        }
        Err(e) => {
            tracing::error!(error = %e, "failed to load orders, starting with empty cache");
            BootstrapReport {
                loaded: 0,
                failed: Some(e.to_string()),
                elapsed: start.elapsed(),
            }
        }
    };

    metrics::counter!("bootstrap_orders_loaded").increment(report.loaded as u64);
    metrics::histogram!("bootstrap_duration_seconds").record(report.elapsed.as_secs_f64());
    report
}
