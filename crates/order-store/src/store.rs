use async_trait::async_trait;
use domain::Order;

use crate::Result;

/// Outcome of a successful save.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Persisted {
    /// The order as it now stands in the store.
    ///
    /// On redelivery the stored root attributes win over the payload's,
    /// while delivery, payment and items are those just written.
    pub order: Order,

    /// True when this save created the root row.
    pub created: bool,
}

/// Core trait for order store implementations.
///
/// All implementations must be thread-safe (Send + Sync) and must make
/// [`save`](OrderStore::save) idempotent under redelivery of the same order.
#[async_trait]
pub trait OrderStore: Send + Sync {
    /// Persists an order and its sub-records atomically.
    ///
    /// The root row is insert-or-ignore and never changes once written.
    /// Delivery and payment are upserted and items are replaced, all inside
    /// the same transaction, so a redelivered order commits cleanly. Any
    /// failure rolls back every sub-write and reports the failing stage.
    async fn save(&self, order: &Order) -> Result<Persisted>;

    /// Loads every persisted order with its sub-records.
    ///
    /// Only a failure of the root query is returned as an error. Missing or
    /// unreadable sub-records are logged and left at their zero value.
    async fn load_all(&self) -> Result<Vec<Order>>;
}
