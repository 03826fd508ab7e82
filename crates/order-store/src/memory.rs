use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use domain::Order;
use tokio::sync::RwLock;

use crate::{
    OrderUid, Result, SaveStage, StoreError,
    store::{OrderStore, Persisted},
};

#[derive(Debug, Default)]
struct Faults {
    /// Stage at which saves fail, optionally only for one order.
    save: Option<(SaveStage, Option<OrderUid>)>,
    load_all: bool,
}

/// In-memory order store implementation for testing and local runs.
///
/// Mirrors the PostgreSQL semantics: saves are all-or-nothing, the first
/// stored root wins on redelivery, and sub-records are replaced. Faults can
/// be injected at any save stage to exercise rollback paths.
#[derive(Clone, Default)]
pub struct InMemoryOrderStore {
    orders: Arc<RwLock<HashMap<OrderUid, Order>>>,
    faults: Arc<Mutex<Faults>>,
}

impl InMemoryOrderStore {
    /// Creates a new empty in-memory order store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of orders stored.
    pub async fn order_count(&self) -> usize {
        self.orders.read().await.len()
    }

    /// Returns the stored order, if any.
    pub async fn get(&self, order_uid: &str) -> Option<Order> {
        self.orders.read().await.get(order_uid).cloned()
    }

    /// Makes every subsequent save fail at `stage`.
    pub fn fail_saves_at(&self, stage: SaveStage) {
        self.faults().save = Some((stage, None));
    }

    /// Makes subsequent saves of `order_uid` fail at `stage`.
    pub fn fail_saves_of(&self, order_uid: impl Into<OrderUid>, stage: SaveStage) {
        self.faults().save = Some((stage, Some(order_uid.into())));
    }

    /// Makes `load_all` fail until faults are cleared.
    pub fn fail_load_all(&self) {
        self.faults().load_all = true;
    }

    /// Removes all injected faults.
    pub fn clear_faults(&self) {
        *self.faults() = Faults::default();
    }

    fn faults(&self) -> std::sync::MutexGuard<'_, Faults> {
        self.faults.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn injected_failure(&self, order_uid: &OrderUid) -> Option<SaveStage> {
        let faults = self.faults();
        let (stage, only) = faults.save.as_ref()?;
        match only {
            Some(target) if target != order_uid => None,
            _ => Some(*stage),
        }
    }
}

#[async_trait]
impl OrderStore for InMemoryOrderStore {
    async fn save(&self, order: &Order) -> Result<Persisted> {
        let order_uid = order.uid().clone();
        let mut store = self.orders.write().await;

        // Nothing is written before every stage has passed.
        if let Some(stage) = self.injected_failure(&order_uid) {
            return Err(StoreError::Rejected {
                order_uid,
                stage,
                reason: "injected failure".to_string(),
            });
        }

        let (stored, created) = match store.get(&order_uid) {
            Some(existing) => (order.clone().with_root_of(existing), false),
            None => (order.clone(), true),
        };
        store.insert(order_uid, stored.clone());

        Ok(Persisted {
            order: stored,
            created,
        })
    }

    async fn load_all(&self) -> Result<Vec<Order>> {
        if self.faults().load_all {
            return Err(StoreError::Unavailable("injected load failure".to_string()));
        }

        let store = self.orders.read().await;
        let mut orders: Vec<_> = store.values().cloned().collect();
        orders.sort_by(|a, b| {
            a.date_created
                .cmp(&b.date_created)
                .then_with(|| a.order_uid.cmp(&b.order_uid))
        });
        Ok(orders)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use domain::{Item, Payment};

    fn create_test_order(uid: &str, item_names: &[&str]) -> Order {
        Order {
            track_number: "WBILMTESTTRACK".to_string(),
            payment: Payment {
                amount: 1817,
                currency: "USD".to_string(),
                ..Payment::default()
            },
            items: item_names
                .iter()
                .map(|name| Item {
                    name: name.to_string(),
                    total_price: 453,
                    ..Item::default()
                })
                .collect(),
            ..Order::new(uid)
        }
    }

    #[tokio::test]
    async fn save_new_order() {
        let store = InMemoryOrderStore::new();
        let order = create_test_order("uid-1", &["Mascara"]);

        let persisted = store.save(&order).await.unwrap();
        assert!(persisted.created);
        assert_eq!(persisted.order, order);
        assert_eq!(store.order_count().await, 1);
    }

    #[tokio::test]
    async fn redelivery_is_idempotent() {
        let store = InMemoryOrderStore::new();
        let order = create_test_order("uid-1", &["Mascara"]);

        store.save(&order).await.unwrap();
        let second = store.save(&order).await.unwrap();

        assert!(!second.created);
        assert_eq!(second.order, order);
        assert_eq!(store.order_count().await, 1);
    }

    #[tokio::test]
    async fn redelivery_keeps_root_and_replaces_sub_records() {
        let store = InMemoryOrderStore::new();
        let first = create_test_order("uid-1", &["Mascara"]);
        store.save(&first).await.unwrap();

        let mut second = create_test_order("uid-1", &["Lipstick", "Powder"]);
        second.track_number = "CHANGED".to_string();
        let persisted = store.save(&second).await.unwrap();

        assert_eq!(persisted.order.track_number, "WBILMTESTTRACK");
        assert_eq!(persisted.order.items, second.items);
        assert_eq!(store.get("uid-1").await.unwrap(), persisted.order);
    }

    #[tokio::test]
    async fn injected_failure_writes_nothing() {
        let store = InMemoryOrderStore::new();
        store.fail_saves_at(SaveStage::Item);

        let err = store
            .save(&create_test_order("uid-1", &["Mascara"]))
            .await
            .unwrap_err();

        assert_eq!(err.stage(), Some(SaveStage::Item));
        assert_eq!(store.order_count().await, 0);
        assert!(store.load_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn targeted_failure_only_hits_one_order() {
        let store = InMemoryOrderStore::new();
        store.fail_saves_of("uid-bad", SaveStage::Payment);

        assert!(store.save(&create_test_order("uid-bad", &[])).await.is_err());
        assert!(store.save(&create_test_order("uid-good", &[])).await.is_ok());

        store.clear_faults();
        assert!(store.save(&create_test_order("uid-bad", &[])).await.is_ok());
        assert_eq!(store.order_count().await, 2);
    }

    #[tokio::test]
    async fn load_all_returns_every_order() {
        let store = InMemoryOrderStore::new();
        for uid in ["a", "b", "c"] {
            store.save(&create_test_order(uid, &["Mascara"])).await.unwrap();
        }

        let orders = store.load_all().await.unwrap();
        let uids: Vec<_> = orders.iter().map(|o| o.order_uid.as_str()).collect();
        assert_eq!(uids, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn load_all_failure_is_reported() {
        let store = InMemoryOrderStore::new();
        store.fail_load_all();

        let result = store.load_all().await;
        assert!(matches!(result, Err(StoreError::Unavailable(_))));
    }
}
