//! Order cache, the read model serving point lookups.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use common::OrderUid;
use domain::Order;
use tokio::sync::RwLock;

use crate::policy::EvictionPolicy;

struct Entry {
    order: Arc<Order>,
    /// Write stamp, used to find the least recently written entry.
    stamp: u64,
}

#[derive(Default)]
struct Entries {
    by_uid: HashMap<OrderUid, Entry>,
    by_stamp: BTreeMap<u64, OrderUid>,
    next_stamp: u64,
}

impl Entries {
    /// Inserts or replaces an entry and returns how many entries were evicted.
    fn insert(&mut self, order_uid: OrderUid, order: Order, policy: EvictionPolicy) -> usize {
        let stamp = self.next_stamp;
        self.next_stamp += 1;

        let entry = Entry {
            order: Arc::new(order),
            stamp,
        };
        if let Some(previous) = self.by_uid.insert(order_uid.clone(), entry) {
            self.by_stamp.remove(&previous.stamp);
        }
        self.by_stamp.insert(stamp, order_uid);

        let Some(capacity) = policy.capacity() else {
            return 0;
        };

        let mut evicted = 0;
        while self.by_uid.len() > capacity {
            let Some((_, oldest)) = self.by_stamp.pop_first() else {
                break;
            };
            self.by_uid.remove(&oldest);
            evicted += 1;
        }
        evicted
    }
}

/// Concurrent in-memory map from order identifier to the full order.
///
/// Many readers proceed in parallel; writers take the lock only for the map
/// mutation. No I/O happens under the lock. Once [`set`](Self::set) returns,
/// every later [`get`](Self::get) for that identifier observes the new value.
/// No atomicity is provided across identifiers.
///
/// Cloning is cheap and yields a handle to the same cache.
#[derive(Clone, Default)]
pub struct OrderCache {
    entries: Arc<RwLock<Entries>>,
    policy: EvictionPolicy,
}

impl OrderCache {
    /// Creates a new empty, unbounded cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a new empty cache bounded by `policy`.
    pub fn with_policy(policy: EvictionPolicy) -> Self {
        Self {
            entries: Arc::default(),
            policy,
        }
    }

    /// Returns the eviction policy in force.
    pub fn policy(&self) -> EvictionPolicy {
        self.policy
    }

    /// Inserts or replaces the entry for `order_uid`. Last writer wins.
    pub async fn set(&self, order_uid: OrderUid, order: Order) {
        let (evicted, len) = {
            let mut entries = self.entries.write().await;
            let evicted = entries.insert(order_uid, order, self.policy);
            (evicted, entries.by_uid.len())
        };
        self.record(evicted, len);
    }

    /// Gets the current order for `order_uid`.
    pub async fn get(&self, order_uid: &str) -> Option<Arc<Order>> {
        self.entries
            .read()
            .await
            .by_uid
            .get(order_uid)
            .map(|entry| Arc::clone(&entry.order))
    }

    /// Inserts every order keyed by its own identifier. Returns the number inserted.
    pub async fn bulk_load(&self, orders: impl IntoIterator<Item = Order>) -> usize {
        let (loaded, evicted, len) = {
            let mut entries = self.entries.write().await;
            let mut loaded = 0;
            let mut evicted = 0;
            for order in orders {
                evicted += entries.insert(order.order_uid.clone(), order, self.policy);
                loaded += 1;
            }
            (loaded, evicted, entries.by_uid.len())
        };
        self.record(evicted, len);
        tracing::debug!(loaded, evicted, cached = len, "bulk load complete");
        loaded
    }

    /// Snapshot of every cached order, in no particular order.
    pub async fn get_all(&self) -> Vec<Arc<Order>> {
        self.entries
            .read()
            .await
            .by_uid
            .values()
            .map(|entry| Arc::clone(&entry.order))
            .collect()
    }

    /// Returns the number of cached orders.
    pub async fn len(&self) -> usize {
        self.entries.read().await.by_uid.len()
    }

    /// Returns true when nothing is cached.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    fn record(&self, evicted: usize, len: usize) {
        if evicted > 0 {
            metrics::counter!("order_cache_evictions_total").increment(evicted as u64);
        }
        metrics::gauge!("order_cache_entries").set(len as f64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use domain::Item;

    fn create_test_order(uid: &str, item_names: &[&str]) -> Order {
        Order {
            items: item_names
                .iter()
                .map(|name| Item {
                    name: name.to_string(),
                    ..Item::default()
                })
                .collect(),
            ..Order::new(uid)
        }
    }

    #[tokio::test]
    async fn set_then_get_returns_order() {
        let cache = OrderCache::new();
        let order = create_test_order("uid-1", &["Mascara"]);

        cache.set(order.order_uid.clone(), order.clone()).await;

        assert_eq!(cache.get("uid-1").await.as_deref(), Some(&order));
    }

    #[tokio::test]
    async fn get_unknown_returns_none() {
        let cache = OrderCache::new();
        assert!(cache.get("never-submitted").await.is_none());
        assert!(cache.is_empty().await);
    }

    #[tokio::test]
    async fn set_replaces_previous_value() {
        let cache = OrderCache::new();
        cache
            .set("uid-1".into(), create_test_order("uid-1", &["Mascara"]))
            .await;
        cache
            .set("uid-1".into(), create_test_order("uid-1", &["Lipstick"]))
            .await;

        let cached = cache.get("uid-1").await.unwrap();
        assert_eq!(cached.items[0].name, "Lipstick");
        assert_eq!(cache.len().await, 1);
    }

    #[tokio::test]
    async fn bulk_load_keys_by_order_uid() {
        let cache = OrderCache::new();
        let orders = vec![
            create_test_order("a", &[]),
            create_test_order("b", &[]),
            create_test_order("c", &[]),
        ];

        let loaded = cache.bulk_load(orders).await;

        assert_eq!(loaded, 3);
        for uid in ["a", "b", "c"] {
            assert!(cache.get(uid).await.is_some());
        }
    }

    #[tokio::test]
    async fn get_all_returns_snapshot() {
        let cache = OrderCache::new();
        cache
            .bulk_load(vec![create_test_order("a", &[]), create_test_order("b", &[])])
            .await;

        let mut uids: Vec<_> = cache
            .get_all()
            .await
            .iter()
            .map(|o| o.order_uid.to_string())
            .collect();
        uids.sort();
        assert_eq!(uids, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn bounded_cache_evicts_least_recently_written() {
        let cache = OrderCache::with_policy(EvictionPolicy::from_max_entries(Some(2)));

        cache.set("a".into(), create_test_order("a", &[])).await;
        cache.set("b".into(), create_test_order("b", &[])).await;
        // Rewriting `a` makes `b` the oldest.
        cache.set("a".into(), create_test_order("a", &["Mascara"])).await;
        cache.set("c".into(), create_test_order("c", &[])).await;

        assert_eq!(cache.len().await, 2);
        assert!(cache.get("b").await.is_none());
        assert_eq!(cache.get("a").await.unwrap().items.len(), 1);
        assert!(cache.get("c").await.is_some());
    }

    #[tokio::test]
    async fn bounded_bulk_load_keeps_newest() {
        let cache = OrderCache::with_policy(EvictionPolicy::from_max_entries(Some(2)));
        let loaded = cache
            .bulk_load(vec![
                create_test_order("a", &[]),
                create_test_order("b", &[]),
                create_test_order("c", &[]),
            ])
            .await;

        assert_eq!(loaded, 3);
        assert_eq!(cache.len().await, 2);
        assert!(cache.get("a").await.is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_writers_never_mix_payloads() {
        let cache = OrderCache::new();
        let first = create_test_order("uid-race", &["Mascara"]);
        let second = create_test_order("uid-race", &["Powder", "Blush"]);

        let mut handles = Vec::new();
        for i in 0..50 {
            let cache = cache.clone();
            let order = if i % 2 == 0 { first.clone() } else { second.clone() };
            handles.push(tokio::spawn(async move {
                cache.set(order.order_uid.clone(), order).await;
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let cached = cache.get("uid-race").await.unwrap();
        assert!(*cached == first || *cached == second);
    }
}
