//! End-to-end ingestion tests over the in-memory broker and store.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use domain::Order;
use ingest::{InMemoryBroker, IngestPipeline, PipelineConfig, bootstrap};
use order_cache::OrderCache;
use order_store::{InMemoryOrderStore, OrderStore, SaveStage};

const SUBJECT: &str = "orders";
const DURABLE: &str = "orders-durable";

const E2E_PAYLOAD: &str = r#"{"order_uid":"b563feb7b2b84b6test","items":[{"name":"Mascara","total_price":453}],"payment":{"amount":1817,"currency":"USD"}}"#;

/// Polls `check` until it holds or the deadline passes.
async fn wait_for<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        while !check().await {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

fn create_pipeline(
    store: &InMemoryOrderStore,
    cache: &OrderCache,
) -> Arc<IngestPipeline<InMemoryOrderStore>> {
    Arc::new(IngestPipeline::new(
        store.clone(),
        cache.clone(),
        PipelineConfig::default(),
    ))
}

fn payload(uid: &str, item_names: &[&str]) -> String {
    let items: Vec<_> = item_names
        .iter()
        .map(|name| serde_json::json!({ "name": name, "total_price": 453 }))
        .collect();
    serde_json::json!({ "order_uid": uid, "items": items }).to_string()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn message_flows_from_broker_to_cache() {
    let broker = InMemoryBroker::new();
    let store = InMemoryOrderStore::new();
    let cache = OrderCache::new();
    let subscription = broker.subscribe(SUBJECT, DURABLE).unwrap();
    let handle = create_pipeline(&store, &cache).spawn(subscription);

    broker.publish(SUBJECT, E2E_PAYLOAD).unwrap();

    wait_for(|| async { cache.get("b563feb7b2b84b6test").await.is_some() }).await;
    let cached = cache.get("b563feb7b2b84b6test").await.unwrap();
    assert_eq!(cached.items[0].total_price, 453);
    assert_eq!(cached.payment.amount, 1817);
    assert_eq!(cached.payment.currency, "USD");

    wait_for(|| async { broker.in_flight_count(DURABLE) == 0 }).await;
    handle.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn rejected_messages_are_acked_and_do_not_block() {
    let broker = InMemoryBroker::new();
    let store = InMemoryOrderStore::new();
    let cache = OrderCache::new();
    let handle = create_pipeline(&store, &cache).spawn(broker.subscribe(SUBJECT, DURABLE).unwrap());

    broker.publish(SUBJECT, "not json at all").unwrap();
    broker.publish(SUBJECT, r#"{"track_number":"WB"}"#).unwrap();
    broker.publish(SUBJECT, payload("uid-after", &["Mascara"])).unwrap();

    wait_for(|| async { cache.get("uid-after").await.is_some() }).await;
    wait_for(|| async { broker.in_flight_count(DURABLE) == 0 }).await;
    assert_eq!(broker.pending_count(DURABLE), 0);
    assert_eq!(store.order_count().await, 1);
    assert_eq!(cache.len().await, 1);

    handle.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn persist_failure_is_redelivered_until_store_recovers() {
    let broker = InMemoryBroker::with_max_deliver(0);
    let store = InMemoryOrderStore::new();
    let cache = OrderCache::new();
    store.fail_saves_of("uid-flaky", SaveStage::Payment);
    let handle = create_pipeline(&store, &cache).spawn(broker.subscribe(SUBJECT, DURABLE).unwrap());

    broker.publish(SUBJECT, payload("uid-flaky", &["Mascara"])).unwrap();
    broker.publish(SUBJECT, payload("uid-steady", &["Lipstick"])).unwrap();

    wait_for(|| async { cache.get("uid-steady").await.is_some() }).await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(cache.get("uid-flaky").await.is_none());
    assert!(store.get("uid-flaky").await.is_none());

    store.clear_faults();
    wait_for(|| async { cache.get("uid-flaky").await.is_some() }).await;
    assert_eq!(store.get("uid-flaky").await.unwrap().items[0].name, "Mascara");

    handle.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn persist_failure_stops_after_max_deliver() {
    let broker = InMemoryBroker::with_max_deliver(3);
    let store = InMemoryOrderStore::new();
    let cache = OrderCache::new();
    store.fail_saves_at(SaveStage::Root);
    let handle = create_pipeline(&store, &cache).spawn(broker.subscribe(SUBJECT, DURABLE).unwrap());

    broker.publish(SUBJECT, payload("uid-doomed", &[])).unwrap();

    wait_for(|| async {
        broker.pending_count(DURABLE) == 0 && broker.in_flight_count(DURABLE) == 0
    })
    .await;
    // A later message still flows once the store recovers.
    store.clear_faults();
    broker.publish(SUBJECT, payload("uid-next", &[])).unwrap();
    wait_for(|| async { cache.get("uid-next").await.is_some() }).await;
    assert!(cache.get("uid-doomed").await.is_none());

    handle.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn duplicate_delivery_is_idempotent() {
    let broker = InMemoryBroker::new();
    let store = InMemoryOrderStore::new();
    let cache = OrderCache::new();
    let handle = create_pipeline(&store, &cache).spawn(broker.subscribe(SUBJECT, DURABLE).unwrap());

    broker.publish(SUBJECT, E2E_PAYLOAD).unwrap();
    broker.publish(SUBJECT, E2E_PAYLOAD).unwrap();

    wait_for(|| async {
        broker.pending_count(DURABLE) == 0 && broker.in_flight_count(DURABLE) == 0
    })
    .await;
    let expected = Order::decode(E2E_PAYLOAD.as_bytes()).unwrap();
    assert_eq!(*cache.get("b563feb7b2b84b6test").await.unwrap(), expected);
    assert_eq!(store.order_count().await, 1);
    assert_eq!(cache.len().await, 1);

    handle.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn messages_for_one_order_apply_in_publish_order() {
    let broker = InMemoryBroker::new();
    let store = InMemoryOrderStore::new();
    let cache = OrderCache::new();
    let handle = create_pipeline(&store, &cache).spawn(broker.subscribe(SUBJECT, DURABLE).unwrap());

    for i in 0..20 {
        let name = format!("item-{i}");
        broker.publish(SUBJECT, payload("uid-ordered", &[name.as_str()])).unwrap();
        broker.publish(SUBJECT, payload(&format!("uid-other-{i}"), &[])).unwrap();
    }

    wait_for(|| async {
        broker.pending_count(DURABLE) == 0 && broker.in_flight_count(DURABLE) == 0
    })
    .await;
    let cached = cache.get("uid-ordered").await.unwrap();
    assert_eq!(cached.items[0].name, "item-19");
    assert_eq!(*cached, store.get("uid-ordered").await.unwrap());
    assert_eq!(cache.len().await, 21);

    handle.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_save_then_set_leaves_one_complete_order() {
    let store = InMemoryOrderStore::new();
    let cache = OrderCache::new();
    let a = Order::decode(payload("uid-race", &["Mascara"]).as_bytes()).unwrap();
    let b = Order::decode(payload("uid-race", &["Powder", "Blush"]).as_bytes()).unwrap();

    for _ in 0..50 {
        let writers: Vec<_> = [a.clone(), b.clone()]
            .into_iter()
            .map(|order| {
                let store = store.clone();
                let cache = cache.clone();
                tokio::spawn(async move {
                    let persisted = store.save(&order).await.unwrap();
                    cache.set(order.order_uid.clone(), persisted.order).await;
                })
            })
            .collect();
        for writer in writers {
            writer.await.unwrap();
        }

        let cached = cache.get("uid-race").await.unwrap();
        assert!(
            *cached == a || *cached == b,
            "cache must hold one complete order, got {cached:?}"
        );
        let stored = store.get("uid-race").await.unwrap();
        assert!(stored == a || stored == b);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn restart_resumes_durable_and_bootstraps_cache() {
    let broker = InMemoryBroker::new();
    let store = InMemoryOrderStore::new();
    broker.declare_durable(SUBJECT, DURABLE).unwrap();

    // First process lifetime.
    let cache = OrderCache::new();
    let handle = create_pipeline(&store, &cache).spawn(broker.subscribe(SUBJECT, DURABLE).unwrap());
    broker.publish(SUBJECT, payload("uid-before", &["Mascara"])).unwrap();
    wait_for(|| async { cache.get("uid-before").await.is_some() }).await;
    handle.shutdown().await;

    // Published while no subscriber is running.
    broker.publish(SUBJECT, payload("uid-while-down", &["Lipstick"])).unwrap();

    // Second lifetime starts from a fresh cache.
    let cache = OrderCache::new();
    let report = bootstrap(&store, &cache).await;
    assert_eq!(report.loaded, 1);
    assert!(cache.get("uid-before").await.is_some());

    let handle = create_pipeline(&store, &cache).spawn(broker.subscribe(SUBJECT, DURABLE).unwrap());
    wait_for(|| async { cache.get("uid-while-down").await.is_some() }).await;

    let mut cached: Vec<_> = cache.get_all().await.iter().map(|o| o.order_uid.clone()).collect();
    let mut stored: Vec<_> = store
        .load_all()
        .await
        .unwrap()
        .into_iter()
        .map(|o| o.order_uid)
        .collect();
    cached.sort();
    stored.sort();
    assert_eq!(cached, stored);

    handle.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn closing_the_broker_stops_the_pipeline() {
    let broker = InMemoryBroker::new();
    let store = InMemoryOrderStore::new();
    let cache = OrderCache::new();
    let handle = create_pipeline(&store, &cache).spawn(broker.subscribe(SUBJECT, DURABLE).unwrap());

    broker.close();

    tokio::time::timeout(Duration::from_secs(5), handle.join())
        .await
        .expect("pipeline did not stop after the broker closed");
}
