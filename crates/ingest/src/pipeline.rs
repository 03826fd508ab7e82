//! Ingestion pipeline: decode → validate → persist → cache → acknowledge.
//!
//! A dispatcher task receives deliveries, decodes and validates them, and
//! routes each valid order to one of a fixed set of workers by a stable hash
//! of its identifier. A worker handles its queue in order, so two messages
//! for the same order never run concurrently. Different orders proceed in
//! parallel on different workers.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use common::OrderUid;
use domain::{DecodeError, Order};
use order_cache::OrderCache;
use order_store::{OrderStore, Persisted, SaveStage};
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};

use crate::{Delivery, MessageSource};

/// Worker pool sizing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineConfig {
    /// Number of workers. Each owns a disjoint slice of the identifier space.
    pub workers: usize,
    /// Capacity of each worker's queue. A full queue stalls the dispatcher.
    pub queue_depth: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            queue_depth: 64,
        }
    }
}

/// Terminal state of one message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageOutcome {
    /// Persisted and written to the cache.
    Cached { order_uid: OrderUid, created: bool },
    /// The payload was not an order document. Discarded.
    Malformed,
    /// The order had no identifier. Discarded.
    Invalid,
    /// The store rejected the order. The cache was not touched.
    PersistFailed {
        order_uid: OrderUid,
        stage: Option<SaveStage>,
    },
}

impl MessageOutcome {
    /// Metric label for this outcome.
    pub fn label(&self) -> &'static str {
        match self {
            MessageOutcome::Cached { .. } => "cached",
            MessageOutcome::Malformed => "malformed",
            MessageOutcome::Invalid => "invalid",
            MessageOutcome::PersistFailed { .. } => "persist_failed",
        }
    }

    /// Whether the message is settled for good.
    ///
    /// Decode and validation failures are terminal and acknowledged. Only a
    /// persistence failure asks the transport to redeliver.
    pub fn should_ack(&self) -> bool {
        !matches!(self, MessageOutcome::PersistFailed { .. })
    }
}

impl From<&DecodeError> for MessageOutcome {
    fn from(err: &DecodeError) -> Self {
        match err {
            DecodeError::Malformed(_) => MessageOutcome::Malformed,
            DecodeError::MissingOrderUid => MessageOutcome::Invalid,
        }
    }
}

/// Shared state of the pipeline: the store to write through and the cache to update.
pub struct IngestPipeline<S> {
    store: S,
    cache: OrderCache,
    config: PipelineConfig,
}

impl<S: OrderStore + 'static> IngestPipeline<S> {
    /// Creates a pipeline writing through `store` into `cache`.
    pub fn new(store: S, cache: OrderCache, config: PipelineConfig) -> Self {
        Self {
            store,
            cache,
            config: PipelineConfig {
                workers: config.workers.max(1),
                queue_depth: config.queue_depth.max(1),
            },
        }
    }

    /// Returns the cache this pipeline writes to.
    pub fn cache(&self) -> &OrderCache {
        &self.cache
    }

    /// Returns the effective pool sizing.
    pub fn config(&self) -> PipelineConfig {
        self.config
    }

    /// Runs one payload through every stage, without any transport.
    pub async fn process(&self, payload: &[u8]) -> MessageOutcome {
        let outcome = match decode(payload) {
            Ok(order) => self.persist_and_cache(order).await,
            Err(rejected) => rejected,
        };
        record(&outcome);
        outcome
    }

    /// Persists `order` and, only once the store has committed, caches the
    /// stored aggregate.
    #[tracing::instrument(skip(self, order), fields(order_uid = %order.order_uid))]
    async fn persist_and_cache(&self, order: Order) -> MessageOutcome {
        match self.store.save(&order).await {
            Ok(Persisted {
                order: stored,
                created,
            }) => {
                let order_uid = stored.order_uid.clone();
                let items = stored.item_count();
                self.cache.set(order_uid.clone(), stored).await;
                tracing::info!(created, items, "order persisted and cached");
                MessageOutcome::Cached { order_uid, created }
            }
            Err(e) => {
                let stage = e.stage();
                tracing::error!(
                    error = %e,
                    stage = stage.map_or("none", |s| s.as_str()),
                    "failed to persist order, cache left unchanged"
                );
                MessageOutcome::PersistFailed {
                    order_uid: order.order_uid,
                    stage,
                }
            }
        }
    }

    /// Starts consuming `source` in the background.
    ///
    /// The returned handle stops the pipeline. Dropping the handle without
    /// calling [`PipelineHandle::shutdown`] stops it as well.
    pub fn spawn<M>(self: Arc<Self>, source: M) -> PipelineHandle
    where
        M: MessageSource + 'static,
    {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(self.run(source, shutdown_rx));
        PipelineHandle {
            shutdown: shutdown_tx,
            task,
        }
    }

    async fn run<M>(self: Arc<Self>, mut source: M, mut shutdown: watch::Receiver<bool>)
    where
        M: MessageSource + 'static,
    {
        let mut workers = JoinSet::new();
        let mut queues = Vec::with_capacity(self.config.workers);
        for worker in 0..self.config.workers {
            let (tx, rx) = mpsc::channel(self.config.queue_depth);
            queues.push(tx);
            workers.spawn(Arc::clone(&self).work(worker, rx));
        }
        tracing::info!(workers = self.config.workers, "ingest pipeline started");

        loop {
            let delivery = tokio::select! {
                biased;
                _ = shutdown.changed() => {
                    tracing::info!("shutdown requested, no longer receiving");
                    break;
                }
                next = source.next() => match next {
                    Some(Ok(delivery)) => delivery,
                    Some(Err(e)) => {
                        tracing::warn!(error = %e, "failed to receive message");
                        continue;
                    }
                    None => {
                        tracing::info!("subscription closed");
                        break;
                    }
                },
            };

            match decode(delivery.payload()) {
                Ok(order) => {
                    let shard = shard_for(order.uid(), queues.len());
                    if queues[shard].send((order, delivery)).await.is_err() {
                        tracing::error!(shard, "worker stopped unexpectedly");
                        break;
                    }
                }
                Err(rejected) => {
                    record(&rejected);
                    settle(delivery, &rejected).await;
                }
            }
        }

        // Workers finish what is queued, then the subscription is released.
        drop(queues);
        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                tracing::error!(error = %e, "ingest worker panicked");
            }
        }
        drop(source);
        tracing::info!("ingest pipeline stopped");
    }

    async fn work(self: Arc<Self>, worker: usize, mut queue: mpsc::Receiver<(Order, Delivery)>) {
        while let Some((order, delivery)) = queue.recv().await {
            let outcome = self.persist_and_cache(order).await;
            record(&outcome);
            settle(delivery, &outcome).await;
        }
        tracing::debug!(worker, "ingest worker drained");
    }
}

/// Handle to a running pipeline.
pub struct PipelineHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl PipelineHandle {
    /// Stops receiving, waits for queued messages to finish, and releases
    /// the subscription.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        self.join().await;
    }

    /// Waits for the pipeline to stop on its own, e.g. when the subscription closes.
    pub async fn join(self) {
        if let Err(e) = self.task.await {
            tracing::error!(error = %e, "ingest pipeline task failed");
        }
    }

    /// Returns true once the pipeline has stopped.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

fn decode(payload: &[u8]) -> Result<Order, MessageOutcome> {
    Order::decode(payload).map_err(|e| {
        tracing::warn!(error = %e, kind = e.kind(), "discarding message");
        MessageOutcome::from(&e)
    })
}

/// Picks the worker responsible for `order_uid`.
fn shard_for(order_uid: &OrderUid, shards: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    order_uid.hash(&mut hasher);
    (hasher.finish() % shards as u64) as usize
}

fn record(outcome: &MessageOutcome) {
    metrics::counter!("ingest_messages_total", "outcome" => outcome.label()).increment(1);
}

async fn settle(delivery: Delivery, outcome: &MessageOutcome) {
    let attempt = delivery.attempt();
    let settled = if outcome.should_ack() {
        delivery.ack().await
    } else {
        tracing::warn!(attempt, outcome = outcome.label(), "requesting redelivery");
        delivery.nak().await
    };
    if let Err(e) = settled {
        tracing::error!(error = %e, attempt, "failed to settle message");
    }
}
