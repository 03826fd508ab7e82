//! In-process durable broker.
//!
//! Each durable keeps its own queue of pending messages and the set of
//! messages delivered but not yet settled. A nak, or dropping the
//! subscription while messages are in flight, puts them back at the head of
//! the queue so they are redelivered in publish order.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::sync::Notify;

use crate::{Acknowledge, Delivery, IngestError, MessageSource, Result};

/// Default bound on delivery attempts per message.
pub const DEFAULT_MAX_DELIVER: u32 = 5;

#[derive(Debug, Clone)]
struct Message {
    seq: u64,
    payload: Vec<u8>,
    attempts: u32,
}

struct Durable {
    subject: String,
    pending: VecDeque<Message>,
    in_flight: HashMap<u64, Message>,
    active: bool,
    notify: Arc<Notify>,
}

impl Durable {
    fn new(subject: &str) -> Self {
        Self {
            subject: subject.to_string(),
            pending: VecDeque::new(),
            in_flight: HashMap::new(),
            active: false,
            notify: Arc::new(Notify::new()),
        }
    }

    /// Puts `message` back ahead of every later-published pending message.
    fn requeue(&mut self, message: Message) {
        let at = self.pending.partition_point(|m| m.seq < message.seq);
        self.pending.insert(at, message);
    }

    /// Moves every in-flight message back to the head of the queue.
    fn requeue_in_flight(&mut self) {
        let mut returned: Vec<_> = self.in_flight.drain().map(|(_, m)| m).collect();
        returned.sort_by_key(|m| std::cmp::Reverse(m.seq));
        for message in returned {
            self.pending.push_front(message);
        }
    }
}

#[derive(Default)]
struct BrokerState {
    durables: HashMap<String, Durable>,
    next_seq: u64,
    closed: bool,
}

/// In-memory, at-least-once broker with named durable subscriptions.
///
/// Cloning yields a handle to the same broker.
#[derive(Clone)]
pub struct InMemoryBroker {
    state: Arc<Mutex<BrokerState>>,
    max_deliver: u32,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBroker {
    /// Creates a broker with the default delivery bound.
    pub fn new() -> Self {
        Self::with_max_deliver(DEFAULT_MAX_DELIVER)
    }

    /// Creates a broker that gives up on a message after `max_deliver`
    /// attempts. Zero means no limit.
    pub fn with_max_deliver(max_deliver: u32) -> Self {
        Self {
            state: Arc::default(),
            max_deliver,
        }
    }

    /// Returns the delivery bound in force.
    pub fn max_deliver(&self) -> u32 {
        self.max_deliver
    }

    /// Declares a durable on `subject` so that messages published before the
    /// first subscription are retained for it.
    pub fn declare_durable(&self, subject: &str, durable: &str) -> Result<()> {
        let mut state = self.lock();
        if state.closed {
            return Err(IngestError::Closed);
        }
        match state.durables.get(durable) {
            Some(existing) if existing.subject != subject => Err(IngestError::SubjectMismatch {
                durable: durable.to_string(),
                bound: existing.subject.clone(),
                requested: subject.to_string(),
            }),
            Some(_) => Ok(()),
            None => {
                state
                    .durables
                    .insert(durable.to_string(), Durable::new(subject));
                Ok(())
            }
        }
    }

    /// Opens the durable subscription `durable` on `subject`, creating it if
    /// needed. Fails if the durable already has a live subscription.
    pub fn subscribe(&self, subject: &str, durable: &str) -> Result<InMemorySubscription> {
        self.declare_durable(subject, durable)?;

        let mut state = self.lock();
        let entry = state
            .durables
            .get_mut(durable)
            .ok_or_else(|| IngestError::Transport(format!("durable '{durable}' vanished")))?;
        if entry.active {
            return Err(IngestError::DurableInUse(durable.to_string()));
        }
        entry.active = true;
        let notify = Arc::clone(&entry.notify);

        tracing::debug!(subject, durable, pending = entry.pending.len(), "subscribed");

        Ok(InMemorySubscription {
            broker: self.clone(),
            subject: subject.to_string(),
            durable: durable.to_string(),
            notify,
        })
    }

    /// Publishes `payload` to every durable on `subject`. Returns how many
    /// durables received it.
    pub fn publish(&self, subject: &str, payload: impl Into<Vec<u8>>) -> Result<usize> {
        let payload = payload.into();
        let mut state = self.lock();
        if state.closed {
            return Err(IngestError::Closed);
        }

        let seq = state.next_seq;
        state.next_seq += 1;

        let mut fanned_out = 0;
        for durable in state.durables.values_mut().filter(|d| d.subject == subject) {
            durable.pending.push_back(Message {
                seq,
                payload: payload.clone(),
                attempts: 0,
            });
            durable.notify.notify_one();
            fanned_out += 1;
        }

        if fanned_out == 0 {
            tracing::debug!(subject, "no durable on subject, message discarded");
        }
        Ok(fanned_out)
    }

    /// Closes the broker. Every subscription ends and further publishes fail.
    pub fn close(&self) {
        let mut state = self.lock();
        state.closed = true;
        for durable in state.durables.values() {
            durable.notify.notify_waiters();
        }
    }

    /// Messages waiting for delivery on `durable`.
    pub fn pending_count(&self, durable: &str) -> usize {
        self.lock()
            .durables
            .get(durable)
            .map_or(0, |d| d.pending.len())
    }

    /// Messages delivered on `durable` but not yet settled.
    pub fn in_flight_count(&self, durable: &str) -> usize {
        self.lock()
            .durables
            .get(durable)
            .map_or(0, |d| d.in_flight.len())
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Takes the next deliverable message, dropping any past the delivery bound.
    fn take_next(&self, subject: &str, durable: &str) -> Option<Delivery> {
        let mut state = self.lock();
        let entry = state.durables.get_mut(durable)?;

        while let Some(mut message) = entry.pending.pop_front() {
            if self.max_deliver > 0 && message.attempts >= self.max_deliver {
                tracing::warn!(
                    durable,
                    seq = message.seq,
                    attempts = message.attempts,
                    "max deliveries reached, dropping message"
                );
                continue;
            }

            message.attempts += 1;
            let delivery = Delivery::new(
                subject,
                message.payload.clone(),
                message.attempts,
                InMemoryAcker {
                    broker: self.clone(),
                    durable: durable.to_string(),
                    seq: message.seq,
                },
            );
            entry.in_flight.insert(message.seq, message);
            return Some(delivery);
        }
        None
    }
}

/// Live subscription on one durable.
///
/// Dropping it releases the durable and requeues its in-flight messages.
pub struct InMemorySubscription {
    broker: InMemoryBroker,
    subject: String,
    durable: String,
    notify: Arc<Notify>,
}

impl InMemorySubscription {
    /// The durable this subscription is bound to.
    pub fn durable(&self) -> &str {
        &self.durable
    }
}

#[async_trait]
impl MessageSource for InMemorySubscription {
    async fn next(&mut self) -> Option<Result<Delivery>> {
        loop {
            // Registered before checking state, so a publish or close in
            // between is not missed.
            let notified = self.notify.notified();

            if self.broker.lock().closed {
                return None;
            }
            if let Some(delivery) = self.broker.take_next(&self.subject, &self.durable) {
                return Some(Ok(delivery));
            }

            notified.await;
        }
    }
}

impl Drop for InMemorySubscription {
    fn drop(&mut self) {
        let mut state = self.broker.lock();
        if let Some(durable) = state.durables.get_mut(&self.durable) {
            durable.active = false;
            durable.requeue_in_flight();
            tracing::debug!(
                durable = %self.durable,
                pending = durable.pending.len(),
                "subscription released"
            );
        }
    }
}

struct InMemoryAcker {
    broker: InMemoryBroker,
    durable: String,
    seq: u64,
}

#[async_trait]
impl Acknowledge for InMemoryAcker {
    async fn ack(&self) -> Result<()> {
        let mut state = self.broker.lock();
        if let Some(durable) = state.durables.get_mut(&self.durable) {
            durable.in_flight.remove(&self.seq);
        }
        Ok(())
    }

    async fn nak(&self) -> Result<()> {
        let mut state = self.broker.lock();
        if let Some(durable) = state.durables.get_mut(&self.durable) {
            // Settled late, after a restart already requeued it.
            let Some(message) = durable.in_flight.remove(&self.seq) else {
                return Ok(());
            };
            durable.requeue(message);
            durable.notify.notify_one();
        }
        Ok(())
    }
}
