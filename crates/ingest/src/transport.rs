//! Transport abstraction for a durable, at-least-once subscription.

use async_trait::async_trait;

use crate::Result;

/// Settles a delivered message with the transport.
#[async_trait]
pub trait Acknowledge: Send + Sync {
    /// Marks the message as processed; it will not be redelivered.
    async fn ack(&self) -> Result<()>;

    /// Marks the message as failed; the transport redelivers it.
    async fn nak(&self) -> Result<()>;
}

/// A message received from a subscription, pending acknowledgement.
///
/// Dropping a delivery without settling it leaves it unacknowledged; the
/// transport redelivers it once the subscription is re-established.
pub struct Delivery {
    subject: String,
    payload: Vec<u8>,
    attempt: u32,
    acker: Box<dyn Acknowledge>,
}

impl Delivery {
    /// Creates a delivery settled through `acker`.
    pub fn new(
        subject: impl Into<String>,
        payload: Vec<u8>,
        attempt: u32,
        acker: impl Acknowledge + 'static,
    ) -> Self {
        Self {
            subject: subject.into(),
            payload,
            attempt,
            acker: Box::new(acker),
        }
    }

    /// The subject the message was published on.
    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// The raw message payload.
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Delivery attempt, starting at 1.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Acknowledges the message.
    pub async fn ack(self) -> Result<()> {
        self.acker.ack().await
    }

    /// Negatively acknowledges the message, requesting redelivery.
    pub async fn nak(self) -> Result<()> {
        self.acker.nak().await
    }
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("subject", &self.subject)
            .field("payload_len", &self.payload.len())
            .field("attempt", &self.attempt)
            .finish()
    }
}

/// A subscription yielding deliveries one at a time.
#[async_trait]
pub trait MessageSource: Send {
    /// Waits for the next delivery. Returns `None` once the subscription is closed.
    ///
    /// Implementations must be cancel-safe: dropping the returned future
    /// before it completes must not lose a message.
    async fn next(&mut self) -> Option<Result<Delivery>>;
}
