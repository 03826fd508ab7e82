//! Ingestion error types.

use thiserror::Error;

/// Errors raised by the transport or the subscription lifecycle.
///
/// Per-message decode and persistence failures are not errors at this level;
/// they are reported as a [`MessageOutcome`](crate::MessageOutcome).
#[derive(Debug, Error)]
pub enum IngestError {
    /// A durable name is already bound to a live subscription.
    #[error("Durable '{0}' already has an active subscription")]
    DurableInUse(String),

    /// A durable is bound to a different subject than requested.
    #[error("Durable '{durable}' is bound to subject '{bound}', not '{requested}'")]
    SubjectMismatch {
        durable: String,
        bound: String,
        requested: String,
    },

    /// The broker has been closed.
    #[error("Broker is closed")]
    Closed,

    /// A transport-level failure.
    #[error("Transport error: {0}")]
    Transport(String),
}

/// Result type for ingestion operations.
pub type Result<T> = std::result::Result<T, IngestError>;
