//! Domain error types.

use thiserror::Error;

/// Errors produced while turning an inbound payload into an [`Order`](crate::Order).
#[derive(Debug, Error)]
pub enum DecodeError {
    /// The payload is not a JSON document of the order shape.
    #[error("Malformed order payload: {0}")]
    Malformed(#[from] serde_json::Error),

    /// The payload decoded but carries no usable `order_uid`.
    #[error("Invalid order: missing order_uid")]
    MissingOrderUid,
}

impl DecodeError {
    /// Short, stable label used for metrics and log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            DecodeError::Malformed(_) => "malformed",
            DecodeError::MissingOrderUid => "invalid",
        }
    }
}
