//! Order aggregate root.

use chrono::{DateTime, SubsecRound, Utc};
use common::OrderUid;
use serde::{Deserialize, Serialize};

use super::{Delivery, Item, Payment};
use crate::error::DecodeError;

/// An order together with its delivery, payment and line items.
///
/// The aggregate is the unit of persistence and caching: it is written to the
/// store in one transaction and replaced wholesale in the cache. There is no
/// field-level update.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Order {
    pub order_uid: OrderUid,
    pub track_number: String,
    pub entry: String,
    pub delivery: Delivery,
    pub payment: Payment,
    pub items: Vec<Item>,
    pub locale: String,
    pub internal_signature: String,
    pub customer_id: String,
    pub delivery_service: String,
    pub shardkey: String,
    pub sm_id: i64,
    pub date_created: DateTime<Utc>,
    pub oof_shard: String,
}

impl Order {
    /// Creates an empty order carrying only its identifier.
    pub fn new(order_uid: impl Into<OrderUid>) -> Self {
        Self {
            order_uid: order_uid.into(),
            ..Self::default()
        }
    }

    /// Decodes an inbound payload and validates the result.
    ///
    /// `date_created` is truncated to microseconds, the precision the store
    /// keeps, so a decoded order equals its stored form.
    pub fn decode(payload: &[u8]) -> Result<Self, DecodeError> {
        let mut order: Order = serde_json::from_slice(payload)?;
        order.validate()?;
        order.date_created = order.date_created.trunc_subsecs(6);
        Ok(order)
    }

    /// Checks the invariants an order must satisfy before it is persisted.
    pub fn validate(&self) -> Result<(), DecodeError> {
        if self.order_uid.is_blank() {
            return Err(DecodeError::MissingOrderUid);
        }
        Ok(())
    }

    /// Returns the order identifier.
    pub fn uid(&self) -> &OrderUid {
        &self.order_uid
    }

    /// Returns the number of line items.
    pub fn item_count(&self) -> usize {
        self.items.len()
    }

    /// Returns a copy of `self` whose root attributes are taken from `root`.
    ///
    /// Delivery, payment and items are kept from `self`. Used when the stored
    /// root row wins over a redelivered payload.
    pub fn with_root_of(mut self, root: &Order) -> Self {
        self.track_number = root.track_number.clone();
        self.entry = root.entry.clone();
        self.locale = root.locale.clone();
        self.internal_signature = root.internal_signature.clone();
        self.customer_id = root.customer_id.clone();
        self.delivery_service = root.delivery_service.clone();
        self.shardkey = root.shardkey.clone();
        self.sm_id = root.sm_id;
        self.date_created = root.date_created;
        self.oof_shard = root.oof_shard.clone();
        self
    }
}
