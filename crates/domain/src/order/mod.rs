//! Order aggregate and its owned sub-records.

mod aggregate;
mod value_objects;

pub use aggregate::Order;
pub use value_objects::{Delivery, Item, Payment};
