//! Domain layer for the order service.
//!
//! This crate provides the order aggregate as it travels on the wire, sits in
//! the relational store, and is served from the cache:
//! - [`Order`] root entity owning one [`Delivery`], one [`Payment`] and its [`Item`]s
//! - [`Order::decode`] for turning an inbound payload into a validated aggregate
//! - [`DecodeError`] separating malformed payloads from identifier-less ones

pub mod error;
pub mod order;

pub use common::OrderUid;
pub use error::DecodeError;
pub use order::{Delivery, Item, Order, Payment};
