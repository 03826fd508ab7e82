//! In-memory read model for the order read path.
//!
//! This crate provides the query side of the service:
//! - [`OrderCache`], a concurrent identifier → order map fed by the write path
//! - [`EvictionPolicy`] for choosing whether the cache is bounded

pub mod cache;
pub mod policy;

pub use cache::OrderCache;
pub use policy::EvictionPolicy;
