//! Ingestion side of the order service.
//!
//! - [`MessageSource`] and [`Delivery`] abstract a durable, at-least-once subscription
//! - [`InMemoryBroker`] is an in-process implementation with named durables
//! - [`IngestPipeline`] runs decode → validate → persist → cache for each message
//! - [`bootstrap`] rebuilds the cache from the store before anything subscribes

pub mod bootstrap;
pub mod broker;
pub mod error;
pub mod pipeline;
pub mod transport;

pub use bootstrap::{BootstrapReport, bootstrap};
pub use broker::{InMemoryBroker, InMemorySubscription};
pub use error::{IngestError, Result};
pub use pipeline::{IngestPipeline, MessageOutcome, PipelineConfig, PipelineHandle};
pub use transport::{Acknowledge, Delivery, MessageSource};
