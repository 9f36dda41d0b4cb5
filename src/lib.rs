//! Resilient data access for a managed backend.
//!
//! - [`executor`]: deadline-bound queries with bounded retries and backoff
//! - [`cache`]: byte-budgeted get-or-fetch cache with stale fallback
//! - [`aggregate`]: concurrent fan-out that isolates failing sources
//! - [`outbox`]: durable offline write queue and its synchronizer
//! - [`client`]: all of the above behind one handle

pub mod aggregate;
pub mod cache;
pub mod client;
pub mod config;
pub mod error;
pub mod event;
pub mod executor;
pub mod metrics;
pub mod outbox;
pub mod query;
pub mod remote;

pub use client::DataClient;
pub use error::{DataError, DataResult};
