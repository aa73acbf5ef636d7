//! Metrics registry plus the sideband scrape listener.
//!
//! Handlers declare their counters through
//! [`Handler::register_metrics`](../attest_handlers/trait.Handler.html);
//! the framework owns the worker-lifecycle counters and per-stage
//! latency accumulators. Scrapes are stateless and read-only.

mod registry;
mod server;

use thiserror::Error;

pub use registry::{Counter, MetricsRegistry};
pub use server::serve;

/// Workers spawned over the daemon's lifetime.
pub const FORKED_CHILDREN_TOTAL: &str = "forked_children_total";
/// Workers that exited and were collected.
pub const REAPED_CHILDREN_TOTAL: &str = "reaped_children_total";
/// Connections handed to a protocol engine.
pub const CONNECTIONS_TOTAL: &str = "connections_total";
/// Messages that reached end-of-message finalization.
pub const MESSAGES_TOTAL: &str = "messages_total";

#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("Failed to bind metrics listener to {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Metrics server error: {0}")]
    Server(String),
}
