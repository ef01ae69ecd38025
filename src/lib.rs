//! Freshness-aware read-path cache bridging an OPC UA server to HTTP-polling clients —
//! background refresh, connection-loss fallback to stale cache, and reconnection-driven
//! subscription recovery, so client fan-out never translates into upstream read pressure.

#![deny(clippy::all, missing_docs, unused_crate_dependencies)]

pub mod background;
pub mod bridge;
pub mod cache;
pub mod config;
pub mod error_handler;
#[cfg(feature = "metrics")] pub mod metrics;
pub mod node_id;
pub mod opc;
pub mod reconciliation;
pub mod reconnection;
pub mod response;
pub mod strategy;
pub mod subscription;

mod error;

/// A scriptable in-memory [`opc::OpcAdapter`] for exercising the bridge without a real OPC UA
/// server. Built into unit tests; exposed to integration tests (`tests/`) only behind the
/// `test-support` feature so it never ships as part of a normal build.
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;

#[cfg(feature = "prometheus")] pub use crate::metrics::install_default_exporter;
pub use crate::{
	bridge::{Bridge, BridgeBuilder},
	error::{Error, Result},
};

#[cfg(test)]
mod _test {
	use metrics_util as _;
	use tracing_subscriber as _;
}
