//! The OPC UA adapter contract: the one external collaborator this crate depends on.
//!
//! The wire-level client (secure channel, session, binary codec) is out of scope; this module
//! only states the shape the core needs from it. Server-originated events are delivered over a
//! channel handed to the adapter at construction time rather than as C-style callbacks with a
//! context pointer (`SPEC_FULL.md` §9) — the core drains the receiving end from its own
//! dispatcher task.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::{cache::Status, node_id::NodeId};

/// A typed classification of adapter failures.
///
/// Preferred over substring matching on an opaque message (`SPEC_FULL.md` §9); `Other` exists
/// for adapters that cannot yet offer a typed class and is the only variant the error handler's
/// substring fallback inspects.
#[derive(Clone, Debug, thiserror::Error)]
pub enum OpcError {
	/// The session is down; no read or subscription call can succeed until reconnection.
	#[error("disconnected from the OPC UA server")]
	Disconnected,
	/// The call did not complete within its deadline.
	#[error("operation timed out")]
	Timeout,
	/// The node exists but the server reported a bad status for it.
	#[error("node error: {0}")]
	NodeError(String),
	/// An adapter error that does not carry a typed class.
	#[error("{0}")]
	Other(String),
}
impl OpcError {
	/// Connection-class errors: session loss, the network being unreachable.
	pub fn is_connection_class(&self) -> bool {
		match self {
			Self::Disconnected => true,
			Self::Timeout | Self::NodeError(_) => false,
			Self::Other(message) => contains_any(message, CONNECTION_PATTERNS),
		}
	}

	/// Timeout-class errors.
	pub fn is_timeout_class(&self) -> bool {
		match self {
			Self::Timeout => true,
			Self::Disconnected | Self::NodeError(_) => false,
			Self::Other(message) => contains_any(message, TIMEOUT_PATTERNS),
		}
	}

	/// `connection-class ∪ timeout-class`; whether a retry might help.
	pub fn is_recoverable(&self) -> bool {
		self.is_connection_class() || self.is_timeout_class()
	}
}

const CONNECTION_PATTERNS: &[&str] =
	&["connection", "disconnected", "network", "unreachable", "refused", "closed"];
const TIMEOUT_PATTERNS: &[&str] = &["timeout", "timed out"];

fn contains_any(message: &str, patterns: &[&str]) -> bool {
	let lower = message.to_ascii_lowercase();

	patterns.iter().any(|pattern| lower.contains(pattern))
}

/// A single node's value as read from, or pushed by, the OPC UA server.
#[derive(Clone, Debug)]
pub struct NodeReading {
	/// Node identifier this reading is for.
	pub node_id: NodeId,
	/// The observed value, encoded as a string.
	pub value: String,
	/// `Good` or `Bad`.
	pub status: Status,
	/// Human-readable status phrase.
	pub reason: String,
	/// Millisecond Unix timestamp from the data source.
	pub source_timestamp_ms: i64,
}

/// Server-reported status for a subscription, mapped from the adapter's status code.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SubscriptionStatus {
	/// The subscription is healthy.
	Good,
	/// The server reports the subscription id is no longer valid.
	BadSubscriptionIdInvalid,
	/// The underlying connection closed.
	BadConnectionClosed,
	/// Any other status code; treated conservatively as not-confirmed-active.
	Other,
}

/// A server-originated event, delivered over the channel returned by
/// [`event_channel`].
#[derive(Clone, Debug)]
pub enum OpcEvent {
	/// A monitored item's value changed.
	Notification {
		/// Subscription the notification arrived on.
		subscription_id: u32,
		/// Client handle identifying which monitored item changed.
		client_handle: u32,
		/// The new value.
		value: String,
		/// `Good` or `Bad`.
		status: Status,
		/// Human-readable status phrase.
		reason: String,
		/// Millisecond Unix timestamp from the data source.
		source_timestamp_ms: i64,
	},
	/// The server reported a status change for a subscription.
	SubscriptionStatusChange {
		/// Subscription the status applies to.
		subscription_id: u32,
		/// The mapped status.
		status: SubscriptionStatus,
	},
	/// The adapter's connection state changed.
	ConnectionStateChange {
		/// Whether the adapter is now connected.
		connected: bool,
	},
}

/// Sending half of the event channel; held by the adapter, used to push server-originated
/// events into the core.
pub type OpcEventSender = mpsc::Sender<OpcEvent>;
/// Receiving half of the event channel; held by the core's dispatcher task.
pub type OpcEventReceiver = mpsc::Receiver<OpcEvent>;

/// Construct the bounded channel an adapter and the core's dispatcher communicate over.
///
/// A bound keeps a stalled dispatcher from growing memory unboundedly; it is generous because
/// notifications are expected to be frequent and cheap to drain.
pub fn event_channel(capacity: usize) -> (OpcEventSender, OpcEventReceiver) {
	mpsc::channel(capacity)
}

/// The contract the core depends on (`SPEC_FULL.md` §6). An embedder implements this against
/// the real OPC UA wire client; the core only ever holds an `Arc<dyn OpcAdapter>`.
#[async_trait]
pub trait OpcAdapter: Send + Sync {
	/// Read one node synchronously, honoring `deadline`.
	async fn read_node(&self, node_id: &NodeId, deadline: Duration) -> Result<NodeReading, OpcError>;

	/// Read many nodes in one upstream call; the result order matches `node_ids`.
	async fn read_nodes(&self, node_ids: &[NodeId], deadline: Duration) -> Vec<Result<NodeReading, OpcError>>;

	/// Create a monitored item under `subscription_id` for `node_id`, using the given
	/// locally-minted `client_handle`. Returns the server-assigned item id.
	async fn add_monitored_item(
		&self,
		subscription_id: u32,
		node_id: &NodeId,
		client_handle: u32,
	) -> Result<u32, OpcError>;

	/// Remove a previously created monitored item.
	async fn remove_monitored_item(&self, subscription_id: u32, server_id: u32) -> Result<(), OpcError>;

	/// Create a new subscription, returning its server-assigned id.
	async fn create_subscription(&self) -> Result<u32, OpcError>;

	/// Establish (or re-establish) the session.
	async fn connect(&self) -> Result<(), OpcError>;

	/// Tear down the session.
	async fn disconnect(&self);

	/// Whether the adapter currently believes it holds a live session.
	fn is_connected(&self) -> bool;

	/// Pump network I/O and dispatch any pending callbacks for up to `max_wait`.
	///
	/// This is the mechanism that turns a silent, server-initiated disconnection into an
	/// observable state change (`SPEC_FULL.md` §4.6); the reconnection monitor calls this on
	/// every loop iteration regardless of perceived connection state.
	async fn run_iterate(&self, max_wait: Duration) -> Result<(), OpcError>;
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn typed_variants_classify_without_inspecting_text() {
		assert!(OpcError::Disconnected.is_connection_class());
		assert!(!OpcError::Disconnected.is_timeout_class());
		assert!(OpcError::Timeout.is_timeout_class());
		assert!(OpcError::Timeout.is_recoverable());
		assert!(!OpcError::NodeError("bad status".into()).is_recoverable());
	}

	#[test]
	fn other_variant_falls_back_to_substring_match() {
		assert!(OpcError::Other("Connection refused by peer".into()).is_connection_class());
		assert!(OpcError::Other("request TIMED OUT after 5s".into()).is_timeout_class());
		assert!(!OpcError::Other("node browse name invalid".into()).is_recoverable());
	}
}
