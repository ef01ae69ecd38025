//! A scriptable in-memory [`OpcAdapter`] for unit and integration tests.
//!
//! Not compiled into the published crate surface; exposed only under `#[cfg(test)]` via
//! `lib.rs` so both unit tests (`src/**`) and integration tests (`tests/**`) can share it.

use std::{
	collections::HashMap,
	sync::{
		Arc,
		atomic::{AtomicBool, AtomicU32, Ordering},
	},
	time::Duration,
};

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::{
	cache::Status,
	node_id::NodeId,
	opc::{NodeReading, OpcAdapter, OpcError},
};

/// One scripted response for a node, consumed in order by successive reads.
#[derive(Clone, Debug)]
pub enum Scripted {
	/// Return this reading.
	Value(String),
	/// Fail with this error.
	Fail(OpcErrorKind),
}

/// A serializable stand-in for [`OpcError`] so test scripts can be built with `Clone`.
#[derive(Clone, Copy, Debug)]
pub enum OpcErrorKind {
	/// [`OpcError::Disconnected`].
	Disconnected,
	/// [`OpcError::Timeout`].
	Timeout,
}
impl From<OpcErrorKind> for OpcError {
	fn from(value: OpcErrorKind) -> Self {
		match value {
			OpcErrorKind::Disconnected => OpcError::Disconnected,
			OpcErrorKind::Timeout => OpcError::Timeout,
		}
	}
}

#[derive(Default)]
struct State {
	scripts: HashMap<NodeId, Vec<Scripted>>,
	values: HashMap<NodeId, String>,
	read_calls: u32,
	subscription_calls: u32,
}

/// An in-memory adapter whose behavior is set up by the test before exercising the component
/// under test.
pub struct MockOpcAdapter {
	state: Mutex<State>,
	connected: AtomicBool,
	next_subscription_id: AtomicU32,
	next_server_id: AtomicU32,
	fail_connect: AtomicBool,
}
impl MockOpcAdapter {
	/// A connected adapter with no scripted behavior (reads return whatever was last set with
	/// [`MockOpcAdapter::set_value`], defaulting to not-found).
	pub fn new() -> Self {
		Self {
			state: Mutex::new(State::default()),
			connected: AtomicBool::new(true),
			next_subscription_id: AtomicU32::new(1),
			next_server_id: AtomicU32::new(1),
			fail_connect: AtomicBool::new(false),
		}
	}

	/// Set the value `read_node`/`read_nodes` return for `node_id` until overridden.
	pub async fn set_value(&self, node_id: NodeId, value: impl Into<String>) {
		self.state.lock().await.values.insert(node_id, value.into());
	}

	/// Queue a sequence of scripted responses consumed one per call.
	pub async fn script(&self, node_id: NodeId, responses: Vec<Scripted>) {
		self.state.lock().await.scripts.insert(node_id, responses);
	}

	/// Force `is_connected`/`connect` to behave as disconnected.
	pub fn set_connected(&self, connected: bool) {
		self.connected.store(connected, Ordering::Relaxed);
	}

	/// Make the next `connect()` calls fail with `Disconnected`.
	pub fn set_fail_connect(&self, fail: bool) {
		self.fail_connect.store(fail, Ordering::Relaxed);
	}

	/// Number of `read_node`/`read_nodes` calls observed so far (nodes, not batches).
	pub async fn read_call_count(&self) -> u32 {
		self.state.lock().await.read_calls
	}

	/// Number of `create_subscription` calls observed so far.
	pub async fn subscription_call_count(&self) -> u32 {
		self.state.lock().await.subscription_calls
	}

	async fn read_one(&self, node_id: &NodeId) -> Result<NodeReading, OpcError> {
		let mut state = self.state.lock().await;

		state.read_calls += 1;

		if let Some(script) = state.scripts.get_mut(node_id) {
			if !script.is_empty() {
				return match script.remove(0) {
					Scripted::Value(value) => Ok(NodeReading {
						node_id: node_id.clone(),
						value,
						status: Status::Good,
						reason: "Good".into(),
						source_timestamp_ms: 0,
					}),
					Scripted::Fail(kind) => Err(kind.into()),
				};
			}
		}

		match state.values.get(node_id) {
			Some(value) => Ok(NodeReading {
				node_id: node_id.clone(),
				value: value.clone(),
				status: Status::Good,
				reason: "Good".into(),
				source_timestamp_ms: 0,
			}),
			None => Err(OpcError::NodeError("unknown node".into())),
		}
	}
}
impl Default for MockOpcAdapter {
	fn default() -> Self {
		Self::new()
	}
}

#[async_trait]
impl OpcAdapter for MockOpcAdapter {
	async fn read_node(&self, node_id: &NodeId, _deadline: Duration) -> Result<NodeReading, OpcError> {
		if !self.is_connected() {
			return Err(OpcError::Disconnected);
		}

		self.read_one(node_id).await
	}

	async fn read_nodes(&self, node_ids: &[NodeId], deadline: Duration) -> Vec<Result<NodeReading, OpcError>> {
		let mut out = Vec::with_capacity(node_ids.len());

		for node_id in node_ids {
			out.push(self.read_node(node_id, deadline).await);
		}

		out
	}

	async fn add_monitored_item(
		&self,
		_subscription_id: u32,
		_node_id: &NodeId,
		_client_handle: u32,
	) -> Result<u32, OpcError> {
		if !self.is_connected() {
			return Err(OpcError::Disconnected);
		}

		Ok(self.next_server_id.fetch_add(1, Ordering::Relaxed))
	}

	async fn remove_monitored_item(&self, _subscription_id: u32, _server_id: u32) -> Result<(), OpcError> {
		Ok(())
	}

	async fn create_subscription(&self) -> Result<u32, OpcError> {
		if !self.is_connected() {
			return Err(OpcError::Disconnected);
		}

		self.state.lock().await.subscription_calls += 1;

		Ok(self.next_subscription_id.fetch_add(1, Ordering::Relaxed))
	}

	async fn connect(&self) -> Result<(), OpcError> {
		if self.fail_connect.load(Ordering::Relaxed) {
			return Err(OpcError::Disconnected);
		}

		self.connected.store(true, Ordering::Relaxed);

		Ok(())
	}

	async fn disconnect(&self) {
		self.connected.store(false, Ordering::Relaxed);
	}

	fn is_connected(&self) -> bool {
		self.connected.load(Ordering::Relaxed)
	}

	async fn run_iterate(&self, _max_wait: Duration) -> Result<(), OpcError> {
		Ok(())
	}
}

/// Build an [`Arc<dyn OpcAdapter>`] from a fresh [`MockOpcAdapter`].
pub fn mock_adapter() -> Arc<dyn OpcAdapter> {
	Arc::new(MockOpcAdapter::new())
}
