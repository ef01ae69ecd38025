//! Subscription Manager: owns the single OPC UA subscription and every monitored item
//! attached to it, routes push notifications into the cache, and recovers after reconnection.

use std::{
	collections::HashMap,
	sync::{
		Arc,
		atomic::{AtomicU32, AtomicU64, Ordering},
	},
	time::Duration,
};

use tokio::{sync::RwLock, time::Instant};

use crate::{
	cache::{Cache, CacheUpdate, Status},
	config::Config,
	node_id::NodeId,
	opc::{OpcAdapter, OpcError, SubscriptionStatus},
};

/// Subscription-side lifecycle, `SPEC_FULL.md` §4.3.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SubscriptionLifecycle {
	/// No subscription created yet.
	Idle,
	/// The subscription is live and the server is affirming it.
	Active,
	/// Inactivity, a bad subscription id, or a closed connection was reported; the
	/// Reconnection Manager, not this component, decides whether to recreate.
	Inactive,
}

/// Bookkeeping for one monitored item.
#[derive(Clone, Debug)]
pub struct MonitoredItem {
	node_id: NodeId,
	server_id: u32,
	client_handle: u32,
	last_accessed: Instant,
	active: bool,
}
impl MonitoredItem {
	/// The node this item monitors.
	pub fn node_id(&self) -> &NodeId {
		&self.node_id
	}

	/// Server-assigned monitored item id.
	pub fn server_id(&self) -> u32 {
		self.server_id
	}

	/// Locally minted handle used to route notifications back to `node_id`.
	pub fn client_handle(&self) -> u32 {
		self.client_handle
	}

	/// Last time this item was touched by a read or a notification.
	pub fn last_accessed(&self) -> Instant {
		self.last_accessed
	}

	/// Whether the server has confirmed this item.
	pub fn active(&self) -> bool {
		self.active
	}
}

/// Snapshot of [`SubscriptionManager`] counters.
#[derive(Clone, Debug)]
pub struct SubscriptionStatsSnapshot {
	/// Server-assigned subscription id, if one has been created.
	pub subscription_id: Option<u32>,
	/// Total monitored items, active and inactive.
	pub total_monitored_items: usize,
	/// Monitored items the server has confirmed.
	pub active_monitored_items: usize,
	/// Monitored items not yet confirmed (or dropped by a partial recreate failure).
	pub inactive_monitored_items: usize,
	/// Data-change notifications received over the lifetime of this manager.
	pub total_notifications: u64,
	/// Errors encountered (failed adds/removes, partial recreate failures).
	pub total_errors: u64,
	/// Whether the subscription is currently believed active.
	pub is_subscription_active: bool,
}

/// The result of [`SubscriptionManager::recreate_all`]: which items were restored, and which
/// were dropped because the server rejected them.
#[derive(Clone, Debug, Default)]
pub struct RecreateOutcome {
	/// Node ids successfully re-added.
	pub recovered: Vec<NodeId>,
	/// Node ids that failed to re-add and were dropped from the set.
	pub failed: Vec<NodeId>,
}

struct State {
	subscription_id: Option<u32>,
	items: HashMap<NodeId, MonitoredItem>,
	handle_to_node: HashMap<u32, NodeId>,
	lifecycle: SubscriptionLifecycle,
}

/// Owns the subscription and monitored-item lifecycle described in `SPEC_FULL.md` §4.3.
pub struct SubscriptionManager {
	adapter: Arc<dyn OpcAdapter>,
	cache: Arc<Cache>,
	state: RwLock<State>,
	next_handle: AtomicU32,
	item_expire: Duration,
	total_notifications: AtomicU64,
	total_errors: AtomicU64,
}
impl SubscriptionManager {
	/// Build a manager with no subscription yet created.
	///
	/// Handle allocation starts at 1000, matching the reference implementation; there is no
	/// wraparound policy (resolved open question 4, see `DESIGN.md`).
	pub fn new(adapter: Arc<dyn OpcAdapter>, cache: Arc<Cache>, config: &Config) -> Self {
		Self {
			adapter,
			cache,
			state: RwLock::new(State {
				subscription_id: None,
				items: HashMap::new(),
				handle_to_node: HashMap::new(),
				lifecycle: SubscriptionLifecycle::Idle,
			}),
			next_handle: AtomicU32::new(1000),
			item_expire: config.subscription_item_expire,
			total_notifications: AtomicU64::new(0),
			total_errors: AtomicU64::new(0),
		}
	}

	/// Lazily create the subscription if it does not exist yet.
	async fn ensure_subscription(&self, state: &mut State) -> Result<u32, OpcError> {
		if let Some(id) = state.subscription_id {
			return Ok(id);
		}

		let id = self.adapter.create_subscription().await?;

		state.subscription_id = Some(id);
		state.lifecycle = SubscriptionLifecycle::Active;

		Ok(id)
	}

	/// Add a monitored item for `node_id`. If already present and active, just bumps
	/// `last_accessed` and returns (idempotent, P-round-trip).
	pub async fn add(&self, node_id: &NodeId, now: Instant) -> Result<(), OpcError> {
		let mut state = self.state.write().await;

		if let Some(existing) = state.items.get_mut(node_id) {
			if existing.active {
				existing.last_accessed = now;

				return Ok(());
			}
		}

		let subscription_id = self.ensure_subscription(&mut state).await?;
		let client_handle = self.next_handle.fetch_add(1, Ordering::Relaxed);
		let result = self.adapter.add_monitored_item(subscription_id, node_id, client_handle).await;

		match result {
			Ok(server_id) => {
				state.items.insert(
					node_id.clone(),
					MonitoredItem { node_id: node_id.clone(), server_id, client_handle, last_accessed: now, active: true },
				);
				state.handle_to_node.insert(client_handle, node_id.clone());
				drop(state);

				self.cache.set_subscription_flag(node_id, true).await;

				Ok(())
			},
			Err(err) => {
				self.total_errors.fetch_add(1, Ordering::Relaxed);

				Err(err)
			},
		}
	}

	/// Remove a monitored item, clearing the matching cache flag.
	pub async fn remove(&self, node_id: &NodeId) -> Result<(), OpcError> {
		let mut state = self.state.write().await;
		let Some(item) = state.items.remove(node_id) else { return Ok(()) };

		state.handle_to_node.remove(&item.client_handle);

		let subscription_id = state.subscription_id;

		drop(state);

		if let Some(subscription_id) = subscription_id {
			self.adapter.remove_monitored_item(subscription_id, item.server_id).await?;
		}

		self.cache.set_subscription_flag(node_id, false).await;

		Ok(())
	}

	/// Route a data-change notification into the cache. Unknown handles are dropped and
	/// logged (`InternalInvariantViolation`, `SPEC_FULL.md` §7).
	pub async fn handle_notification(
		&self,
		client_handle: u32,
		value: String,
		status: Status,
		reason: String,
		source_timestamp_ms: i64,
		now: Instant,
	) {
		self.total_notifications.fetch_add(1, Ordering::Relaxed);

		let node_id = {
			let mut state = self.state.write().await;
			let Some(node_id) = state.handle_to_node.get(&client_handle).cloned() else {
				tracing::error!(client_handle, "notification for unknown client handle, dropping");

				return;
			};

			if let Some(item) = state.items.get_mut(&node_id) {
				item.last_accessed = now;
			}

			node_id
		};

		let _ = self
			.cache
			.update(CacheUpdate { node_id, value, status, reason, source_timestamp_ms }, now)
			.await;
	}

	/// React to a server-reported subscription status change.
	pub async fn handle_status_change(&self, status: SubscriptionStatus) {
		let mut state = self.state.write().await;

		state.lifecycle = match status {
			SubscriptionStatus::Good => SubscriptionLifecycle::Active,
			SubscriptionStatus::BadSubscriptionIdInvalid | SubscriptionStatus::BadConnectionClosed =>
				SubscriptionLifecycle::Inactive,
			SubscriptionStatus::Other => state.lifecycle,
		};

		for item in state.items.values_mut() {
			item.active = state.lifecycle == SubscriptionLifecycle::Active;
		}
	}

	/// Mark the subscription inactive due to observed inactivity. Does not itself recreate —
	/// the Reconnection Manager owns that decision.
	pub async fn mark_inactive(&self) {
		let mut state = self.state.write().await;

		state.lifecycle = SubscriptionLifecycle::Inactive;
	}

	/// Discard the old subscription id, create a fresh one, and re-add every previously
	/// known monitored item. Partial failure is non-fatal: failed items are dropped and their
	/// cache flags cleared.
	pub async fn recreate_all(&self, now: Instant) -> RecreateOutcome {
		let node_ids: Vec<NodeId> = {
			let mut state = self.state.write().await;

			state.subscription_id = None;
			state.handle_to_node.clear();
			state.items.keys().cloned().collect()
		};
		let mut outcome = RecreateOutcome::default();

		for node_id in node_ids {
			{
				let mut state = self.state.write().await;

				state.items.remove(&node_id);
			}

			match self.add(&node_id, now).await {
				Ok(()) => outcome.recovered.push(node_id),
				Err(_) => {
					self.cache.set_subscription_flag(&node_id, false).await;

					outcome.failed.push(node_id);
				},
			}
		}

		outcome
	}

	/// Remove items idle longer than `item_expire`. Never removes an item that has been
	/// queried or notified within the window.
	pub async fn cleanup_unused(&self, now: Instant) -> usize {
		let doomed: Vec<NodeId> = {
			let state = self.state.read().await;

			state
				.items
				.values()
				.filter(|item| now.saturating_duration_since(item.last_accessed) >= self.item_expire)
				.map(|item| item.node_id.clone())
				.collect()
		};

		for node_id in &doomed {
			let _ = self.remove(node_id).await;
		}

		doomed.len()
	}

	/// Bump `last_accessed` for an item without otherwise touching it; called when data is
	/// requested through the read path.
	pub async fn touch(&self, node_id: &NodeId, now: Instant) {
		let mut state = self.state.write().await;

		if let Some(item) = state.items.get_mut(node_id) {
			item.last_accessed = now;
		}
	}

	/// Whether a monitored item exists (active or inactive) for `node_id`.
	pub async fn has_monitored_item(&self, node_id: &NodeId) -> bool {
		self.state.read().await.items.contains_key(node_id)
	}

	/// Node ids with a confirmed-active monitored item.
	pub async fn active_monitored_items(&self) -> Vec<NodeId> {
		self.state.read().await.items.values().filter(|item| item.active).map(|item| item.node_id.clone()).collect()
	}

	/// Every monitored node id, active and inactive.
	pub async fn all_monitored_items(&self) -> Vec<NodeId> {
		self.state.read().await.items.keys().cloned().collect()
	}

	/// Current lifecycle state.
	pub async fn lifecycle(&self) -> SubscriptionLifecycle {
		self.state.read().await.lifecycle
	}

	/// Clear every monitored item without contacting the server (used on shutdown).
	pub async fn clear(&self) {
		let mut state = self.state.write().await;

		state.items.clear();
		state.handle_to_node.clear();
		state.subscription_id = None;
		state.lifecycle = SubscriptionLifecycle::Idle;
	}

	/// Snapshot counters for telemetry.
	pub async fn stats(&self) -> SubscriptionStatsSnapshot {
		let state = self.state.read().await;
		let active = state.items.values().filter(|item| item.active).count();

		SubscriptionStatsSnapshot {
			subscription_id: state.subscription_id,
			total_monitored_items: state.items.len(),
			active_monitored_items: active,
			inactive_monitored_items: state.items.len() - active,
			total_notifications: self.total_notifications.load(Ordering::Relaxed),
			total_errors: self.total_errors.load(Ordering::Relaxed),
			is_subscription_active: state.lifecycle == SubscriptionLifecycle::Active,
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::test_support::MockOpcAdapter;

	fn node(id: &str) -> NodeId {
		NodeId::parse(id).unwrap()
	}

	#[tokio::test]
	async fn add_twice_is_idempotent_and_bumps_last_accessed() {
		let adapter = Arc::new(MockOpcAdapter::new());
		let cache = Arc::new(Cache::new(&Config::builder().build().unwrap()));
		let manager = SubscriptionManager::new(adapter, cache.clone(), &Config::builder().build().unwrap());
		let now = Instant::now();

		manager.add(&node("ns=2;s=A"), now).await.unwrap();
		manager.add(&node("ns=2;s=A"), now + Duration::from_secs(1)).await.unwrap();

		assert_eq!(manager.all_monitored_items().await.len(), 1);

		let stats = manager.stats().await;

		assert_eq!(stats.total_monitored_items, 1);
	}

	#[tokio::test]
	async fn add_sets_the_cache_flag() {
		let adapter = Arc::new(MockOpcAdapter::new());
		let cache = Arc::new(Cache::new(&Config::builder().build().unwrap()));
		let manager = SubscriptionManager::new(adapter, cache.clone(), &Config::builder().build().unwrap());
		let now = Instant::now();

		cache
			.update(
				CacheUpdate {
					node_id: node("ns=2;s=A"),
					value: "1".into(),
					status: Status::Good,
					reason: "Good".into(),
					source_timestamp_ms: 0,
				},
				now,
			)
			.await
			.unwrap();
		manager.add(&node("ns=2;s=A"), now).await.unwrap();

		let entry = cache.get(&node("ns=2;s=A"), now).await.unwrap();

		assert!(entry.has_subscription());
	}

	#[tokio::test]
	async fn notification_for_unknown_handle_is_dropped() {
		let adapter = Arc::new(MockOpcAdapter::new());
		let cache = Arc::new(Cache::new(&Config::builder().build().unwrap()));
		let manager = SubscriptionManager::new(adapter, cache.clone(), &Config::builder().build().unwrap());

		manager.handle_notification(9999, "1".into(), Status::Good, "Good".into(), 0, Instant::now()).await;

		assert_eq!(manager.stats().await.total_notifications, 1);
		assert_eq!(cache.len().await, 0);
	}

	#[tokio::test]
	async fn recreate_all_restores_every_item_when_adapter_accepts_them() {
		let adapter = Arc::new(MockOpcAdapter::new());
		let cache = Arc::new(Cache::new(&Config::builder().build().unwrap()));
		let manager = SubscriptionManager::new(adapter, cache, &Config::builder().build().unwrap());
		let now = Instant::now();

		manager.add(&node("ns=2;s=A"), now).await.unwrap();
		manager.add(&node("ns=2;s=B"), now).await.unwrap();

		let outcome = manager.recreate_all(now).await;

		assert_eq!(outcome.recovered.len(), 2);
		assert!(outcome.failed.is_empty());
		assert_eq!(manager.active_monitored_items().await.len(), 2);
	}

	#[tokio::test]
	async fn cleanup_unused_leaves_recently_touched_items() {
		let adapter = Arc::new(MockOpcAdapter::new());
		let cache = Arc::new(Cache::new(&Config::builder().build().unwrap()));
		let config = Config::builder().subscription_item_expire(Duration::from_secs(30)).build().unwrap();
		let manager = SubscriptionManager::new(adapter, cache, &config);
		let now = Instant::now();

		manager.add(&node("ns=2;s=A"), now).await.unwrap();

		assert_eq!(manager.cleanup_unused(now + Duration::from_secs(10)).await, 0);
		assert_eq!(manager.cleanup_unused(now + Duration::from_secs(60)).await, 1);
	}
}
