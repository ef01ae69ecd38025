//! State Reconciliation: after a reconnect, realigns `cache[node_id].has_subscription` with the
//! actual monitored-item set (`SPEC_FULL.md` §4.7), restoring invariant I1 when recovery was
//! partial.

use crate::{cache::Cache, subscription::SubscriptionManager};

/// Outcome of one reconciliation pass.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ReconciliationReport {
	/// Cache entries that had the flag set with no matching monitored item; flag cleared.
	pub flags_cleared: usize,
	/// Monitored items whose cache entry lacked the flag; flag set.
	pub flags_set: usize,
}

/// Align every cache entry's `has_subscription` flag with the subscription manager's actual
/// monitored-item set. Safe to call at any time; intended to run once after every successful
/// reconnection.
pub async fn reconcile(cache: &Cache, subscriptions: &SubscriptionManager) -> ReconciliationReport {
	let monitored: std::collections::HashSet<_> = subscriptions.all_monitored_items().await.into_iter().collect();
	let subscribed_in_cache = cache.subscribed_node_ids().await;
	let mut report = ReconciliationReport::default();

	for node_id in &subscribed_in_cache {
		if !monitored.contains(node_id) {
			cache.set_subscription_flag(node_id, false).await;
			report.flags_cleared += 1;
		}
	}

	for node_id in &monitored {
		if !subscribed_in_cache.contains(node_id) && cache.set_subscription_flag(node_id, true).await {
			report.flags_set += 1;
		}
	}

	report
}

#[cfg(test)]
mod tests {
	use std::sync::Arc;

	use tokio::time::Instant;

	use super::*;
	use crate::{cache::{CacheUpdate, Status}, config::Config, node_id::NodeId, test_support::MockOpcAdapter};

	fn node(id: &str) -> NodeId {
		NodeId::parse(id).unwrap()
	}

	#[tokio::test]
	async fn clears_a_stale_flag_left_over_from_a_dropped_monitored_item() {
		let config = Config::builder().build().unwrap();
		let cache = Arc::new(Cache::new(&config));
		let adapter = Arc::new(MockOpcAdapter::new());
		let subscriptions = SubscriptionManager::new(adapter, cache.clone(), &config);

		cache
			.update(
				CacheUpdate { node_id: node("ns=2;s=A"), value: "1".into(), status: Status::Good, reason: "Good".into(), source_timestamp_ms: 0 },
				Instant::now(),
			)
			.await
			.unwrap();
		cache.set_subscription_flag(&node("ns=2;s=A"), true).await;

		let report = reconcile(&cache, &subscriptions).await;

		assert_eq!(report.flags_cleared, 1);
		assert!(!cache.get(&node("ns=2;s=A"), Instant::now()).await.unwrap().has_subscription());
	}

	#[tokio::test]
	async fn sets_a_missing_flag_for_a_recovered_monitored_item() {
		let config = Config::builder().build().unwrap();
		let cache = Arc::new(Cache::new(&config));
		let adapter = Arc::new(MockOpcAdapter::new());
		let subscriptions = SubscriptionManager::new(adapter, cache.clone(), &config);

		cache
			.update(
				CacheUpdate { node_id: node("ns=2;s=A"), value: "1".into(), status: Status::Good, reason: "Good".into(), source_timestamp_ms: 0 },
				Instant::now(),
			)
			.await
			.unwrap();
		subscriptions.add(&node("ns=2;s=A"), Instant::now()).await.unwrap();
		// Simulate drift: the subscription manager has the item, but something cleared the
		// cache flag out from under it.
		cache.set_subscription_flag(&node("ns=2;s=A"), false).await;

		let report = reconcile(&cache, &subscriptions).await;

		assert_eq!(report.flags_set, 1);
		assert!(cache.get(&node("ns=2;s=A"), Instant::now()).await.unwrap().has_subscription());
	}
}
