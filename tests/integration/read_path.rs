//! End-to-end read-path scenarios against the assembled [`Bridge`], covering freshness
//! classification, cache fallback on error, and single-flight dedup of concurrent EXPIRED reads.

use std::{sync::Arc, time::Duration};

use opcua_bridge_cache::{
	bridge::Bridge,
	cache::{CacheUpdate, Status},
	config::Config,
	node_id::NodeId,
	test_support::MockOpcAdapter,
};

fn node(id: &str) -> NodeId {
	NodeId::parse(id).unwrap()
}

#[tokio::test]
async fn fresh_entry_is_served_without_touching_the_adapter() {
	let adapter = Arc::new(MockOpcAdapter::new());
	let config = Config::builder().build().unwrap();
	let bridge = Arc::new(Bridge::builder(adapter.clone(), config).build());

	bridge.cache().update(
		CacheUpdate { node_id: node("ns=2;s=A"), value: "1".into(), status: Status::Good, reason: "Good".into(), source_timestamp_ms: 0 },
		tokio::time::Instant::now(),
	).await.unwrap();

	let result = bridge.read(&node("ns=2;s=A")).await;

	assert!(result.is_success());
	assert_eq!(adapter.read_call_count().await, 0);
}

#[tokio::test]
async fn stale_entry_is_served_from_cache_and_schedules_exactly_one_background_refresh() {
	let adapter = Arc::new(MockOpcAdapter::new());

	adapter.set_value(node("ns=2;s=A"), "2").await;

	let config = Config::builder().cache_refresh_threshold(Duration::from_millis(0)).cache_expire(Duration::from_secs(60)).build().unwrap();
	let bridge = Arc::new(Bridge::builder(adapter.clone(), config).build());

	bridge.cache().update(
		CacheUpdate { node_id: node("ns=2;s=A"), value: "1".into(), status: Status::Good, reason: "Good".into(), source_timestamp_ms: 0 },
		tokio::time::Instant::now(),
	).await.unwrap();

	bridge.start().await;

	let result = bridge.read(&node("ns=2;s=A")).await;

	assert!(result.is_success());

	for _ in 0..50 {
		if adapter.read_call_count().await == 1 {
			break;
		}
		tokio::time::sleep(Duration::from_millis(10)).await;
	}

	assert_eq!(adapter.read_call_count().await, 1);

	bridge.stop().await;
}

#[tokio::test]
async fn expired_misses_are_read_through_the_batch_path() {
	let adapter = Arc::new(MockOpcAdapter::new());

	adapter.set_value(node("ns=2;s=A"), "a").await;
	adapter.set_value(node("ns=2;s=B"), "b").await;

	let config = Config::builder().build().unwrap();
	let bridge = Arc::new(Bridge::builder(adapter.clone(), config).build());

	let ids = vec![node("ns=2;s=A"), node("ns=2;s=B")];
	let results = bridge.read_many(&ids).await;

	assert_eq!(results.len(), 2);
	assert!(results.iter().all(|result| result.is_success()));
	assert_eq!(bridge.cache_stats().await.entries, 2);
}

#[tokio::test]
async fn connection_failure_falls_back_to_cached_data_with_the_documented_reason() {
	let adapter = Arc::new(MockOpcAdapter::new());
	let config =
		Config::builder().cache_refresh_threshold(Duration::from_millis(0)).cache_expire(Duration::from_millis(0)).build().unwrap();
	let bridge = Arc::new(Bridge::builder(adapter.clone(), config).build());

	bridge
		.cache()
		.update(
			CacheUpdate { node_id: node("ns=2;s=A"), value: "7".into(), status: Status::Good, reason: "Good".into(), source_timestamp_ms: 0 },
			tokio::time::Instant::now(),
		)
		.await
		.unwrap();

	// Let the entry age past the (zeroed) expire threshold, then take the adapter offline.
	tokio::time::sleep(Duration::from_millis(10)).await;
	adapter.set_connected(false);

	let result = bridge.read(&node("ns=2;s=A")).await;

	assert!(result.is_success());

	let json = serde_json::to_value(&result).unwrap();
	let reason = json["reason"].as_str().unwrap();

	assert!(reason.starts_with("Connection Error - Using Cached Data (age:"), "unexpected reason: {reason}");
	assert!(reason.ends_with("s)"), "unexpected reason: {reason}");
}

#[tokio::test]
async fn concurrent_expired_reads_of_the_same_node_are_deduplicated_into_one_upstream_call() {
	let adapter = Arc::new(MockOpcAdapter::new());

	adapter.set_value(node("ns=2;s=A"), "5").await;

	let config = Config::builder().build().unwrap();
	let bridge = Arc::new(Bridge::builder(adapter.clone(), config).build());

	let mut handles = Vec::new();

	for _ in 0..5 {
		let bridge = Arc::clone(&bridge);

		handles.push(tokio::spawn(async move { bridge.read(&node("ns=2;s=A")).await }));
	}

	for handle in handles {
		assert!(handle.await.unwrap().is_success());
	}

	assert_eq!(adapter.read_call_count().await, 1);
}
