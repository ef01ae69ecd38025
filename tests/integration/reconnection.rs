//! End-to-end reconnection scenario: a disconnect is detected, the adapter is retried until it
//! accepts `connect()`, and every previously monitored item is recreated afterward.

use std::{sync::Arc, time::Duration};

use opcua_bridge_cache::{bridge::Bridge, config::Config, node_id::NodeId, test_support::MockOpcAdapter};

fn node(id: &str) -> NodeId {
	NodeId::parse(id).unwrap()
}

#[tokio::test]
async fn reconnection_recovers_every_monitored_item() {
	let adapter = Arc::new(MockOpcAdapter::new());
	let config = Config::builder()
		.connection_initial_delay(Duration::from_millis(1))
		.connection_max_delay(Duration::from_millis(5))
		.build()
		.unwrap();
	let bridge = Arc::new(Bridge::builder(adapter.clone(), config).build());

	bridge.subscribe(&node("ns=2;s=A")).await.unwrap();
	bridge.subscribe(&node("ns=2;s=B")).await.unwrap();

	assert_eq!(bridge.subscription_stats().await.total_monitored_items, 2);

	adapter.set_connected(false);
	bridge.start().await;

	for _ in 0..100 {
		if bridge.reconnection_stats().successful_reconnections >= 1 {
			break;
		}
		tokio::time::sleep(Duration::from_millis(10)).await;
	}

	assert_eq!(bridge.reconnection_stats().successful_reconnections, 1);
	assert_eq!(bridge.reconnection_stats().successful_subscription_recoveries, 2);

	bridge.stop().await;
}
