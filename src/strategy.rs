//! Read Strategy: classifies each request into FRESH/STALE/EXPIRED and dispatches accordingly,
//! deduplicating concurrent EXPIRED reads of the same node and bounding total concurrent
//! upstream reads.

use std::{collections::HashMap, sync::Arc, time::Duration};

use tokio::{
	sync::{Mutex, Notify, Semaphore},
	time::Instant,
};

use crate::{
	background::BackgroundUpdater,
	cache::{Cache, CacheEntry, CacheUpdate, Freshness},
	config::Config,
	error_handler::ErrorHandler,
	node_id::NodeId,
	opc::OpcAdapter,
	response::ReadResult,
};

/// Dispatches reads between the cache and the OPC UA adapter per `SPEC_FULL.md` §4.2.
pub struct ReadStrategy {
	cache: Arc<Cache>,
	adapter: Arc<dyn OpcAdapter>,
	background: Arc<BackgroundUpdater>,
	error_handler: Arc<ErrorHandler>,
	refresh_threshold: Duration,
	expire: Duration,
	read_timeout: Duration,
	batch_size: usize,
	concurrency: Semaphore,
	in_flight: Mutex<HashMap<NodeId, Arc<Notify>>>,
}
impl ReadStrategy {
	/// Build a strategy wired to its collaborators.
	pub fn new(
		cache: Arc<Cache>,
		adapter: Arc<dyn OpcAdapter>,
		background: Arc<BackgroundUpdater>,
		error_handler: Arc<ErrorHandler>,
		config: &Config,
	) -> Self {
		Self {
			cache,
			adapter,
			background,
			error_handler,
			refresh_threshold: config.cache_refresh_threshold,
			expire: config.cache_expire,
			read_timeout: config.opc_read_timeout,
			batch_size: config.opc_batch_size,
			concurrency: Semaphore::new(config.cache_concurrent_reads),
			in_flight: Mutex::new(HashMap::new()),
		}
	}

	/// Serve a single node id.
	pub async fn process_node_request(&self, node_id: &NodeId) -> ReadResult {
		let now = Instant::now();
		let now_ms = unix_millis();
		let status = self.cache.get_with_status(node_id, self.refresh_threshold, self.expire, now).await;

		match status.freshness {
			Freshness::Fresh => from_entry(status.entry.expect("Fresh implies an entry")),
			Freshness::Stale => {
				self.background.schedule(node_id.clone()).await;

				from_entry(status.entry.expect("Stale implies an entry"))
			},
			Freshness::Expired => self.read_expired(node_id, now, now_ms).await,
		}
	}

	/// Serve many node ids, preserving input order in the output.
	pub async fn process_node_requests(&self, node_ids: &[NodeId]) -> Vec<ReadResult> {
		if node_ids.is_empty() {
			return Vec::new();
		}

		let now = Instant::now();
		let now_ms = unix_millis();
		let statuses = self.cache.get_many_with_status(node_ids, self.refresh_threshold, self.expire, now).await;
		let mut out: Vec<Option<ReadResult>> = vec![None; node_ids.len()];
		let mut expired_indices = Vec::new();
		let mut stale_to_schedule = Vec::new();

		for (index, (node_id, status)) in node_ids.iter().zip(statuses).enumerate() {
			match status.freshness {
				Freshness::Fresh => out[index] = Some(from_entry(status.entry.expect("Fresh implies an entry"))),
				Freshness::Stale => {
					stale_to_schedule.push(node_id.clone());
					out[index] = Some(from_entry(status.entry.expect("Stale implies an entry")));
				},
				Freshness::Expired => expired_indices.push(index),
			}
		}

		if !stale_to_schedule.is_empty() {
			self.background.schedule_batch(stale_to_schedule).await;
		}

		for chunk in expired_indices.chunks(self.batch_size) {
			let chunk_node_ids: Vec<NodeId> = chunk.iter().map(|&index| node_ids[index].clone()).collect();
			let results = self.read_expired_batch(&chunk_node_ids, now, now_ms).await;

			for (&index, result) in chunk.iter().zip(results) {
				out[index] = Some(result);
			}
		}

		out.into_iter().map(|result| result.expect("every index categorized and filled")).collect()
	}

	/// Handle one EXPIRED node: single-flight dedup, a bounded-concurrency permit, then a
	/// synchronous upstream read with fallback on error.
	async fn read_expired(&self, node_id: &NodeId, now: Instant, now_ms: i64) -> ReadResult {
		let notify = {
			let mut in_flight = self.in_flight.lock().await;

			if let Some(existing) = in_flight.get(node_id) {
				Some(Arc::clone(existing))
			} else {
				in_flight.insert(node_id.clone(), Arc::new(Notify::new()));

				None
			}
		};

		if let Some(notify) = notify {
			notify.notified().await;

			if let Some(entry) = self.cache.get(node_id, now).await {
				return from_entry(entry);
			}
			// The leader's read failed and left nothing cached; fall through and lead ourselves.
		}

		let _permit = self.concurrency.acquire().await.expect("semaphore is never closed");
		let result = match tokio::time::timeout(self.read_timeout, self.adapter.read_node(node_id, self.read_timeout)).await {
			Ok(Ok(reading)) => {
				let _ = self
					.cache
					.update(
						CacheUpdate {
							node_id: reading.node_id.clone(),
							value: reading.value.clone(),
							status: reading.status,
							reason: reading.reason.clone(),
							source_timestamp_ms: reading.source_timestamp_ms,
						},
						now,
					)
					.await;

				ReadResult::ok(reading.node_id, reading.value, reading.status, reading.reason, reading.source_timestamp_ms)
			},
			Ok(Err(error)) => self.error_handler.handle(node_id, error, now, now_ms).await,
			Err(_) => self.error_handler.handle(node_id, crate::opc::OpcError::Timeout, now, now_ms).await,
		};

		let mut in_flight = self.in_flight.lock().await;

		if let Some(notify) = in_flight.remove(node_id) {
			notify.notify_waiters();
		}

		result
	}

	async fn read_expired_batch(&self, node_ids: &[NodeId], now: Instant, now_ms: i64) -> Vec<ReadResult> {
		let _permit = self.concurrency.acquire().await.expect("semaphore is never closed");
		let results = self.adapter.read_nodes(node_ids, self.read_timeout).await;

		self.error_handler.handle_partial_batch(node_ids, results, now, now_ms).await
	}
}

fn from_entry(entry: CacheEntry) -> ReadResult {
	ReadResult::ok(entry.node_id().clone(), entry.value().to_string(), entry.status(), entry.reason().to_string(), entry.source_timestamp_ms())
}

fn unix_millis() -> i64 {
	std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).map(|d| d.as_millis() as i64).unwrap_or(0)
}
