//! Background Updater: a bounded work queue, a dedup set, and a worker pool that refresh
//! STALE entries without blocking the caller that triggered them.

use std::{
	collections::HashSet,
	sync::{
		Arc,
		atomic::{AtomicU64, Ordering},
	},
	time::Duration,
};

use tokio::{
	sync::{Mutex, mpsc},
	task::JoinHandle,
	time::Instant,
};

use crate::{
	cache::{Cache, CacheUpdate},
	config::Config,
	node_id::NodeId,
	opc::OpcAdapter,
};

/// Snapshot of [`BackgroundUpdater`] counters.
#[derive(Clone, Copy, Debug, Default)]
pub struct UpdateStats {
	/// Updates accepted onto the queue.
	pub total_updates: u64,
	/// Updates that completed with a cache write.
	pub successful_updates: u64,
	/// Updates that failed (adapter error, or the node disappeared from the cache).
	pub failed_updates: u64,
	/// `schedule` calls that found the node already pending and were dropped.
	pub duplicate_updates: u64,
	/// `schedule` calls dropped because the queue was full (`SPEC_FULL.md` §4.4 boundary
	/// behavior: drop-newest, never block the caller).
	pub dropped_updates: u64,
}

struct Stats {
	total: AtomicU64,
	successful: AtomicU64,
	failed: AtomicU64,
	duplicate: AtomicU64,
	dropped: AtomicU64,
}
impl Stats {
	fn snapshot(&self) -> UpdateStats {
		UpdateStats {
			total_updates: self.total.load(Ordering::Relaxed),
			successful_updates: self.successful.load(Ordering::Relaxed),
			failed_updates: self.failed.load(Ordering::Relaxed),
			duplicate_updates: self.duplicate.load(Ordering::Relaxed),
			dropped_updates: self.dropped.load(Ordering::Relaxed),
		}
	}
}

/// Worker pool plus bounded queue driving asynchronous refresh of STALE entries.
///
/// The queue and the dedup set are separate data structures (an `mpsc` channel and a
/// `Mutex<HashSet>`) but are always updated together under the dedup set's lock, matching the
/// lock-ordering rule in `SPEC_FULL.md` §5 (Cache → Subscriptions → BackgroundQueue → DedupSet
/// is never taken in reverse; this component never holds its own lock across a cache call).
pub struct BackgroundUpdater {
	adapter: Arc<dyn OpcAdapter>,
	cache: Arc<Cache>,
	sender: mpsc::Sender<NodeId>,
	receiver: Arc<Mutex<mpsc::Receiver<NodeId>>>,
	pending: Arc<Mutex<HashSet<NodeId>>>,
	workers: Mutex<Vec<JoinHandle<()>>>,
	worker_count: usize,
	timeout: Duration,
	stats: Arc<Stats>,
}
impl BackgroundUpdater {
	/// Build an updater; no workers run until [`BackgroundUpdater::start`] is called.
	pub fn new(adapter: Arc<dyn OpcAdapter>, cache: Arc<Cache>, config: &Config) -> Self {
		let (sender, receiver) = mpsc::channel(config.background_update_queue_size);

		Self {
			adapter,
			cache,
			sender,
			receiver: Arc::new(Mutex::new(receiver)),
			pending: Arc::new(Mutex::new(HashSet::new())),
			workers: Mutex::new(Vec::new()),
			worker_count: config.background_update_threads,
			timeout: config.background_update_timeout,
			stats: Arc::new(Stats {
				total: AtomicU64::new(0),
				successful: AtomicU64::new(0),
				failed: AtomicU64::new(0),
				duplicate: AtomicU64::new(0),
				dropped: AtomicU64::new(0),
			}),
		}
	}

	/// Schedule a refresh for one node. A no-op if `node_id` is already pending; drops the
	/// request (counted, never blocks) if the queue is full.
	pub async fn schedule(&self, node_id: NodeId) {
		let mut pending = self.pending.lock().await;

		if !pending.insert(node_id.clone()) {
			self.stats.duplicate.fetch_add(1, Ordering::Relaxed);
			#[cfg(feature = "metrics")]
			crate::metrics::record_background_scheduled(true, false);

			return;
		}

		match self.sender.try_send(node_id.clone()) {
			Ok(()) => {
				self.stats.total.fetch_add(1, Ordering::Relaxed);
				#[cfg(feature = "metrics")]
				crate::metrics::record_background_scheduled(false, false);
			},
			Err(_) => {
				pending.remove(&node_id);
				self.stats.dropped.fetch_add(1, Ordering::Relaxed);
				#[cfg(feature = "metrics")]
				crate::metrics::record_background_scheduled(false, true);
			},
		}
	}

	/// Schedule refreshes for many nodes in one call.
	pub async fn schedule_batch(&self, node_ids: impl IntoIterator<Item = NodeId>) {
		for node_id in node_ids {
			self.schedule(node_id).await;
		}
	}

	/// Spawn the worker pool. Calling this twice spawns a second pool on top of the first;
	/// callers are expected to pair it with exactly one [`BackgroundUpdater::stop`].
	pub async fn start(self: &Arc<Self>) {
		let mut workers = self.workers.lock().await;

		for _ in 0..self.worker_count {
			let this = Arc::clone(self);

			workers.push(tokio::spawn(async move { this.worker_loop().await }));
		}
	}

	/// Abort every worker task. In-flight reads are cancelled; queued-but-unstarted work is
	/// dropped without being counted as failed.
	pub async fn stop(&self) {
		let mut workers = self.workers.lock().await;

		for worker in workers.drain(..) {
			worker.abort();
		}
	}

	/// Whether the worker pool has at least one task registered.
	pub async fn is_running(&self) -> bool {
		!self.workers.lock().await.is_empty()
	}

	/// Snapshot counters for telemetry.
	pub fn stats(&self) -> UpdateStats {
		self.stats.snapshot()
	}

	async fn worker_loop(&self) {
		loop {
			let node_id = {
				let mut receiver = self.receiver.lock().await;

				match receiver.recv().await {
					Some(node_id) => node_id,
					None => return,
				}
			};

			self.process_update(&node_id).await;
			self.pending.lock().await.remove(&node_id);
		}
	}

	async fn process_update(&self, node_id: &NodeId) {
		match self.adapter.read_node(node_id, self.timeout).await {
			Ok(reading) => {
				let result = self
					.cache
					.update(
						CacheUpdate {
							node_id: reading.node_id,
							value: reading.value,
							status: reading.status,
							reason: reading.reason,
							source_timestamp_ms: reading.source_timestamp_ms,
						},
						Instant::now(),
					)
					.await;

				match result {
					Ok(()) => {
						self.stats.successful.fetch_add(1, Ordering::Relaxed);
						#[cfg(feature = "metrics")]
						crate::metrics::record_background_result(true);
					},
					Err(error) => {
						tracing::warn!(%node_id, %error, "background refresh could not write to cache");
						self.stats.failed.fetch_add(1, Ordering::Relaxed);
						#[cfg(feature = "metrics")]
						crate::metrics::record_background_result(false);
					},
				}
			},
			Err(error) => {
				tracing::debug!(%node_id, %error, "background refresh failed");
				self.stats.failed.fetch_add(1, Ordering::Relaxed);
				#[cfg(feature = "metrics")]
				crate::metrics::record_background_result(false);
			},
		}
	}
}

#[cfg(test)]
mod tests {
	use std::time::Duration as StdDuration;

	use super::*;
	use crate::{cache::Status, node_id::NodeId, test_support::MockOpcAdapter};

	fn node(id: &str) -> NodeId {
		NodeId::parse(id).unwrap()
	}

	#[tokio::test]
	async fn duplicate_schedule_is_counted_and_dropped() {
		let adapter = Arc::new(MockOpcAdapter::new());
		let cache = Arc::new(Cache::new(&Config::builder().build().unwrap()));
		let updater = Arc::new(BackgroundUpdater::new(adapter, cache, &Config::builder().build().unwrap()));

		updater.schedule(node("ns=2;s=A")).await;
		updater.schedule(node("ns=2;s=A")).await;

		assert_eq!(updater.stats().total_updates, 1);
		assert_eq!(updater.stats().duplicate_updates, 1);
	}

	#[tokio::test]
	async fn worker_refreshes_queued_node_into_the_cache() {
		let adapter = Arc::new(MockOpcAdapter::new());

		adapter.set_value(node("ns=2;s=A"), "7").await;

		let cache = Arc::new(Cache::new(&Config::builder().build().unwrap()));
		let updater = Arc::new(BackgroundUpdater::new(adapter, cache.clone(), &Config::builder().build().unwrap()));

		updater.start().await;
		updater.schedule(node("ns=2;s=A")).await;

		for _ in 0..50 {
			if cache.len().await == 1 {
				break;
			}
			tokio::time::sleep(StdDuration::from_millis(10)).await;
		}

		let entry = cache.get(&node("ns=2;s=A"), Instant::now()).await.unwrap();

		assert_eq!(entry.value(), "7");
		assert_eq!(entry.status(), Status::Good);

		updater.stop().await;
	}

	#[tokio::test]
	async fn full_queue_drops_and_counts_instead_of_blocking() {
		let adapter = Arc::new(MockOpcAdapter::new());
		let cache = Arc::new(Cache::new(&Config::builder().build().unwrap()));
		let config = Config::builder().background_update_queue_size(1).build().unwrap();
		let updater = Arc::new(BackgroundUpdater::new(adapter, cache, &config));

		// No worker started, so the queue never drains.
		updater.schedule(node("ns=2;s=A")).await;
		updater.schedule(node("ns=2;s=B")).await;

		assert_eq!(updater.stats().dropped_updates, 1);
	}
}
