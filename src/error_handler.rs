//! Error Handler: decides, for each failed read, whether to fall back to a cached value,
//! retry the upstream call, or surface an error — and tracks the error-rate window that the
//! Reconnection Manager consults to decide whether a monitoring flag should be raised.

use std::{
	collections::VecDeque,
	sync::{
		Arc,
		atomic::{AtomicU64, Ordering},
	},
	time::Duration,
};

use tokio::{sync::Mutex, time::Instant};

use crate::{
	cache::{Cache, CacheEntry},
	config::Config,
	node_id::NodeId,
	opc::{OpcAdapter, OpcError},
	response::ReadResult,
};

const MAX_RECENT_ERRORS: usize = 100;
const ERROR_WINDOW: Duration = Duration::from_secs(60);

/// What the caller should do in response to a failed read, `SPEC_FULL.md` §4.5.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ErrorAction {
	/// Serve the cached value even though it is stale or expired.
	ReturnCached,
	/// No cached value exists; surface an error to the client.
	ReturnError,
	/// The error is recoverable and no cache fallback exists yet; retry the call.
	RetryConnection,
}

/// Snapshot of [`ErrorHandler`] counters.
#[derive(Clone, Copy, Debug, Default)]
pub struct ErrorStats {
	/// Errors observed across every call.
	pub total_errors: u64,
	/// Errors classified as connection-class.
	pub connection_errors: u64,
	/// Errors for which a cached value was available as fallback.
	pub cache_hit_on_error: u64,
	/// Errors with no cached value to fall back to.
	pub cache_miss_on_error: u64,
	/// Retry attempts made.
	pub retry_attempts: u64,
	/// Retries that ultimately succeeded.
	pub successful_retries: u64,
	/// Retries that exhausted the budget without success.
	pub failed_retries: u64,
	/// Errors per minute, computed over the trailing 60s / 100-entry window.
	pub error_rate: f64,
}

struct Counters {
	total: AtomicU64,
	connection: AtomicU64,
	cache_hit: AtomicU64,
	cache_miss: AtomicU64,
	retry_attempts: AtomicU64,
	successful_retries: AtomicU64,
	failed_retries: AtomicU64,
}

/// Connection-loss fallback and retry policy sitting between the read strategy and the OPC UA
/// adapter.
pub struct ErrorHandler {
	adapter: Arc<dyn OpcAdapter>,
	cache: Arc<Cache>,
	max_retry_attempts: u32,
	retry_delay: Duration,
	error_rate_threshold: f64,
	counters: Counters,
	recent_errors: Mutex<VecDeque<Instant>>,
}
impl ErrorHandler {
	/// Build a handler from validated configuration.
	pub fn new(adapter: Arc<dyn OpcAdapter>, cache: Arc<Cache>, config: &Config) -> Self {
		Self {
			adapter,
			cache,
			max_retry_attempts: config.error_max_retry_attempts,
			retry_delay: config.error_retry_delay,
			error_rate_threshold: config.error_rate_threshold,
			counters: Counters {
				total: AtomicU64::new(0),
				connection: AtomicU64::new(0),
				cache_hit: AtomicU64::new(0),
				cache_miss: AtomicU64::new(0),
				retry_attempts: AtomicU64::new(0),
				successful_retries: AtomicU64::new(0),
				failed_retries: AtomicU64::new(0),
			},
			recent_errors: Mutex::new(VecDeque::with_capacity(MAX_RECENT_ERRORS)),
		}
	}

	/// Classify which action to take for a failed read of `node_id`.
	pub fn determine_action(&self, error: &OpcError, has_cached_data: bool) -> ErrorAction {
		if has_cached_data && (error.is_connection_class() || error.is_timeout_class()) {
			return ErrorAction::ReturnCached;
		}

		if error.is_recoverable() { ErrorAction::RetryConnection } else { ErrorAction::ReturnError }
	}

	/// Handle one failed read: fall back to the cache, retry, or produce an error result.
	/// Retries are only attempted when no cached value exists (retrying with a good fallback
	/// already in hand would only add latency for no benefit).
	pub async fn handle(&self, node_id: &NodeId, error: OpcError, now: Instant, now_ms: i64) -> ReadResult {
		let cached = self.cache.get(node_id, now).await;

		self.record_error(error.is_connection_class(), cached.is_some(), now).await;

		match self.determine_action(&error, cached.is_some()) {
			ErrorAction::ReturnCached => from_cached(cached.expect("has_cached_data implies Some"), now),
			ErrorAction::ReturnError => error_result(node_id, &error, now_ms),
			ErrorAction::RetryConnection => self.attempt_retry(node_id, error, now_ms).await,
		}
	}

	/// Apply fallback independently to every slot of a batch read, preserving order
	/// (`SPEC_FULL.md` §8, P6).
	pub async fn handle_partial_batch(
		&self,
		node_ids: &[NodeId],
		results: Vec<Result<crate::opc::NodeReading, OpcError>>,
		now: Instant,
		now_ms: i64,
	) -> Vec<ReadResult> {
		let mut out = Vec::with_capacity(node_ids.len());

		for (node_id, result) in node_ids.iter().zip(results) {
			match result {
				Ok(reading) => out.push(ReadResult::ok(reading.node_id, reading.value, reading.status, reading.reason, reading.source_timestamp_ms)),
				Err(error) => out.push(self.handle(node_id, error, now, now_ms).await),
			}
		}

		out
	}

	async fn attempt_retry(&self, node_id: &NodeId, first_error: OpcError, now_ms: i64) -> ReadResult {
		let mut last_error = first_error;

		for _attempt in 0..self.max_retry_attempts {
			self.counters.retry_attempts.fetch_add(1, Ordering::Relaxed);
			tokio::time::sleep(self.retry_delay).await;

			match self.adapter.read_node(node_id, Duration::from_millis(5_000)).await {
				Ok(reading) => {
					self.counters.successful_retries.fetch_add(1, Ordering::Relaxed);

					return ReadResult::ok(reading.node_id, reading.value, reading.status, reading.reason, reading.source_timestamp_ms);
				},
				Err(error) => last_error = error,
			}
		}

		self.counters.failed_retries.fetch_add(1, Ordering::Relaxed);

		error_result(node_id, &last_error, now_ms)
	}

	async fn record_error(&self, is_connection_error: bool, has_cache_fallback: bool, now: Instant) {
		self.counters.total.fetch_add(1, Ordering::Relaxed);

		if is_connection_error {
			self.counters.connection.fetch_add(1, Ordering::Relaxed);
		}
		if has_cache_fallback {
			self.counters.cache_hit.fetch_add(1, Ordering::Relaxed);
		} else {
			self.counters.cache_miss.fetch_add(1, Ordering::Relaxed);
		}

		#[cfg(feature = "metrics")]
		crate::metrics::record_error(is_connection_error);

		let mut recent = self.recent_errors.lock().await;

		recent.push_back(now);

		while recent.len() > MAX_RECENT_ERRORS {
			recent.pop_front();
		}
		while recent.front().is_some_and(|oldest| now.saturating_duration_since(*oldest) > ERROR_WINDOW) {
			recent.pop_front();
		}

		#[cfg(feature = "metrics")]
		crate::metrics::record_error_rate(recent.len() as f64);
	}

	/// Errors observed in the trailing window, extrapolated to an errors-per-minute rate.
	pub async fn error_rate(&self, now: Instant) -> f64 {
		let mut recent = self.recent_errors.lock().await;

		while recent.front().is_some_and(|oldest| now.saturating_duration_since(*oldest) > ERROR_WINDOW) {
			recent.pop_front();
		}

		recent.len() as f64
	}

	/// Whether the current error rate is at or above the configured alerting threshold.
	pub async fn is_error_rate_exceeded(&self, now: Instant) -> bool {
		self.error_rate(now).await >= self.error_rate_threshold
	}

	/// Snapshot counters for telemetry.
	pub async fn stats(&self, now: Instant) -> ErrorStats {
		ErrorStats {
			total_errors: self.counters.total.load(Ordering::Relaxed),
			connection_errors: self.counters.connection.load(Ordering::Relaxed),
			cache_hit_on_error: self.counters.cache_hit.load(Ordering::Relaxed),
			cache_miss_on_error: self.counters.cache_miss.load(Ordering::Relaxed),
			retry_attempts: self.counters.retry_attempts.load(Ordering::Relaxed),
			successful_retries: self.counters.successful_retries.load(Ordering::Relaxed),
			failed_retries: self.counters.failed_retries.load(Ordering::Relaxed),
			error_rate: self.error_rate(now).await,
		}
	}
}

/// `SPEC_FULL.md` §4.5: the cached-fallback `reason` discriminates live vs. stale success for
/// clients, carrying the entry's age in whole seconds.
fn from_cached(entry: CacheEntry, now: Instant) -> ReadResult {
	let age_secs = entry.age(now).as_secs();

	ReadResult::ok(
		entry.node_id().clone(),
		entry.value().to_string(),
		entry.status(),
		format!("Connection Error - Using Cached Data (age: {age_secs}s)"),
		entry.source_timestamp_ms(),
	)
}

fn error_result(node_id: &NodeId, error: &OpcError, now_ms: i64) -> ReadResult {
	ReadResult::error(node_id.clone(), error.to_string(), now_ms)
}
