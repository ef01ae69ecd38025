//! Metrics recording, feature-gated behind `metrics`/`prometheus` exactly as the rest of the
//! ambient stack is (`SPEC_FULL.md` §1 — a Non-goal on the feature surface never excludes
//! observability of the mechanics that remain).

use std::sync::OnceLock;

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

use crate::{
	cache::Freshness,
	error::{Error, Result},
};

const METRIC_CACHE_REQUESTS_TOTAL: &str = "opcua_bridge_cache_requests_total";
const METRIC_CACHE_HITS_TOTAL: &str = "opcua_bridge_cache_hits_total";
const METRIC_CACHE_MISSES_TOTAL: &str = "opcua_bridge_cache_misses_total";
const METRIC_CACHE_FRESH_TOTAL: &str = "opcua_bridge_cache_fresh_total";
const METRIC_CACHE_STALE_TOTAL: &str = "opcua_bridge_cache_stale_total";
const METRIC_CACHE_EXPIRED_TOTAL: &str = "opcua_bridge_cache_expired_total";
const METRIC_CACHE_EVICTED_TOTAL: &str = "opcua_bridge_cache_evicted_total";
const METRIC_CACHE_PRESSURE_UNRELIEVED_TOTAL: &str = "opcua_bridge_cache_pressure_unrelieved_total";
const METRIC_BACKGROUND_SCHEDULED_TOTAL: &str = "opcua_bridge_background_scheduled_total";
const METRIC_BACKGROUND_DUPLICATE_TOTAL: &str = "opcua_bridge_background_duplicate_total";
const METRIC_BACKGROUND_DROPPED_TOTAL: &str = "opcua_bridge_background_dropped_total";
const METRIC_BACKGROUND_RESULT_TOTAL: &str = "opcua_bridge_background_result_total";
const METRIC_ERRORS_TOTAL: &str = "opcua_bridge_errors_total";
const METRIC_ERROR_RATE: &str = "opcua_bridge_error_rate_per_minute";
const METRIC_RECONNECTION_ATTEMPTS_TOTAL: &str = "opcua_bridge_reconnection_attempts_total";
const METRIC_RECONNECTION_DOWNTIME_SECONDS: &str = "opcua_bridge_reconnection_downtime_seconds";

/// Shared Prometheus handle installed by [`install_default_exporter`].
static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install the default Prometheus recorder backed by `metrics`.
///
/// Multiple invocations are safe; subsequent calls become no-ops once the recorder is
/// installed.
pub fn install_default_exporter() -> Result<()> {
	if PROMETHEUS_HANDLE.get().is_some() {
		return Ok(());
	}

	let handle = PrometheusBuilder::new().install_recorder().map_err(|err| Error::Metrics(err.to_string()))?;
	let _ = PROMETHEUS_HANDLE.set(handle);

	Ok(())
}

/// Access the global Prometheus exporter handle when installed.
pub fn prometheus_handle() -> Option<&'static PrometheusHandle> {
	PROMETHEUS_HANDLE.get()
}

/// Record a classification lookup: one request, a hit-or-miss, and a freshness class.
pub fn record_cache_lookup(hit: bool, freshness: Freshness) {
	metrics::counter!(METRIC_CACHE_REQUESTS_TOTAL).increment(1);

	if hit {
		metrics::counter!(METRIC_CACHE_HITS_TOTAL).increment(1);
	} else {
		metrics::counter!(METRIC_CACHE_MISSES_TOTAL).increment(1);
	}

	let freshness_metric = match freshness {
		Freshness::Fresh => METRIC_CACHE_FRESH_TOTAL,
		Freshness::Stale => METRIC_CACHE_STALE_TOTAL,
		Freshness::Expired => METRIC_CACHE_EXPIRED_TOTAL,
	};

	metrics::counter!(freshness_metric).increment(1);
}

/// Record entries removed by LRU or memory-pressure eviction.
pub fn record_cache_evicted(count: u64) {
	metrics::counter!(METRIC_CACHE_EVICTED_TOTAL).increment(count);
}

/// Record an eviction pass that found every candidate subscribed and evicted nothing.
pub fn record_cache_pressure_unrelieved() {
	metrics::counter!(METRIC_CACHE_PRESSURE_UNRELIEVED_TOTAL).increment(1);
}

/// Record the outcome of a `BackgroundUpdater::schedule` call.
pub fn record_background_scheduled(duplicate: bool, dropped: bool) {
	metrics::counter!(METRIC_BACKGROUND_SCHEDULED_TOTAL).increment(1);

	if duplicate {
		metrics::counter!(METRIC_BACKGROUND_DUPLICATE_TOTAL).increment(1);
	}
	if dropped {
		metrics::counter!(METRIC_BACKGROUND_DROPPED_TOTAL).increment(1);
	}
}

/// Record the outcome of a completed background refresh.
pub fn record_background_result(success: bool) {
	metrics::counter!(METRIC_BACKGROUND_RESULT_TOTAL, "outcome" => if success { "success" } else { "failure" }).increment(1);
}

/// Record a failed read, classified by whether it was connection-class.
pub fn record_error(connection_class: bool) {
	metrics::counter!(METRIC_ERRORS_TOTAL, "class" => if connection_class { "connection" } else { "other" }).increment(1);
}

/// Record the current error rate (errors per minute over the trailing window).
pub fn record_error_rate(rate: f64) {
	metrics::gauge!(METRIC_ERROR_RATE).set(rate);
}

/// Record a reconnection attempt and whether it succeeded.
pub fn record_reconnection_attempt(success: bool) {
	metrics::counter!(METRIC_RECONNECTION_ATTEMPTS_TOTAL, "outcome" => if success { "success" } else { "failure" }).increment(1);
}

/// Record the downtime observed for one successful reconnection.
pub fn record_reconnection_downtime(seconds: f64) {
	metrics::histogram!(METRIC_RECONNECTION_DOWNTIME_SECONDS).record(seconds);
}

#[cfg(test)]
mod tests {
	use std::borrow::Borrow;

	use metrics_util::{CompositeKey, MetricKind, debugging::{DebugValue, DebuggingRecorder}};

	use super::*;

	fn capture_metrics<F>(f: F) -> Vec<(CompositeKey, DebugValue)>
	where
		F: FnOnce(),
	{
		let recorder = DebuggingRecorder::new();
		let snapshotter = recorder.snapshotter();

		metrics::with_local_recorder(&recorder, f);

		snapshotter.snapshot().into_vec().into_iter().map(|(key, _, _, value)| (key, value)).collect()
	}

	fn counter_value(snapshot: &[(CompositeKey, DebugValue)], name: &str) -> u64 {
		snapshot
			.iter()
			.find_map(|(key, value)| {
				(key.kind() == MetricKind::Counter && Borrow::<str>::borrow(key.key().name()) == name)
					.then(|| match value {
						DebugValue::Counter(value) => *value,
						_ => 0,
					})
			})
			.unwrap_or(0)
	}

	#[test]
	fn records_hit_and_freshness_together() {
		let snapshot = capture_metrics(|| {
			record_cache_lookup(true, Freshness::Fresh);
			record_cache_lookup(false, Freshness::Expired);
		});

		assert_eq!(counter_value(&snapshot, METRIC_CACHE_REQUESTS_TOTAL), 2);
		assert_eq!(counter_value(&snapshot, METRIC_CACHE_HITS_TOTAL), 1);
		assert_eq!(counter_value(&snapshot, METRIC_CACHE_MISSES_TOTAL), 1);
		assert_eq!(counter_value(&snapshot, METRIC_CACHE_FRESH_TOTAL), 1);
		assert_eq!(counter_value(&snapshot, METRIC_CACHE_EXPIRED_TOTAL), 1);
	}

	#[test]
	fn records_background_duplicates_and_drops() {
		let snapshot = capture_metrics(|| {
			record_background_scheduled(false, false);
			record_background_scheduled(true, false);
			record_background_scheduled(false, true);
		});

		assert_eq!(counter_value(&snapshot, METRIC_BACKGROUND_SCHEDULED_TOTAL), 3);
		assert_eq!(counter_value(&snapshot, METRIC_BACKGROUND_DUPLICATE_TOTAL), 1);
		assert_eq!(counter_value(&snapshot, METRIC_BACKGROUND_DROPPED_TOTAL), 1);
	}
}
