//! Lock-free counters backing [`Cache::stats`](super::Cache::stats).

use std::sync::atomic::{AtomicU64, Ordering};

/// Point-in-time snapshot of [`CacheStats`].
#[derive(Clone, Copy, Debug, Default, serde::Serialize)]
pub struct CacheSnapshot {
	/// Number of entries currently held.
	pub entries: usize,
	/// Entries with `has_subscription == true`.
	pub subscribed_entries: usize,
	/// `Get*` calls that found an entry.
	pub hits: u64,
	/// `Get*` calls that found nothing.
	pub misses: u64,
	/// Classification lookups that returned FRESH.
	pub fresh: u64,
	/// Classification lookups that returned STALE.
	pub stale: u64,
	/// Classification lookups that returned EXPIRED (including missing entries).
	pub expired: u64,
	/// Entries removed by LRU or memory-pressure eviction.
	pub evicted: u64,
	/// Eviction passes that found every candidate entry subscribed and evicted nothing.
	pub pressure_unrelieved: u64,
	/// Estimated memory footprint in bytes.
	pub memory_usage_bytes: usize,
}
impl CacheSnapshot {
	/// `hits / (hits + misses)`, or `0.0` when there have been no lookups yet.
	pub fn hit_ratio(&self) -> f64 {
		let total = self.hits + self.misses;

		if total == 0 { 0.0 } else { self.hits as f64 / total as f64 }
	}
}

/// Atomic counters mirroring the reference implementation's `CacheStats`.
#[derive(Debug, Default)]
pub struct CacheStats {
	hits: AtomicU64,
	misses: AtomicU64,
	fresh: AtomicU64,
	stale: AtomicU64,
	expired: AtomicU64,
	evicted: AtomicU64,
	pressure_unrelieved: AtomicU64,
}
impl CacheStats {
	pub(super) fn record_hit(&self) {
		self.hits.fetch_add(1, Ordering::Relaxed);
	}

	pub(super) fn record_miss(&self) {
		self.misses.fetch_add(1, Ordering::Relaxed);
	}

	pub(super) fn record_freshness(&self, freshness: super::Freshness) {
		let counter = match freshness {
			super::Freshness::Fresh => &self.fresh,
			super::Freshness::Stale => &self.stale,
			super::Freshness::Expired => &self.expired,
		};

		counter.fetch_add(1, Ordering::Relaxed);
	}

	pub(super) fn record_evicted(&self, count: u64) {
		self.evicted.fetch_add(count, Ordering::Relaxed);
	}

	pub(super) fn record_pressure_unrelieved(&self) {
		self.pressure_unrelieved.fetch_add(1, Ordering::Relaxed);
	}

	pub(super) fn snapshot(&self, entries: usize, subscribed_entries: usize, memory_usage_bytes: usize) -> CacheSnapshot {
		CacheSnapshot {
			entries,
			subscribed_entries,
			hits: self.hits.load(Ordering::Relaxed),
			misses: self.misses.load(Ordering::Relaxed),
			fresh: self.fresh.load(Ordering::Relaxed),
			stale: self.stale.load(Ordering::Relaxed),
			expired: self.expired.load(Ordering::Relaxed),
			evicted: self.evicted.load(Ordering::Relaxed),
			pressure_unrelieved: self.pressure_unrelieved.load(Ordering::Relaxed),
			memory_usage_bytes,
		}
	}
}
