//! The canonical per-node cache record and its freshness classification.

use std::{
	sync::{
		OnceLock,
		atomic::{AtomicBool, AtomicU64, Ordering},
	},
	time::Duration,
};

use tokio::time::Instant;

use crate::node_id::NodeId;

/// `"Good"` or `"Bad"`, driving the `success` field of a response.
#[derive(Clone, Copy, Debug, Eq, PartialEq, serde::Serialize)]
pub enum Status {
	/// The value reflects a successful read or notification.
	Good,
	/// The node exists but the last read/notification reported a bad status.
	Bad,
}
impl Status {
	/// The wire string used in responses and log lines.
	pub fn as_str(self) -> &'static str {
		match self {
			Self::Good => "Good",
			Self::Bad => "Bad",
		}
	}
}
impl std::fmt::Display for Status {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.write_str(self.as_str())
	}
}

/// FRESH / STALE / EXPIRED, the three age classes the read strategy dispatches on.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Freshness {
	/// `age < refresh_threshold`; serve directly, no background work.
	Fresh,
	/// `refresh_threshold <= age < expire`; serve directly, enqueue a background refresh.
	Stale,
	/// `age >= expire`, or the entry does not exist.
	Expired,
}

/// One node's cached value and bookkeeping.
///
/// `last_accessed` is an atomic so [`Cache::get`](super::Cache::get) can bump it while holding
/// only the cache map's shared lock; every other field changes only through the exclusive-lock
/// update path, so a shared-lock read never races a field write.
#[derive(Debug)]
pub struct CacheEntry {
	node_id: NodeId,
	value: String,
	status: Status,
	reason: String,
	source_timestamp_ms: i64,
	created_at: Instant,
	last_accessed: AtomicU64,
	has_subscription: AtomicBool,
}
impl CacheEntry {
	/// Build a fresh entry, stamping `created_at` and `last_accessed` at `now`.
	pub fn new(
		node_id: NodeId,
		value: impl Into<String>,
		status: Status,
		reason: impl Into<String>,
		source_timestamp_ms: i64,
		now: Instant,
	) -> Self {
		Self {
			node_id,
			value: value.into(),
			status,
			reason: reason.into(),
			source_timestamp_ms,
			created_at: now,
			last_accessed: AtomicU64::new(micros_since_origin(now)),
			has_subscription: AtomicBool::new(false),
		}
	}

	/// Replace the live fields of this entry in place, preserving `created_at` (resolved open
	/// question, see `DESIGN.md`) and `has_subscription`.
	pub fn refresh(
		&mut self,
		value: impl Into<String>,
		status: Status,
		reason: impl Into<String>,
		source_timestamp_ms: i64,
		now: Instant,
	) {
		self.value = value.into();
		self.status = status;
		self.reason = reason.into();
		self.source_timestamp_ms = source_timestamp_ms;
		self.last_accessed.store(micros_since_origin(now), Ordering::Relaxed);
	}

	/// Node identifier this entry caches.
	pub fn node_id(&self) -> &NodeId {
		&self.node_id
	}

	/// Last observed value.
	pub fn value(&self) -> &str {
		&self.value
	}

	/// `Good` or `Bad`.
	pub fn status(&self) -> Status {
		self.status
	}

	/// Human-readable status phrase.
	pub fn reason(&self) -> &str {
		&self.reason
	}

	/// Millisecond Unix timestamp from the data source.
	pub fn source_timestamp_ms(&self) -> i64 {
		self.source_timestamp_ms
	}

	/// When this entry first entered the cache.
	pub fn created_at(&self) -> Instant {
		self.created_at
	}

	/// Age relative to `now`, saturating at zero.
	pub fn age(&self, now: Instant) -> Duration {
		now.saturating_duration_since(self.created_at)
	}

	/// Most recent read hit, as of the last [`bump_last_accessed`](Self::bump_last_accessed) or
	/// construction.
	pub fn last_accessed(&self) -> Instant {
		micros_to_instant(self.last_accessed.load(Ordering::Relaxed))
	}

	/// Record a read hit. Callable under a shared lock.
	pub fn bump_last_accessed(&self, now: Instant) {
		self.last_accessed.store(micros_since_origin(now), Ordering::Relaxed);
	}

	/// Whether a monitored item exists for this node.
	pub fn has_subscription(&self) -> bool {
		self.has_subscription.load(Ordering::Relaxed)
	}

	/// Set the subscription-presence flag (invariant I1, see `SPEC_FULL.md` §3).
	pub fn set_has_subscription(&self, value: bool) {
		self.has_subscription.store(value, Ordering::Relaxed);
	}

	/// Classify this entry's freshness given the configured thresholds.
	pub fn classify(&self, refresh_threshold: Duration, expire: Duration, now: Instant) -> Freshness {
		let age = self.age(now);

		if age < refresh_threshold {
			Freshness::Fresh
		} else if age < expire {
			Freshness::Stale
		} else {
			Freshness::Expired
		}
	}

	/// Rough heap footprint, used by memory-pressure eviction accounting.
	pub fn estimated_size_bytes(&self) -> usize {
		std::mem::size_of::<Self>() + self.value.len() + self.reason.len() + self.node_id.as_str().len()
	}
}
impl Clone for CacheEntry {
	fn clone(&self) -> Self {
		Self {
			node_id: self.node_id.clone(),
			value: self.value.clone(),
			status: self.status,
			reason: self.reason.clone(),
			source_timestamp_ms: self.source_timestamp_ms,
			created_at: self.created_at,
			last_accessed: AtomicU64::new(self.last_accessed.load(Ordering::Relaxed)),
			has_subscription: AtomicBool::new(self.has_subscription.load(Ordering::Relaxed)),
		}
	}
}

fn origin() -> Instant {
	static ORIGIN: OnceLock<Instant> = OnceLock::new();

	*ORIGIN.get_or_init(Instant::now)
}

fn micros_since_origin(instant: Instant) -> u64 {
	instant.saturating_duration_since(origin()).as_micros() as u64
}

fn micros_to_instant(micros: u64) -> Instant {
	origin() + Duration::from_micros(micros)
}

#[cfg(test)]
mod tests {
	use super::*;

	fn entry_at(now: Instant) -> CacheEntry {
		CacheEntry::new(NodeId::parse("ns=2;s=A").unwrap(), "42", Status::Good, "Good", 0, now)
	}

	#[test]
	fn classification_is_monotone_in_age() {
		let refresh = Duration::from_secs(3);
		let expire = Duration::from_secs(10);
		let created = Instant::now();
		let entry = entry_at(created);

		assert_eq!(entry.classify(refresh, expire, created), Freshness::Fresh);
		assert_eq!(entry.classify(refresh, expire, created + Duration::from_secs(5)), Freshness::Stale);
		assert_eq!(entry.classify(refresh, expire, created + Duration::from_secs(10)), Freshness::Expired);
		assert_eq!(entry.classify(refresh, expire, created + Duration::from_secs(999)), Freshness::Expired);
	}

	#[test]
	fn refresh_preserves_created_at() {
		let created = Instant::now();
		let mut entry = entry_at(created);
		let later = created + Duration::from_secs(30);

		entry.refresh("43", Status::Good, "Good", 1, later);

		assert_eq!(entry.created_at(), created);
		assert_eq!(entry.value(), "43");
		assert_eq!(entry.last_accessed(), later);
	}

	#[test]
	fn bump_last_accessed_does_not_touch_created_at() {
		let created = Instant::now();
		let entry = entry_at(created);
		let later = created + Duration::from_secs(1);

		entry.bump_last_accessed(later);

		assert_eq!(entry.created_at(), created);
		assert_eq!(entry.last_accessed(), later);
	}
}
