//! The concurrent node-id-to-entry map and its eviction/access-level policy.

use std::{collections::HashMap, sync::atomic::{AtomicU8, Ordering}, time::Duration};

use tokio::{sync::RwLock, time::Instant};

use crate::{
	cache::{
		entry::{CacheEntry, Freshness, Status},
		stats::{CacheSnapshot, CacheStats},
	},
	config::Config,
	error::{Error, Result},
	node_id::NodeId,
};

/// Minimum privilege required to perform a mutating cache operation.
///
/// Ordered so a numeric `>=` comparison (mirroring the reference implementation's
/// `checkAccessLevel`) expresses "at least as privileged as".
#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd, serde::Deserialize, serde::Serialize)]
#[repr(u8)]
pub enum AccessLevel {
	/// Reads only; every mutating operation is rejected.
	ReadOnly = 0,
	/// The default: normal cache traffic may read and write.
	ReadWrite = 1,
	/// Required for `clear()` and other administrative operations.
	Admin = 2,
}
impl AccessLevel {
	fn from_u8(raw: u8) -> Self {
		match raw {
			0 => Self::ReadOnly,
			1 => Self::ReadWrite,
			_ => Self::Admin,
		}
	}
}

/// The result of a classification lookup: the entry, if any, and its freshness class.
///
/// A missing entry classifies as [`Freshness::Expired`] (§3: "or entry missing").
#[derive(Clone, Debug)]
pub struct GetStatus {
	/// The cached entry, cloned out from under the lock.
	pub entry: Option<CacheEntry>,
	/// FRESH / STALE / EXPIRED.
	pub freshness: Freshness,
}

/// A successful read or notification to upsert into the cache.
///
/// Intentionally decoupled from the OPC UA adapter's own result type (`cache` has no
/// dependency on `opc`, keeping it the leaf of the composition order in `SPEC_FULL.md` §2);
/// callers (the read strategy, the subscription manager) convert into this shape.
#[derive(Clone, Debug)]
pub struct CacheUpdate {
	/// Node identifier being updated.
	pub node_id: NodeId,
	/// The new value.
	pub value: String,
	/// `Good` or `Bad`.
	pub status: Status,
	/// Human-readable status phrase.
	pub reason: String,
	/// Millisecond Unix timestamp from the data source.
	pub source_timestamp_ms: i64,
}

#[derive(Default)]
struct Inner {
	entries: HashMap<NodeId, CacheEntry>,
}

/// The freshness-aware cache.
///
/// One [`tokio::sync::RwLock`] guards the map; `Get*` acquire it shared, every mutating
/// operation acquires it exclusive — matching the single-RW-lock, no-nested-acquisition
/// policy in `SPEC_FULL.md` §5.
#[derive(Debug)]
pub struct Cache {
	inner: RwLock<Inner>,
	stats: CacheStats,
	max_entries: usize,
	max_memory_bytes: usize,
	low_water_ratio: f64,
	access_level: AtomicU8,
}
impl Cache {
	/// Build an empty cache from validated configuration.
	pub fn new(config: &Config) -> Self {
		Self {
			inner: RwLock::new(Inner::default()),
			stats: CacheStats::default(),
			max_entries: config.cache_max_entries,
			max_memory_bytes: config.cache_max_memory_bytes,
			low_water_ratio: config.cache_low_water_ratio,
			access_level: AtomicU8::new(config.cache_access_level as u8),
		}
	}

	/// Current minimum access level required for mutating operations.
	pub fn access_level(&self) -> AccessLevel {
		AccessLevel::from_u8(self.access_level.load(Ordering::Relaxed))
	}

	/// Change the minimum access level required for mutating operations.
	pub fn set_access_level(&self, level: AccessLevel) {
		self.access_level.store(level as u8, Ordering::Relaxed);
	}

	fn require(&self, operation: &'static str, required: AccessLevel) -> Result<()> {
		let actual = self.access_level();

		if actual >= required {
			Ok(())
		} else {
			tracing::warn!(operation, ?required, ?actual, "cache operation rejected by access level");

			Err(Error::AccessDenied { operation, required, actual })
		}
	}

	/// Blind lookup; bumps `last_accessed` and the hit/miss counters.
	pub async fn get(&self, node_id: &NodeId, now: Instant) -> Option<CacheEntry> {
		let guard = self.inner.read().await;

		match guard.entries.get(node_id) {
			Some(entry) => {
				entry.bump_last_accessed(now);
				self.stats.record_hit();

				Some(entry.clone())
			},
			None => {
				self.stats.record_miss();

				None
			},
		}
	}

	/// Classification lookup: entry plus FRESH/STALE/EXPIRED, the read strategy's primary
	/// entry point.
	pub async fn get_with_status(
		&self,
		node_id: &NodeId,
		refresh_threshold: Duration,
		expire: Duration,
		now: Instant,
	) -> GetStatus {
		let guard = self.inner.read().await;

		classify_one(&guard, &self.stats, node_id, refresh_threshold, expire, now)
	}

	/// Batch classification lookup; acquires one shared lock for the whole slice.
	pub async fn get_many_with_status(
		&self,
		node_ids: &[NodeId],
		refresh_threshold: Duration,
		expire: Duration,
		now: Instant,
	) -> Vec<GetStatus> {
		let guard = self.inner.read().await;

		node_ids
			.iter()
			.map(|node_id| classify_one(&guard, &self.stats, node_id, refresh_threshold, expire, now))
			.collect()
	}

	/// Single-entry upsert. Preserves `created_at` on refresh of an existing key (see
	/// `DESIGN.md`, open question 1).
	pub async fn update(&self, update: CacheUpdate, now: Instant) -> Result<()> {
		self.require("update", AccessLevel::ReadWrite)?;

		let mut guard = self.inner.write().await;

		apply_update(&mut guard, update, now);
		self.enforce_limits(&mut guard);

		Ok(())
	}

	/// Atomic batch upsert: every result lands under one write-lock acquisition, so no
	/// reader observes a half-applied batch (P7).
	pub async fn update_batch(&self, updates: impl IntoIterator<Item = CacheUpdate>, now: Instant) -> Result<()> {
		self.require("update_batch", AccessLevel::ReadWrite)?;

		let mut guard = self.inner.write().await;

		for update in updates {
			apply_update(&mut guard, update, now);
		}
		self.enforce_limits(&mut guard);

		Ok(())
	}

	/// Remove one entry, returning whether it existed.
	pub async fn remove(&self, node_id: &NodeId) -> Result<bool> {
		self.require("remove", AccessLevel::ReadWrite)?;

		let mut guard = self.inner.write().await;

		Ok(guard.entries.remove(node_id).is_some())
	}

	/// Mark (or unmark) a node as having a monitored item. No-op if the entry is absent.
	pub async fn set_subscription_flag(&self, node_id: &NodeId, has_subscription: bool) -> bool {
		let guard = self.inner.read().await;

		match guard.entries.get(node_id) {
			Some(entry) => {
				entry.set_has_subscription(has_subscription);

				true
			},
			None => false,
		}
	}

	/// Remove every unsubscribed entry whose classification is EXPIRED.
	pub async fn cleanup_expired(&self, refresh_threshold: Duration, expire: Duration, now: Instant) -> usize {
		let mut guard = self.inner.write().await;
		let doomed: Vec<NodeId> = guard
			.entries
			.values()
			.filter(|entry| {
				!entry.has_subscription() && entry.classify(refresh_threshold, expire, now) == Freshness::Expired
			})
			.map(|entry| entry.node_id().clone())
			.collect();
		let removed = doomed.len();

		for node_id in doomed {
			guard.entries.remove(&node_id);
		}
		self.stats.record_evicted(removed as u64);

		removed
	}

	/// Remove every unsubscribed entry that has not been read within `max_idle`.
	pub async fn cleanup_unused(&self, max_idle: Duration, now: Instant) -> usize {
		let mut guard = self.inner.write().await;
		let doomed: Vec<NodeId> = guard
			.entries
			.values()
			.filter(|entry| !entry.has_subscription() && now.saturating_duration_since(entry.last_accessed()) >= max_idle)
			.map(|entry| entry.node_id().clone())
			.collect();
		let removed = doomed.len();

		for node_id in doomed {
			guard.entries.remove(&node_id);
		}
		self.stats.record_evicted(removed as u64);

		removed
	}

	/// Evict up to `count` unsubscribed entries, oldest `last_accessed` first.
	/// `EvictLRU(0)` is a no-op (P8 boundary behavior).
	pub async fn evict_lru(&self, count: usize) -> usize {
		let mut guard = self.inner.write().await;

		evict_oldest_unsubscribed(&mut guard, count, &self.stats)
	}

	/// If over `max_entries` or `max_memory_bytes`, evict unsubscribed entries oldest-first
	/// down to the low-water mark of whichever bound triggered. If every entry is subscribed
	/// and pressure persists, eviction yields zero and the event is reported to metrics, not
	/// raised as an error (resolved open question 3, see `DESIGN.md`).
	fn enforce_limits(&self, guard: &mut Inner) {
		let mut pressure_unrelieved = false;

		if guard.entries.len() > self.max_entries {
			let target = ((self.max_entries as f64) * self.low_water_ratio).floor() as usize;
			let to_remove = guard.entries.len().saturating_sub(target);
			let removed = evict_oldest_unsubscribed(guard, to_remove, &self.stats);

			pressure_unrelieved |= removed == 0;
		}

		let memory: usize = guard.entries.values().map(CacheEntry::estimated_size_bytes).sum();

		if memory > self.max_memory_bytes {
			let target_bytes = ((self.max_memory_bytes as f64) * self.low_water_ratio).floor() as usize;

			pressure_unrelieved |= evict_oldest_unsubscribed_until_memory(guard, target_bytes, &self.stats);
		}

		if pressure_unrelieved {
			self.stats.record_pressure_unrelieved();
			#[cfg(feature = "metrics")]
			crate::metrics::record_cache_pressure_unrelieved();
		}
	}

	/// Clear the whole cache. Requires [`AccessLevel::Admin`].
	pub async fn clear(&self) -> Result<()> {
		self.require("clear", AccessLevel::Admin)?;

		let mut guard = self.inner.write().await;

		guard.entries.clear();

		Ok(())
	}

	/// Current entry count.
	pub async fn len(&self) -> usize {
		self.inner.read().await.entries.len()
	}

	/// Whether the cache holds no entries.
	pub async fn is_empty(&self) -> bool {
		self.len().await == 0
	}

	/// Whether the cache is at or beyond `max_entries`.
	pub async fn is_full(&self) -> bool {
		self.len().await >= self.max_entries
	}

	/// Snapshot counters, entry counts, and an estimated memory footprint.
	pub async fn stats(&self) -> CacheSnapshot {
		let guard = self.inner.read().await;
		let subscribed = guard.entries.values().filter(|entry| entry.has_subscription()).count();
		let memory: usize = guard.entries.values().map(CacheEntry::estimated_size_bytes).sum();

		self.stats.snapshot(guard.entries.len(), subscribed, memory)
	}

	/// All node ids currently cached, in arbitrary order.
	pub async fn node_ids(&self) -> Vec<NodeId> {
		self.inner.read().await.entries.keys().cloned().collect()
	}

	/// Node ids of entries with `has_subscription == true`.
	pub async fn subscribed_node_ids(&self) -> Vec<NodeId> {
		self.inner
			.read()
			.await
			.entries
			.values()
			.filter(|entry| entry.has_subscription())
			.map(|entry| entry.node_id().clone())
			.collect()
	}
}

fn classify_one(
	guard: &Inner,
	stats: &CacheStats,
	node_id: &NodeId,
	refresh_threshold: Duration,
	expire: Duration,
	now: Instant,
) -> GetStatus {
	match guard.entries.get(node_id) {
		Some(entry) => {
			entry.bump_last_accessed(now);

			let freshness = entry.classify(refresh_threshold, expire, now);

			stats.record_hit();
			stats.record_freshness(freshness);
			#[cfg(feature = "metrics")]
			crate::metrics::record_cache_lookup(true, freshness);

			GetStatus { entry: Some(entry.clone()), freshness }
		},
		None => {
			stats.record_miss();
			stats.record_freshness(Freshness::Expired);
			#[cfg(feature = "metrics")]
			crate::metrics::record_cache_lookup(false, Freshness::Expired);

			GetStatus { entry: None, freshness: Freshness::Expired }
		},
	}
}

fn apply_update(guard: &mut Inner, update: CacheUpdate, now: Instant) {
	match guard.entries.get_mut(&update.node_id) {
		Some(entry) => entry.refresh(update.value, update.status, update.reason, update.source_timestamp_ms, now),
		None => {
			let entry =
				CacheEntry::new(update.node_id.clone(), update.value, update.status, update.reason, update.source_timestamp_ms, now);

			guard.entries.insert(update.node_id, entry);
		},
	}
}

/// Shared by `evict_lru` and pressure-triggered eviction. Subscribed entries are never
/// candidates (P3).
fn evict_oldest_unsubscribed(guard: &mut Inner, count: usize, stats: &CacheStats) -> usize {
	if count == 0 {
		return 0;
	}

	let mut candidates: Vec<(NodeId, Instant)> = guard
		.entries
		.values()
		.filter(|entry| !entry.has_subscription())
		.map(|entry| (entry.node_id().clone(), entry.last_accessed()))
		.collect();

	candidates.sort_by_key(|(_, last_accessed)| *last_accessed);

	let removed = candidates.into_iter().take(count).map(|(node_id, _)| node_id).fold(0usize, |acc, node_id| {
		if guard.entries.remove(&node_id).is_some() { acc + 1 } else { acc }
	});

	stats.record_evicted(removed as u64);
	#[cfg(feature = "metrics")]
	if removed > 0 {
		crate::metrics::record_cache_evicted(removed as u64);
	}

	removed
}

/// Evict unsubscribed entries oldest-first until the estimated footprint is at or below
/// `target_bytes`. Returns whether pressure persisted (candidates ran out before reaching the
/// target).
fn evict_oldest_unsubscribed_until_memory(guard: &mut Inner, target_bytes: usize, stats: &CacheStats) -> bool {
	let mut candidates: Vec<(NodeId, Instant)> = guard
		.entries
		.values()
		.filter(|entry| !entry.has_subscription())
		.map(|entry| (entry.node_id().clone(), entry.last_accessed()))
		.collect();

	candidates.sort_by_key(|(_, last_accessed)| *last_accessed);

	let mut memory: usize = guard.entries.values().map(CacheEntry::estimated_size_bytes).sum();
	let mut removed = 0u64;

	for (node_id, _) in candidates {
		if memory <= target_bytes {
			break;
		}

		if let Some(entry) = guard.entries.remove(&node_id) {
			memory = memory.saturating_sub(entry.estimated_size_bytes());
			removed += 1;
		}
	}

	stats.record_evicted(removed);
	#[cfg(feature = "metrics")]
	if removed > 0 {
		crate::metrics::record_cache_evicted(removed);
	}

	memory > target_bytes
}

#[cfg(test)]
mod tests {
	use super::*;

	fn config() -> Config {
		Config::builder().cache_max_entries(3).cache_low_water_ratio(0.5).build().unwrap()
	}

	fn node(id: &str) -> NodeId {
		NodeId::parse(id).unwrap()
	}

	fn update(id: &str, value: &str) -> CacheUpdate {
		CacheUpdate {
			node_id: node(id),
			value: value.into(),
			status: Status::Good,
			reason: "Good".into(),
			source_timestamp_ms: 0,
		}
	}

	#[tokio::test]
	async fn update_then_get_round_trips_the_value() {
		let cache = Cache::new(&Config::builder().build().unwrap());
		let now = Instant::now();

		cache.update(update("ns=2;s=A", "42"), now).await.unwrap();

		let entry = cache.get(&node("ns=2;s=A"), now).await.unwrap();

		assert_eq!(entry.value(), "42");
	}

	#[tokio::test]
	async fn refresh_preserves_created_at_through_the_map() {
		let cache = Cache::new(&Config::builder().build().unwrap());
		let created = Instant::now();

		cache.update(update("ns=2;s=A", "42"), created).await.unwrap();
		cache.update(update("ns=2;s=A", "43"), created + Duration::from_secs(5)).await.unwrap();

		let entry = cache.get(&node("ns=2;s=A"), created + Duration::from_secs(5)).await.unwrap();

		assert_eq!(entry.value(), "43");
		assert_eq!(entry.created_at(), created);
	}

	#[tokio::test]
	async fn eviction_never_removes_subscribed_entries() {
		let cache = Cache::new(&config());
		let now = Instant::now();

		for (i, label) in ["A", "B", "C", "D"].iter().enumerate() {
			let n = format!("ns=2;s={label}");

			cache.update(update(&n, "v"), now + Duration::from_millis(i as u64)).await.unwrap();
		}
		cache.set_subscription_flag(&node("ns=2;s=A"), true).await;

		// Pushing past max_entries (3) during the last update triggers enforce_limits.
		cache.update(update("ns=2;s=E", "v"), now + Duration::from_millis(10)).await.unwrap();

		let remaining = cache.node_ids().await;

		assert!(remaining.contains(&node("ns=2;s=A")));
	}

	#[tokio::test]
	async fn evict_lru_zero_is_a_no_op() {
		let cache = Cache::new(&Config::builder().build().unwrap());
		let now = Instant::now();

		cache.update(update("ns=2;s=A", "42"), now).await.unwrap();

		assert_eq!(cache.evict_lru(0).await, 0);
		assert_eq!(cache.len().await, 1);
	}

	#[tokio::test]
	async fn writes_below_access_level_are_rejected() {
		let cache = Cache::new(&Config::builder().build().unwrap());

		cache.set_access_level(AccessLevel::ReadOnly);

		let err = cache.update(update("ns=2;s=A", "42"), Instant::now()).await.unwrap_err();

		assert!(matches!(err, Error::AccessDenied { .. }));
	}

	#[tokio::test]
	async fn classification_matches_entry_classify() {
		let cache = Cache::new(&Config::builder().build().unwrap());
		let created = Instant::now();

		cache.update(update("ns=2;s=A", "42"), created).await.unwrap();

		let refresh = Duration::from_secs(3);
		let expire = Duration::from_secs(10);
		let status = cache.get_with_status(&node("ns=2;s=A"), refresh, expire, created + Duration::from_secs(5)).await;

		assert_eq!(status.freshness, Freshness::Stale);
		assert_eq!(status.entry.unwrap().value(), "42");
	}

	#[tokio::test]
	async fn missing_entry_classifies_as_expired() {
		let cache = Cache::new(&Config::builder().build().unwrap());
		let status =
			cache.get_with_status(&node("ns=2;s=A"), Duration::from_secs(3), Duration::from_secs(10), Instant::now()).await;

		assert_eq!(status.freshness, Freshness::Expired);
		assert!(status.entry.is_none());
	}
}
