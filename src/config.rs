//! Typed, validated configuration surface.
//!
//! The core accepts this struct fully built; *sourcing* the values (environment variables,
//! a file, a CLI) is the embedder's job. Construction through [`ConfigBuilder::build`] is the
//! only way to obtain a [`Config`], so a rejected configuration can never reach the rest of the
//! crate.

use std::time::Duration;

use crate::{
	cache::AccessLevel,
	error::{Error, Result},
};

/// Validated runtime configuration for the bridge.
#[derive(Clone, Debug)]
pub struct Config {
	/// FRESH cutoff: entries younger than this are served without a background refresh.
	pub cache_refresh_threshold: Duration,
	/// STALE cutoff: entries at or beyond this age are read synchronously from upstream.
	pub cache_expire: Duration,
	/// Period of the periodic expiry sweep.
	pub cache_cleanup_interval: Duration,
	/// Maximum number of entries before LRU eviction kicks in.
	pub cache_max_entries: usize,
	/// Approximate memory cap, in bytes, before pressure eviction kicks in.
	pub cache_max_memory_bytes: usize,
	/// Cap on simultaneous expired-path reads in the read strategy.
	pub cache_concurrent_reads: usize,
	/// Target fill ratio eviction aims to restore usage to, e.g. `0.7`.
	pub cache_low_water_ratio: f64,
	/// Minimum access level required to perform a mutating cache operation.
	pub cache_access_level: AccessLevel,
	/// Background updater worker count.
	pub background_update_threads: usize,
	/// Background updater bounded-queue capacity.
	pub background_update_queue_size: usize,
	/// Per-refresh upstream timeout in the background updater.
	pub background_update_timeout: Duration,
	/// Synchronous-path upstream read timeout.
	pub opc_read_timeout: Duration,
	/// Chunk size used when batching `ReadNodes` calls.
	pub opc_batch_size: usize,
	/// Reconnection attempts before the backoff counter resets and the manager long-sleeps.
	pub connection_retry_max: u32,
	/// First reconnection backoff delay.
	pub connection_initial_delay: Duration,
	/// Reconnection backoff ceiling.
	pub connection_max_delay: Duration,
	/// Idle window after which an unused monitored item becomes eligible for cleanup.
	pub subscription_item_expire: Duration,
	/// Error handler retry budget for a failed synchronous read.
	pub error_max_retry_attempts: u32,
	/// Error handler inter-retry delay (attempt 1 has no preceding delay).
	pub error_retry_delay: Duration,
	/// Errors-per-minute threshold above which a monitoring flag is raised.
	pub error_rate_threshold: f64,
}
impl Config {
	/// Start building a configuration from the documented defaults.
	pub fn builder() -> ConfigBuilder {
		ConfigBuilder::default()
	}
}

/// Builder for [`Config`]; every field defaults to the value in the external-interfaces table.
#[derive(Clone, Debug)]
pub struct ConfigBuilder {
	cache_refresh_threshold: Duration,
	cache_expire: Duration,
	cache_cleanup_interval: Duration,
	cache_max_entries: usize,
	cache_max_memory_bytes: usize,
	cache_concurrent_reads: usize,
	cache_low_water_ratio: f64,
	cache_access_level: AccessLevel,
	background_update_threads: usize,
	background_update_queue_size: usize,
	background_update_timeout: Duration,
	opc_read_timeout: Duration,
	opc_batch_size: usize,
	connection_retry_max: u32,
	connection_initial_delay: Duration,
	connection_max_delay: Duration,
	subscription_item_expire: Duration,
	error_max_retry_attempts: u32,
	error_retry_delay: Duration,
	error_rate_threshold: f64,
}
impl Default for ConfigBuilder {
	fn default() -> Self {
		Self {
			cache_refresh_threshold: Duration::from_secs(3),
			cache_expire: Duration::from_secs(10),
			cache_cleanup_interval: Duration::from_secs(60),
			cache_max_entries: 10_000,
			cache_max_memory_bytes: 100 * 1024 * 1024,
			cache_concurrent_reads: 10,
			cache_low_water_ratio: 0.7,
			cache_access_level: AccessLevel::ReadWrite,
			background_update_threads: 3,
			background_update_queue_size: 1_000,
			background_update_timeout: Duration::from_millis(5_000),
			opc_read_timeout: Duration::from_millis(5_000),
			opc_batch_size: 50,
			connection_retry_max: 5,
			connection_initial_delay: Duration::from_millis(500),
			connection_max_delay: Duration::from_millis(2_000),
			subscription_item_expire: Duration::from_secs(30 * 60),
			error_max_retry_attempts: 3,
			error_retry_delay: Duration::from_millis(1_000),
			error_rate_threshold: 10.0,
		}
	}
}
impl ConfigBuilder {
	/// Override `cache_refresh_threshold_seconds`.
	pub fn cache_refresh_threshold(mut self, value: Duration) -> Self {
		self.cache_refresh_threshold = value;
		self
	}

	/// Override `cache_expire_seconds`.
	pub fn cache_expire(mut self, value: Duration) -> Self {
		self.cache_expire = value;
		self
	}

	/// Override `cache_cleanup_interval_seconds`.
	pub fn cache_cleanup_interval(mut self, value: Duration) -> Self {
		self.cache_cleanup_interval = value;
		self
	}

	/// Override `cache_max_entries`.
	pub fn cache_max_entries(mut self, value: usize) -> Self {
		self.cache_max_entries = value;
		self
	}

	/// Override `cache_max_memory_mb` (converted to bytes).
	pub fn cache_max_memory_mb(mut self, value: usize) -> Self {
		self.cache_max_memory_bytes = value * 1024 * 1024;
		self
	}

	/// Override `cache_concurrent_reads`.
	pub fn cache_concurrent_reads(mut self, value: usize) -> Self {
		self.cache_concurrent_reads = value;
		self
	}

	/// Override `cache_low_water_ratio`.
	pub fn cache_low_water_ratio(mut self, value: f64) -> Self {
		self.cache_low_water_ratio = value;
		self
	}

	/// Override `cache_access_level`.
	pub fn cache_access_level(mut self, value: AccessLevel) -> Self {
		self.cache_access_level = value;
		self
	}

	/// Override `background_update_threads`.
	pub fn background_update_threads(mut self, value: usize) -> Self {
		self.background_update_threads = value;
		self
	}

	/// Override `background_update_queue_size`.
	pub fn background_update_queue_size(mut self, value: usize) -> Self {
		self.background_update_queue_size = value;
		self
	}

	/// Override `background_update_timeout_ms`.
	pub fn background_update_timeout(mut self, value: Duration) -> Self {
		self.background_update_timeout = value;
		self
	}

	/// Override `opc_read_timeout_ms`.
	pub fn opc_read_timeout(mut self, value: Duration) -> Self {
		self.opc_read_timeout = value;
		self
	}

	/// Override `opc_batch_size`.
	pub fn opc_batch_size(mut self, value: usize) -> Self {
		self.opc_batch_size = value;
		self
	}

	/// Override `connection_retry_max`.
	pub fn connection_retry_max(mut self, value: u32) -> Self {
		self.connection_retry_max = value;
		self
	}

	/// Override `connection_initial_delay_ms`.
	pub fn connection_initial_delay(mut self, value: Duration) -> Self {
		self.connection_initial_delay = value;
		self
	}

	/// Override `connection_max_delay_ms`.
	pub fn connection_max_delay(mut self, value: Duration) -> Self {
		self.connection_max_delay = value;
		self
	}

	/// Override `subscription_item_expire_minutes`.
	pub fn subscription_item_expire(mut self, value: Duration) -> Self {
		self.subscription_item_expire = value;
		self
	}

	/// Override `error_max_retry_attempts`.
	pub fn error_max_retry_attempts(mut self, value: u32) -> Self {
		self.error_max_retry_attempts = value;
		self
	}

	/// Override `error_retry_delay_ms`.
	pub fn error_retry_delay(mut self, value: Duration) -> Self {
		self.error_retry_delay = value;
		self
	}

	/// Override `error_rate_threshold`.
	pub fn error_rate_threshold(mut self, value: f64) -> Self {
		self.error_rate_threshold = value;
		self
	}

	/// Validate and finalize the configuration.
	pub fn build(self) -> Result<Config> {
		if self.cache_refresh_threshold >= self.cache_expire {
			return Err(Error::Validation {
				field: "cache_refresh_threshold",
				reason: "must be strictly less than cache_expire".into(),
			});
		}
		if self.cache_max_entries == 0 {
			return Err(Error::Validation {
				field: "cache_max_entries",
				reason: "must be positive".into(),
			});
		}
		if self.cache_max_memory_bytes == 0 {
			return Err(Error::Validation {
				field: "cache_max_memory_mb",
				reason: "must be positive".into(),
			});
		}
		if self.cache_concurrent_reads == 0 {
			return Err(Error::Validation {
				field: "cache_concurrent_reads",
				reason: "must be positive".into(),
			});
		}
		if !(self.cache_low_water_ratio > 0.0 && self.cache_low_water_ratio <= 1.0) {
			return Err(Error::Validation {
				field: "cache_low_water_ratio",
				reason: "must be in (0, 1]".into(),
			});
		}
		if self.background_update_threads == 0 {
			return Err(Error::Validation {
				field: "background_update_threads",
				reason: "must be positive".into(),
			});
		}
		if self.background_update_queue_size == 0 {
			return Err(Error::Validation {
				field: "background_update_queue_size",
				reason: "must be positive".into(),
			});
		}
		if self.opc_batch_size == 0 {
			return Err(Error::Validation {
				field: "opc_batch_size",
				reason: "must be positive".into(),
			});
		}
		if self.connection_retry_max == 0 {
			return Err(Error::Validation {
				field: "connection_retry_max",
				reason: "must be positive".into(),
			});
		}
		if self.connection_initial_delay > self.connection_max_delay {
			return Err(Error::Validation {
				field: "connection_initial_delay",
				reason: "must not exceed connection_max_delay".into(),
			});
		}
		if self.error_rate_threshold <= 0.0 {
			return Err(Error::Validation {
				field: "error_rate_threshold",
				reason: "must be positive".into(),
			});
		}

		Ok(Config {
			cache_refresh_threshold: self.cache_refresh_threshold,
			cache_expire: self.cache_expire,
			cache_cleanup_interval: self.cache_cleanup_interval,
			cache_max_entries: self.cache_max_entries,
			cache_max_memory_bytes: self.cache_max_memory_bytes,
			cache_concurrent_reads: self.cache_concurrent_reads,
			cache_low_water_ratio: self.cache_low_water_ratio,
			cache_access_level: self.cache_access_level,
			background_update_threads: self.background_update_threads,
			background_update_queue_size: self.background_update_queue_size,
			background_update_timeout: self.background_update_timeout,
			opc_read_timeout: self.opc_read_timeout,
			opc_batch_size: self.opc_batch_size,
			connection_retry_max: self.connection_retry_max,
			connection_initial_delay: self.connection_initial_delay,
			connection_max_delay: self.connection_max_delay,
			subscription_item_expire: self.subscription_item_expire,
			error_max_retry_attempts: self.error_max_retry_attempts,
			error_retry_delay: self.error_retry_delay,
			error_rate_threshold: self.error_rate_threshold,
		})
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn defaults_validate() {
		Config::builder().build().unwrap();
	}

	#[test]
	fn rejects_refresh_threshold_at_or_above_expire() {
		let err = Config::builder()
			.cache_refresh_threshold(Duration::from_secs(10))
			.cache_expire(Duration::from_secs(10))
			.build()
			.unwrap_err();

		assert!(matches!(err, Error::Validation { field: "cache_refresh_threshold", .. }));
	}

	#[test]
	fn rejects_low_water_ratio_out_of_range() {
		assert!(Config::builder().cache_low_water_ratio(0.0).build().is_err());
		assert!(Config::builder().cache_low_water_ratio(1.5).build().is_err());
	}
}
