//! Reconnection Manager: watches the adapter's connection state, reconnects with exponential
//! backoff on loss, and rebinds every monitored item once the session is back.

use std::{
	sync::{
		Arc,
		atomic::{AtomicU32, AtomicU64, Ordering},
	},
	time::Duration,
};

use rand::Rng;
use tokio::{sync::watch, task::JoinHandle, time::Instant};

use crate::{cache::Cache, config::Config, opc::OpcAdapter, reconciliation, subscription::SubscriptionManager};

/// Lifecycle state, `SPEC_FULL.md` §4.6.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ReconnectionState {
	/// No monitoring loop running.
	Idle,
	/// The loop is running and believes the session is healthy.
	Monitoring,
	/// The session was lost; backing off between `connect()` attempts.
	Reconnecting,
	/// `connect()` succeeded; re-adding every previously known monitored item.
	RecoveringSubscriptions,
}

/// Snapshot of [`ReconnectionManager`] counters.
#[derive(Clone, Copy, Debug)]
pub struct ReconnectionStats {
	/// Every attempted reconnection, successful or not.
	pub total_reconnection_attempts: u64,
	/// Reconnections that re-established a session.
	pub successful_reconnections: u64,
	/// Reconnections that exhausted the retry budget without success.
	pub failed_reconnections: u64,
	/// `recreate_all` calls issued after a successful reconnection.
	pub subscription_recoveries: u64,
	/// Individual monitored items successfully re-added across all recoveries.
	pub successful_subscription_recoveries: u64,
	/// Current lifecycle state.
	pub current_state: ReconnectionState,
	/// Whether the monitoring loop is running.
	pub is_monitoring: bool,
	/// The retry attempt counter, reset to zero on every successful reconnection.
	pub current_retry_attempt: u32,
}

struct Counters {
	total_attempts: AtomicU64,
	successful: AtomicU64,
	failed: AtomicU64,
	subscription_recoveries: AtomicU64,
	successful_subscription_recoveries: AtomicU64,
	retry_attempt: AtomicU32,
}

/// Owns the monitoring loop described in `SPEC_FULL.md` §4.6.
///
/// State is broadcast over a [`tokio::sync::watch`] channel rather than callbacks
/// (`SPEC_FULL.md` §9's function-pointer-to-channel redesign applied uniformly across the
/// adapter boundary).
pub struct ReconnectionManager {
	adapter: Arc<dyn OpcAdapter>,
	cache: Arc<Cache>,
	subscriptions: Arc<SubscriptionManager>,
	retry_max: u32,
	initial_delay: Duration,
	max_delay: Duration,
	state_tx: watch::Sender<ReconnectionState>,
	stop_tx: watch::Sender<bool>,
	counters: Counters,
	task: tokio::sync::Mutex<Option<JoinHandle<()>>>,
	connection_lost_at: std::sync::Mutex<Option<Instant>>,
}
impl ReconnectionManager {
	/// Build a manager in the [`ReconnectionState::Idle`] state.
	pub fn new(adapter: Arc<dyn OpcAdapter>, cache: Arc<Cache>, subscriptions: Arc<SubscriptionManager>, config: &Config) -> Self {
		let (state_tx, _) = watch::channel(ReconnectionState::Idle);
		let (stop_tx, _) = watch::channel(false);

		Self {
			adapter,
			cache,
			subscriptions,
			retry_max: config.connection_retry_max,
			initial_delay: config.connection_initial_delay,
			max_delay: config.connection_max_delay,
			state_tx,
			stop_tx,
			counters: Counters {
				total_attempts: AtomicU64::new(0),
				successful: AtomicU64::new(0),
				failed: AtomicU64::new(0),
				subscription_recoveries: AtomicU64::new(0),
				successful_subscription_recoveries: AtomicU64::new(0),
				retry_attempt: AtomicU32::new(0),
			},
			task: tokio::sync::Mutex::new(None),
			connection_lost_at: std::sync::Mutex::new(None),
		}
	}

	/// Start the monitoring loop. A no-op if already monitoring.
	pub async fn start_monitoring(self: &Arc<Self>, poll_interval: Duration) {
		let mut task = self.task.lock().await;

		if task.is_some() {
			return;
		}

		self.state_tx.send_replace(ReconnectionState::Monitoring);
		self.stop_tx.send_replace(false);

		let this = Arc::clone(self);

		*task = Some(tokio::spawn(async move { this.monitoring_loop(poll_interval).await }));
	}

	/// Stop the monitoring loop and wait for it to exit.
	pub async fn stop_monitoring(&self) {
		let handle = self.task.lock().await.take();

		self.stop_tx.send_replace(true);

		if let Some(handle) = handle {
			let _ = handle.await;
		}

		self.state_tx.send_replace(ReconnectionState::Idle);
	}

	/// Whether the monitoring loop is currently running.
	pub async fn is_monitoring(&self) -> bool {
		self.task.lock().await.is_some()
	}

	/// Current lifecycle state.
	pub fn state(&self) -> ReconnectionState {
		*self.state_tx.borrow()
	}

	/// Subscribe to state transitions.
	pub fn subscribe(&self) -> watch::Receiver<ReconnectionState> {
		self.state_tx.subscribe()
	}

	/// Force an immediate reconnection attempt regardless of the current state, bypassing the
	/// poll interval. Intended for tests and manual operator intervention.
	pub async fn trigger_reconnection(&self) {
		self.reconnect_with_backoff().await;
	}

	async fn monitoring_loop(&self, poll_interval: Duration) {
		let mut stop_rx = self.stop_tx.subscribe();
		let mut ticker = tokio::time::interval(poll_interval);

		loop {
			tokio::select! {
				_ = stop_rx.changed() => {
					if *stop_rx.borrow() {
						return;
					}
				}
				_ = ticker.tick() => {
					let _ = self.adapter.run_iterate(poll_interval).await;

					if !self.adapter.is_connected() {
						self.connection_lost_at.lock().unwrap().get_or_insert_with(Instant::now);
						self.reconnect_with_backoff().await;
					}
				}
			}
		}
	}

	async fn reconnect_with_backoff(&self) {
		self.state_tx.send_replace(ReconnectionState::Reconnecting);
		self.counters.retry_attempt.store(0, Ordering::Relaxed);

		let lost_at = *self.connection_lost_at.lock().unwrap().get_or_insert_with(Instant::now);
		let mut stop_rx = self.stop_tx.subscribe();

		loop {
			if *stop_rx.borrow() {
				return;
			}

			let attempt = self.counters.retry_attempt.fetch_add(1, Ordering::Relaxed) + 1;

			self.counters.total_attempts.fetch_add(1, Ordering::Relaxed);

			let connect_result = tokio::select! {
				res = self.adapter.connect() => res,
				_ = stop_rx.changed() => {
					if *stop_rx.borrow() {
						return;
					}
					continue;
				}
			};

			match connect_result {
				Ok(()) => {
					self.counters.successful.fetch_add(1, Ordering::Relaxed);
					self.counters.retry_attempt.store(0, Ordering::Relaxed);
					#[cfg(feature = "metrics")]
					crate::metrics::record_reconnection_attempt(true);

					let downtime = Instant::now().saturating_duration_since(lost_at);

					#[cfg(feature = "metrics")]
					crate::metrics::record_reconnection_downtime(downtime.as_secs_f64());
					#[cfg(not(feature = "metrics"))]
					let _ = downtime;

					*self.connection_lost_at.lock().unwrap() = None;

					self.recover_subscriptions().await;
					self.state_tx.send_replace(ReconnectionState::Monitoring);

					return;
				},
				Err(_) => {
					self.counters.failed.fetch_add(1, Ordering::Relaxed);
					#[cfg(feature = "metrics")]
					crate::metrics::record_reconnection_attempt(false);

					let sleep_for = if attempt >= self.retry_max {
						// Retry budget exhausted; long-sleep at the ceiling and keep trying
						// indefinitely rather than giving up on the upstream forever.
						self.counters.retry_attempt.store(0, Ordering::Relaxed);
						self.max_delay
					} else {
						self.calculate_retry_delay(attempt)
					};

					tokio::select! {
						_ = tokio::time::sleep(sleep_for) => {},
						_ = stop_rx.changed() => {
							if *stop_rx.borrow() {
								return;
							}
						}
					}
				},
			}
		}
	}

	async fn recover_subscriptions(&self) {
		self.state_tx.send_replace(ReconnectionState::RecoveringSubscriptions);
		self.counters.subscription_recoveries.fetch_add(1, Ordering::Relaxed);

		let outcome = self.subscriptions.recreate_all(Instant::now()).await;

		self.counters.successful_subscription_recoveries.fetch_add(outcome.recovered.len() as u64, Ordering::Relaxed);

		if !outcome.failed.is_empty() {
			tracing::warn!(failed = outcome.failed.len(), "could not recover every monitored item after reconnection");
		}

		let report = reconciliation::reconcile(&self.cache, &self.subscriptions).await;

		if report.flags_cleared > 0 || report.flags_set > 0 {
			tracing::debug!(cleared = report.flags_cleared, set = report.flags_set, "reconciled subscription flags after reconnect");
		}
	}

	/// `min(initial_delay * 2^(attempt-1) * jitter, max_delay)`, `jitter` uniform in `[0.9, 1.1]`
	/// (`SPEC_FULL.md` §4.6) to avoid a thundering herd against the server on simultaneous
	/// disconnects. Jitter is applied before the cap so the result never exceeds `max_delay`.
	fn calculate_retry_delay(&self, attempt: u32) -> Duration {
		let exponent = attempt.saturating_sub(1).min(20);
		let base = self.initial_delay.saturating_mul(1u32.checked_shl(exponent).unwrap_or(u32::MAX));
		let jitter_fraction = rand::rng().random_range(0.9..1.1);

		base.mul_f64(jitter_fraction).min(self.max_delay)
	}

	/// Snapshot counters for telemetry.
	pub fn stats(&self) -> ReconnectionStats {
		ReconnectionStats {
			total_reconnection_attempts: self.counters.total_attempts.load(Ordering::Relaxed),
			successful_reconnections: self.counters.successful.load(Ordering::Relaxed),
			failed_reconnections: self.counters.failed.load(Ordering::Relaxed),
			subscription_recoveries: self.counters.subscription_recoveries.load(Ordering::Relaxed),
			successful_subscription_recoveries: self.counters.successful_subscription_recoveries.load(Ordering::Relaxed),
			current_state: self.state(),
			is_monitoring: self.state() != ReconnectionState::Idle,
			current_retry_attempt: self.counters.retry_attempt.load(Ordering::Relaxed),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::{cache::Cache, node_id::NodeId, test_support::MockOpcAdapter};

	fn config() -> Config {
		Config::builder()
			.connection_initial_delay(Duration::from_millis(1))
			.connection_max_delay(Duration::from_millis(5))
			.connection_retry_max(2)
			.build()
			.unwrap()
	}

	#[tokio::test]
	async fn trigger_reconnection_recovers_once_the_adapter_accepts_connect() {
		let adapter = Arc::new(MockOpcAdapter::new());

		adapter.set_connected(false);

		let cache = Arc::new(Cache::new(&config()));
		let subscriptions = Arc::new(SubscriptionManager::new(adapter.clone(), cache.clone(), &config()));
		let manager = Arc::new(ReconnectionManager::new(adapter.clone(), cache, subscriptions, &config()));

		manager.trigger_reconnection().await;

		assert_eq!(manager.stats().successful_reconnections, 1);
		assert_eq!(manager.state(), ReconnectionState::Monitoring);
	}

	#[tokio::test]
	async fn reconnection_recreates_previously_monitored_items() {
		let adapter = Arc::new(MockOpcAdapter::new());
		let cache = Arc::new(Cache::new(&config()));
		let subscriptions = Arc::new(SubscriptionManager::new(adapter.clone(), cache.clone(), &config()));

		subscriptions.add(&NodeId::parse("ns=2;s=A").unwrap(), Instant::now()).await.unwrap();
		adapter.set_connected(false);

		let manager = Arc::new(ReconnectionManager::new(adapter.clone(), cache, subscriptions.clone(), &config()));

		manager.trigger_reconnection().await;

		assert_eq!(manager.stats().successful_subscription_recoveries, 1);
		assert_eq!(subscriptions.active_monitored_items().await.len(), 1);
	}

	#[test]
	fn retry_delay_is_capped_at_the_configured_maximum() {
		let adapter: Arc<dyn OpcAdapter> = Arc::new(MockOpcAdapter::new());
		let config = Config::builder()
			.connection_initial_delay(Duration::from_millis(100))
			.connection_max_delay(Duration::from_millis(300))
			.build()
			.unwrap();
		let cache = Arc::new(Cache::new(&config));
		let subscriptions = Arc::new(SubscriptionManager::new(adapter.clone(), cache.clone(), &config));
		let manager = ReconnectionManager::new(adapter, cache, subscriptions, &config);

		for attempt in 1..10 {
			assert!(manager.calculate_retry_delay(attempt) <= Duration::from_millis(300));
		}
	}
}
