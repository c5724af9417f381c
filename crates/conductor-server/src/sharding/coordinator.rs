//! Shard Coordinator
//!
//! Drives one instance through its shard lifecycle:
//!
//! ```text
//! Unregistered -> Registering -> ClaimPending <-> Holding -> Releasing -> Unregistered
//! ```
//!
//! A single supervised control task per coordinator registers the instance,
//! makes the first claim and then reacts to membership and shard watch
//! events. Events only re-arm a debounce timer; the actual work happens when
//! the timer fires, either an aggressive re-claim while shard-less or a
//! reconciliation check while holding.
//!
//! The held range is a cache of what the store says. The control task is its
//! only writer and never performs store I/O while holding the lock.

use super::{ClaimOutcome, MembershipRegistry, ShardClaimer};
use crate::config::ShardingConfig;
use crate::observability::{events, metrics, spawn_supervised};
use crate::shutdown::{self, ShutdownSignal, ShutdownTrigger};
use crate::store::{KvStore, WatchEvent, WatchReceiver};
use conductor_core::{EvenSplit, PartitionStrategy, Range};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

/// Lifecycle phase of a coordinator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinatorPhase {
    /// Not registered; initial and terminal state
    Unregistered,
    /// Granting a lease and publishing the membership record
    Registering,
    /// Registered but holding no shard
    ClaimPending,
    /// Holding exactly one shard
    Holding,
    /// Stopping: releasing the shard and unregistering
    Releasing,
}

/// Which watch stream an event or closure came from
#[derive(Debug, Clone, Copy)]
enum WatchSource {
    Membership,
    Shards,
}

impl WatchSource {
    fn label(self) -> &'static str {
        match self {
            Self::Membership => "membership",
            Self::Shards => "shards",
        }
    }
}

pub struct Coordinator {
    config: ShardingConfig,
    registry: Arc<MembershipRegistry>,
    claimer: ShardClaimer,
    strategy: RwLock<Arc<dyn PartitionStrategy>>,
    held: RwLock<Option<Range>>,
    phase: RwLock<CoordinatorPhase>,
    stop_trigger: ShutdownTrigger,
    control_task: Mutex<Option<JoinHandle<()>>>,
    started: AtomicBool,
}

impl Coordinator {
    pub fn new(store: Arc<dyn KvStore>, config: ShardingConfig) -> Arc<Self> {
        let registry = Arc::new(MembershipRegistry::new(store.clone(), &config));
        let claimer = ShardClaimer::new(store, registry.clone(), &config);
        let (stop_trigger, _) = shutdown::channel();

        Arc::new(Self {
            config,
            registry,
            claimer,
            strategy: RwLock::new(Arc::new(EvenSplit)),
            held: RwLock::new(None),
            phase: RwLock::new(CoordinatorPhase::Unregistered),
            stop_trigger,
            control_task: Mutex::new(None),
            started: AtomicBool::new(false),
        })
    }

    /// Start the control task.
    ///
    /// `cancel` is the external cancellation: once it fires the control loop
    /// and the lease keepalive both stop without releasing anything, and the
    /// instance drops out when its lease expires. Use [`stop`](Self::stop) for
    /// a graceful exit.
    ///
    /// A coordinator runs at most once; later calls are ignored.
    pub fn run(self: &Arc<Self>, cancel: ShutdownSignal) {
        if self.started.swap(true, Ordering::AcqRel) {
            warn!("Coordinator already started, ignoring run");
            return;
        }

        let this = self.clone();
        let handle = spawn_supervised("shard-control-loop", async move {
            this.control_loop(cancel).await;
        });
        *self.control_task.lock() = Some(handle);
    }

    async fn control_loop(self: Arc<Self>, cancel: ShutdownSignal) {
        let stop = self.stop_trigger.signal();

        self.set_phase(CoordinatorPhase::Registering);
        match self.registry.register(cancel.clone()).await {
            Ok(registration) => {
                debug!(instance_key = %registration.instance_key, "Coordinator registered");
                self.set_phase(CoordinatorPhase::ClaimPending);
            }
            Err(e) => {
                error!(error = %e, "Registration failed, shard coordination not started");
                self.set_phase(CoordinatorPhase::Unregistered);
                return;
            }
        }

        self.try_claim_shard().await;
        self.watch_and_rebalance(stop, cancel).await;
    }

    async fn watch_and_rebalance(&self, mut stop: ShutdownSignal, mut cancel: ShutdownSignal) {
        let retry = self.config.claim_retry_interval;
        let mut members = self.subscribe(WatchSource::Membership).await;
        let mut shards = self.subscribe(WatchSource::Shards).await;
        let mut resubscribe_at = (members.is_none() || shards.is_none())
            .then(|| Instant::now() + self.config.watch_retry_delay);

        let timer = tokio::time::sleep(retry);
        tokio::pin!(timer);

        loop {
            tokio::select! {
                _ = stop.wait() => {
                    debug!("Control loop stopping");
                    return;
                }
                _ = cancel.wait() => {
                    info!("Control loop cancelled");
                    return;
                }
                event = next_event(&mut members) => match event {
                    Some(event) => {
                        trace!(kind = ?event.kind, key = %event.key, "Membership changed");
                        timer.as_mut().reset(Instant::now() + retry);
                    }
                    None => {
                        warn!("Membership watch closed");
                        members = None;
                        resubscribe_at = Some(Instant::now() + self.config.watch_retry_delay);
                    }
                },
                event = next_event(&mut shards) => match event {
                    Some(event) => {
                        trace!(kind = ?event.kind, key = %event.key, "Shard records changed");
                        timer.as_mut().reset(Instant::now() + retry);
                    }
                    None => {
                        warn!("Shard watch closed");
                        shards = None;
                        resubscribe_at = Some(Instant::now() + self.config.watch_retry_delay);
                    }
                },
                _ = tokio::time::sleep_until(resubscribe_at.unwrap_or_else(Instant::now)),
                    if resubscribe_at.is_some() =>
                {
                    self.resubscribe(&mut members, WatchSource::Membership).await;
                    self.resubscribe(&mut shards, WatchSource::Shards).await;
                    resubscribe_at = (members.is_none() || shards.is_none())
                        .then(|| Instant::now() + self.config.watch_retry_delay);
                    // Changes may have been missed while unsubscribed
                    timer.as_mut().reset(Instant::now() + retry);
                }
                _ = &mut timer => {
                    let next = if self.has_shard() {
                        self.check_and_rebalance().await;
                        self.config.check_interval
                    } else {
                        self.try_claim_shard().await;
                        retry
                    };
                    timer.as_mut().reset(Instant::now() + next);
                }
            }
        }
    }

    async fn subscribe(&self, source: WatchSource) -> Option<WatchReceiver> {
        let result = match source {
            WatchSource::Membership => self.registry.watch().await,
            WatchSource::Shards => self.claimer.watch().await,
        };

        match result {
            Ok(rx) => {
                trace!(stream = source.label(), "Watch subscribed");
                Some(rx)
            }
            Err(e) => {
                warn!(stream = source.label(), error = %e, "Watch subscribe failed");
                None
            }
        }
    }

    async fn resubscribe(&self, slot: &mut Option<WatchReceiver>, source: WatchSource) {
        if slot.is_some() {
            return;
        }
        *slot = self.subscribe(source).await;
        if slot.is_some() {
            info!(stream = source.label(), "Watch re-established");
            metrics::record_watch_resubscribe(source.label());
        }
    }

    /// Release whatever is held, recompute the partition table and claim the
    /// first free shard in shard-id order.
    ///
    /// Returns whether a shard is held afterwards. Failures are logged and
    /// left to the retry timer.
    pub async fn try_claim_shard(&self) -> bool {
        let instance_count = match self.registry.instance_count().await {
            Ok(0) => {
                warn!("No live instances, cannot claim a shard yet");
                return false;
            }
            Ok(count) => count,
            Err(e) => {
                warn!(error = %e, "Failed to count instances");
                metrics::record_claim("error");
                return false;
            }
        };
        metrics::set_instance_count(instance_count);

        let table = self
            .strategy()
            .calculate(self.config.total_size, instance_count);

        if let Some(previous) = self.clear_held() {
            let released = match self.claimer.release(&previous).await {
                Ok(released) => released,
                Err(e) => {
                    warn!(shard_id = previous.shard_id, error = %e, "Failed to release shard before re-claim");
                    false
                }
            };
            // Claiming now would leave two records under this lease
            if !released {
                self.restore_held(previous);
                metrics::record_claim("error");
                return false;
            }
        }

        if let Err(e) = self.claimer.cleanup_stale(instance_count).await {
            warn!(error = %e, "Stale shard cleanup failed");
        }

        for range in &table {
            match self.claimer.try_claim(range).await {
                Ok(ClaimOutcome::Acquired) => {
                    metrics::record_claim("acquired");
                    self.hold(*range, instance_count);
                    return true;
                }
                Ok(ClaimOutcome::AlreadyHeld { stored }) => {
                    if !stored.same_bounds(range) {
                        if let Err(e) = self.claimer.update(range).await {
                            warn!(shard_id = range.shard_id, error = %e, "Failed to refresh held shard record");
                            metrics::record_claim("error");
                            return false;
                        }
                    }
                    metrics::record_claim("reclaimed");
                    self.hold(*range, instance_count);
                    return true;
                }
                Ok(ClaimOutcome::Taken { holder }) => {
                    trace!(shard_id = range.shard_id, holder = ?holder, "Shard taken");
                }
                Err(e) => {
                    warn!(shard_id = range.shard_id, error = %e, "Claim attempt failed");
                    metrics::record_claim("error");
                }
            }
        }

        debug!(instance_count = instance_count, "No shard available, will retry");
        metrics::record_claim("taken");
        false
    }

    /// Reconcile the held shard with the store and the current partition table.
    ///
    /// Triggers a full re-claim when instance and shard counts differ, when
    /// nothing is held, when the shard record no longer names this instance,
    /// or when the table no longer has the held range.
    pub async fn check_and_rebalance(&self) {
        let counts = tokio::try_join!(self.registry.instance_count(), self.claimer.shard_count());
        let (instance_count, shard_count) = match counts {
            Ok(counts) => counts,
            Err(e) => {
                warn!(error = %e, "Reconciliation skipped, counts unavailable");
                return;
            }
        };
        metrics::set_instance_count(instance_count);

        if instance_count != shard_count {
            self.rebalance("count_mismatch", instance_count, shard_count).await;
            return;
        }

        let Some(held) = self.shard_range() else {
            self.try_claim_shard().await;
            return;
        };
        let Some(instance_key) = self.registry.instance_key() else {
            return;
        };

        match self.claimer.record(held.shard_id).await {
            Ok(Some(record)) if record.is_held_by(&instance_key) => {}
            Ok(record) => {
                events::shard_lost(&held, record.as_ref().map(|r| r.holder.as_str()));
                self.clear_held();
                self.rebalance("shard_lost", instance_count, shard_count).await;
                return;
            }
            Err(e) => {
                warn!(shard_id = held.shard_id, error = %e, "Failed to read held shard record");
                return;
            }
        }

        let table = self
            .strategy()
            .calculate(self.config.total_size, instance_count);

        let reason = match table.get(held.shard_id as usize) {
            None => "out_of_range",
            Some(expected) if !expected.same_bounds(&held) => "range_changed",
            Some(_) => {
                trace!(shard_id = held.shard_id, "Shard assignment current");
                return;
            }
        };
        self.rebalance(reason, instance_count, shard_count).await;
    }

    async fn rebalance(&self, reason: &'static str, instance_count: usize, shard_count: usize) {
        events::rebalance_triggered(reason, instance_count, shard_count);
        metrics::record_rebalance(reason);
        self.try_claim_shard().await;
    }

    /// Stop the control loop, then release the held shard and unregister.
    ///
    /// Release and unregister are bounded by the shutdown timeout; the lease
    /// TTL cleans up whatever does not finish in time.
    pub async fn stop(&self) {
        self.stop_trigger.trigger();

        let handle = self.control_task.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "Control loop did not exit cleanly");
            }
        }

        self.set_phase(CoordinatorPhase::Releasing);
        let cleanup = async {
            if let Some(range) = self.clear_held() {
                match self.claimer.release(&range).await {
                    Ok(true) => {}
                    Ok(false) => {
                        warn!(shard_id = range.shard_id, "Shard left to lease expiry on shutdown")
                    }
                    Err(e) => {
                        warn!(shard_id = range.shard_id, error = %e, "Failed to release shard on shutdown")
                    }
                }
            }
            self.registry.unregister().await;
        };

        if tokio::time::timeout(self.config.shutdown_timeout, cleanup)
            .await
            .is_err()
        {
            warn!(
                timeout_ms = self.config.shutdown_timeout.as_millis() as u64,
                "Shutdown cleanup timed out, leaving it to lease expiry"
            );
        }

        self.set_phase(CoordinatorPhase::Unregistered);
        info!("Coordinator stopped");
    }

    pub fn set_strategy(&self, strategy: Arc<dyn PartitionStrategy>) {
        debug!(strategy = strategy.name(), "Partition strategy set");
        *self.strategy.write() = strategy;
    }

    pub fn strategy(&self) -> Arc<dyn PartitionStrategy> {
        self.strategy.read().clone()
    }

    /// Currently held range, if any
    pub fn shard_range(&self) -> Option<Range> {
        *self.held.read()
    }

    pub fn has_shard(&self) -> bool {
        self.held.read().is_some()
    }

    /// Whether `value` falls inside the held range
    pub fn in_range(&self, value: u64) -> bool {
        self.held
            .read()
            .as_ref()
            .is_some_and(|range| range.contains(value))
    }

    pub fn phase(&self) -> CoordinatorPhase {
        *self.phase.read()
    }

    pub fn registry(&self) -> &Arc<MembershipRegistry> {
        &self.registry
    }

    pub fn claimer(&self) -> &ShardClaimer {
        &self.claimer
    }

    fn set_phase(&self, phase: CoordinatorPhase) {
        *self.phase.write() = phase;
    }

    fn hold(&self, range: Range, instance_count: usize) {
        *self.held.write() = Some(range);
        self.set_phase(CoordinatorPhase::Holding);
        metrics::set_shard_held(true);
        events::shard_claimed(&range, instance_count);
    }

    /// Put back a range whose release did not go through, without counting
    /// it as a new claim.
    fn restore_held(&self, range: Range) {
        *self.held.write() = Some(range);
        self.set_phase(CoordinatorPhase::Holding);
        metrics::set_shard_held(true);
    }

    fn clear_held(&self) -> Option<Range> {
        let previous = self.held.write().take();
        if previous.is_some() {
            self.set_phase(CoordinatorPhase::ClaimPending);
            metrics::set_shard_held(false);
        }
        previous
    }
}

/// Next event from an optional watch; pending while unsubscribed.
async fn next_event(rx: &mut Option<WatchReceiver>) -> Option<WatchEvent> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}
