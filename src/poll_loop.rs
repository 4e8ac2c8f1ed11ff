//! Per-subscriber polling orchestration.
//!
//! Every observed subscriber gets its own tokio task that resolves the
//! subscriber's entitlement once, then samples counters at a fixed cadence and
//! publishes the resulting [`UtilizationSample`] on a watch channel. Tasks
//! share nothing but the record store handle, so a slow or failing backend
//! call for one subscriber never delays another.
//!
//! # State machine
//!
//! ```text
//! Starting -> Resolving -> Sampling <-> Degraded
//!     \           \            \           \
//!      `-----------`------------`-----------`--> Stopped
//! ```
//!
//! `Starting` covers the first resolution attempt. `Resolving` means the
//! backend was unreachable and resolution is being retried with backoff.
//! `Degraded` is entered after `degraded_threshold` consecutive sampler
//! failures; the last good sample stays published while the retry interval
//! widens.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::backoff::{Backoff, BackoffConfig};
use crate::config::{ConfigError, PollConfig};
use crate::entitlement::{Entitlement, EntitlementResolver, ResolveError};
use crate::record_store::{now_millis, RecordStore, SubscriberId};
use crate::sampler::{CounterSampler, SampleError};
use crate::utilization::{UtilizationSample, UtilizationTracker};

/// Lifecycle state of one subscriber's poll task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PollState {
    /// First resolution attempt in flight.
    Starting,
    /// Resolution is being retried after a backend failure.
    Resolving,
    /// Steady state.
    Sampling,
    /// Repeated sampler failures; last good sample is being served.
    Degraded,
    /// Terminal.
    Stopped,
}

/// Why a poll task reached [`PollState::Stopped`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// The store has no record for the subscriber.
    UnknownSubscriber,
    /// The caller stopped observing the subscriber.
    Unsubscribed,
    /// The whole poll loop was shut down.
    Shutdown,
}

/// Latest published view of one subscriber.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Published {
    /// Current lifecycle state.
    pub state: PollState,
    /// Set once the state is [`PollState::Stopped`].
    pub stop_reason: Option<StopReason>,
    /// Cached entitlement, once resolved.
    pub entitlement: Option<Entitlement>,
    /// Most recent sample, stale while degraded.
    pub sample: Option<UtilizationSample>,
    /// Consecutive sampler failures.
    pub consecutive_failures: u32,
}

impl Published {
    fn starting() -> Self {
        Self {
            state: PollState::Starting,
            stop_reason: None,
            entitlement: None,
            sample: None,
            consecutive_failures: 0,
        }
    }
}

/// Errors returned to callers of [`PollLoop`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PollError {
    /// The store has no record for this subscriber; polling never started.
    #[error("unknown subscriber {0}")]
    UnknownSubscriber(SubscriberId),

    /// The subscription was cancelled before resolution finished.
    #[error("subscription for {0} was cancelled")]
    Cancelled(SubscriberId),
}

/// Errors returned by the published sample feed.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FeedError {
    /// The subscriber is not under observation.
    #[error("subscriber {0} is not subscribed")]
    NotSubscribed(SubscriberId),

    /// The subscriber is observed but nothing has been sampled yet.
    #[error("no sample yet for subscriber {0}")]
    NoSampleYet(SubscriberId),
}

struct SubscriberHandle {
    generation: u64,
    task: JoinHandle<()>,
    feed: Arc<watch::Sender<Published>>,
    invalidate: Arc<AtomicBool>,
}

impl SubscriberHandle {
    fn stop(self, reason: StopReason) {
        self.task.abort();
        mark_stopped(&self.feed, reason);
    }
}

fn mark_stopped(feed: &watch::Sender<Published>, reason: StopReason) {
    feed.send_if_modified(|published| {
        if published.state == PollState::Stopped {
            return false;
        }
        published.state = PollState::Stopped;
        published.stop_reason = Some(reason);
        true
    });
}

type Registry = Mutex<HashMap<SubscriberId, SubscriberHandle>>;

/// Drops `id` from the registry unless it was re-subscribed since.
fn remove_if_generation(registry: &Registry, id: &SubscriberId, generation: u64) {
    let mut subscribers = registry.lock();
    if subscribers
        .get(id)
        .is_some_and(|handle| handle.generation == generation)
    {
        subscribers.remove(id);
    }
}

/// Drives sampling for every subscriber under observation.
pub struct PollLoop {
    resolver: EntitlementResolver,
    sampler: CounterSampler,
    config: PollConfig,
    subscribers: Arc<Registry>,
    next_generation: AtomicU64,
}

impl PollLoop {
    /// Creates a poll loop over `store`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if `config` does not validate.
    pub fn new(store: Arc<dyn RecordStore>, config: PollConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            resolver: EntitlementResolver::new(Arc::clone(&store), config.call_timeout),
            sampler: CounterSampler::new(store, config.call_timeout),
            config,
            subscribers: Arc::new(Mutex::new(HashMap::new())),
            next_generation: AtomicU64::new(0),
        })
    }

    /// Returns the active configuration.
    #[must_use]
    pub const fn config(&self) -> &PollConfig {
        &self.config
    }

    /// Starts observing `id`.
    ///
    /// Waits for the first resolution attempt only. If the backend is
    /// unreachable the call still succeeds and the task keeps retrying in
    /// [`PollState::Resolving`]. Subscribing an already observed id is a
    /// no-op.
    ///
    /// # Errors
    ///
    /// [`PollError::UnknownSubscriber`] when the store has no such subscriber,
    /// [`PollError::Cancelled`] when unsubscribed concurrently.
    pub async fn subscribe(&self, id: &SubscriberId) -> Result<(), PollError> {
        let mut rx = {
            let mut subscribers = self.subscribers.lock();
            let running = subscribers
                .get(id)
                .filter(|handle| !handle.task.is_finished())
                .map(|handle| handle.feed.subscribe());
            match running {
                Some(rx) => rx,
                None => {
                    let handle = self.spawn(id.clone());
                    let rx = handle.feed.subscribe();
                    subscribers.insert(id.clone(), handle);
                    rx
                }
            }
        };

        let settled = rx
            .wait_for(|p| p.state != PollState::Starting)
            .await
            .map(|p| (p.state, p.stop_reason));

        match settled {
            Ok((PollState::Stopped, Some(StopReason::UnknownSubscriber))) => {
                Err(PollError::UnknownSubscriber(id.clone()))
            }
            Ok((PollState::Stopped, _)) | Err(_) => Err(PollError::Cancelled(id.clone())),
            Ok(_) => Ok(()),
        }
    }

    /// Stops observing `id`, cancelling any in-flight tick or pending retry.
    ///
    /// Returns `false` if `id` was not observed.
    pub fn unsubscribe(&self, id: &SubscriberId) -> bool {
        let handle = self.subscribers.lock().remove(id);
        match handle {
            Some(handle) => {
                handle.stop(StopReason::Unsubscribed);
                info!(subscriber = %id, "Unsubscribed");
                true
            }
            None => false,
        }
    }

    /// Forces the next tick of `id` to re-resolve its entitlement.
    ///
    /// Returns `false` if `id` was not observed.
    pub fn invalidate_entitlement(&self, id: &SubscriberId) -> bool {
        match self.subscribers.lock().get(id) {
            Some(handle) => {
                handle.invalidate.store(true, Ordering::Release);
                true
            }
            None => false,
        }
    }

    /// Latest published sample for `id`.
    ///
    /// # Errors
    ///
    /// [`FeedError::NotSubscribed`] if `id` is not observed (or its task
    /// stopped), [`FeedError::NoSampleYet`] before the first tick completes.
    pub fn latest(&self, id: &SubscriberId) -> Result<UtilizationSample, FeedError> {
        let published = self.published(id)?;
        published
            .sample
            .ok_or_else(|| FeedError::NoSampleYet(id.clone()))
    }

    /// Full published view for `id`.
    ///
    /// # Errors
    ///
    /// [`FeedError::NotSubscribed`] if `id` is not observed or stopped.
    pub fn published(&self, id: &SubscriberId) -> Result<Published, FeedError> {
        let subscribers = self.subscribers.lock();
        let published = subscribers
            .get(id)
            .map(|handle| handle.feed.borrow().clone())
            .ok_or_else(|| FeedError::NotSubscribed(id.clone()))?;
        if published.state == PollState::Stopped {
            return Err(FeedError::NotSubscribed(id.clone()));
        }
        Ok(published)
    }

    /// Push interface: a receiver notified on every publication for `id`.
    ///
    /// # Errors
    ///
    /// [`FeedError::NotSubscribed`] if `id` is not observed.
    pub fn watch(&self, id: &SubscriberId) -> Result<watch::Receiver<Published>, FeedError> {
        self.subscribers
            .lock()
            .get(id)
            .map(|handle| handle.feed.subscribe())
            .ok_or_else(|| FeedError::NotSubscribed(id.clone()))
    }

    /// Current state of `id`, if observed.
    pub fn state(&self, id: &SubscriberId) -> Option<PollState> {
        self.subscribers
            .lock()
            .get(id)
            .map(|handle| handle.feed.borrow().state)
    }

    /// Cached entitlement of `id`, if resolved.
    pub fn entitlement(&self, id: &SubscriberId) -> Option<Entitlement> {
        self.subscribers
            .lock()
            .get(id)
            .and_then(|handle| handle.feed.borrow().entitlement.clone())
    }

    /// Observed subscribers that have not stopped, sorted.
    pub fn subscribers(&self) -> Vec<SubscriberId> {
        let mut ids: Vec<SubscriberId> = self
            .subscribers
            .lock()
            .iter()
            .filter(|(_, handle)| handle.feed.borrow().state != PollState::Stopped)
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Published view of every running subscriber, sorted by id.
    pub fn snapshot(&self) -> Vec<(SubscriberId, Published)> {
        let mut rows: Vec<(SubscriberId, Published)> = self
            .subscribers
            .lock()
            .iter()
            .map(|(id, handle)| (id.clone(), handle.feed.borrow().clone()))
            .filter(|(_, published)| published.state != PollState::Stopped)
            .collect();
        rows.sort_by(|a, b| a.0.cmp(&b.0));
        rows
    }

    /// Stops every subscriber.
    pub fn shutdown(&self) {
        let handles: Vec<_> = self.subscribers.lock().drain().collect();
        for (id, handle) in handles {
            debug!(subscriber = %id, "Stopping poll task");
            handle.stop(StopReason::Shutdown);
        }
    }

    fn spawn(&self, id: SubscriberId) -> SubscriberHandle {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let (feed, _) = watch::channel(Published::starting());
        let feed = Arc::new(feed);
        let invalidate = Arc::new(AtomicBool::new(false));
        let task = SubscriberTask {
            state: SubscriberPollState::new(&id, &self.config),
            id,
            generation,
            registry: Arc::downgrade(&self.subscribers),
            resolver: self.resolver.clone(),
            sampler: self.sampler.clone(),
            config: self.config.clone(),
            feed: Arc::clone(&feed),
            invalidate: Arc::clone(&invalidate),
        };
        SubscriberHandle {
            generation,
            task: tokio::spawn(task.run()),
            feed,
            invalidate,
        }
    }
}

impl Drop for PollLoop {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Mutable state owned by exactly one poll task.
struct SubscriberPollState {
    phase: PollState,
    entitlement: Entitlement,
    tracker: UtilizationTracker,
    consecutive_failures: u32,
    backoff: Backoff,
    degraded_backoff: BackoffConfig,
    next_deadline: Instant,
    last_sampled_at: Option<u64>,
}

impl SubscriberPollState {
    fn new(id: &SubscriberId, config: &PollConfig) -> Self {
        Self {
            phase: PollState::Starting,
            entitlement: Entitlement::unknown(id.clone()),
            tracker: UtilizationTracker::new(config.poll_interval.as_secs_f64()),
            consecutive_failures: 0,
            backoff: Backoff::new(config.backoff),
            degraded_backoff: config.backoff.seeded(config.poll_interval),
            next_deadline: Instant::now(),
            last_sampled_at: None,
        }
    }
}

struct SubscriberTask {
    id: SubscriberId,
    generation: u64,
    registry: Weak<Registry>,
    resolver: EntitlementResolver,
    sampler: CounterSampler,
    config: PollConfig,
    feed: Arc<watch::Sender<Published>>,
    invalidate: Arc<AtomicBool>,
    state: SubscriberPollState,
}

impl SubscriberTask {
    async fn run(mut self) {
        if !self.resolve_until_settled().await {
            return;
        }

        info!(
            subscriber = %self.id,
            downlink = self.state.entitlement.downlink_ceiling_mbps,
            uplink = self.state.entitlement.uplink_ceiling_mbps,
            interval_ms = u64::try_from(self.config.poll_interval.as_millis()).unwrap_or(u64::MAX),
            "Sampling started"
        );
        self.state.backoff.reset();
        self.state.next_deadline = Instant::now();

        loop {
            tokio::time::sleep_until(self.state.next_deadline).await;
            let tick_start = Instant::now();

            if self.invalidate.swap(false, Ordering::AcqRel) && !self.refresh_entitlement().await {
                return;
            }

            let delay = self.tick().await;
            self.state.next_deadline = tick_start + delay;
        }
    }

    /// Resolves until the outcome is definitive. Returns `false` when the
    /// subscriber is unknown and the task must stop.
    async fn resolve_until_settled(&mut self) -> bool {
        loop {
            match self.resolver.resolve(&self.id).await {
                Ok(entitlement) => {
                    self.state.entitlement = entitlement;
                    return true;
                }
                Err(ResolveError::PolicyUnresolved(_)) => {
                    info!(subscriber = %self.id, "No policy resolvable, sampling without ceiling");
                    self.state.entitlement = Entitlement::unknown(self.id.clone());
                    return true;
                }
                Err(ResolveError::NotFound(_)) => {
                    warn!(subscriber = %self.id, "Unknown subscriber, polling aborted");
                    self.stop_unknown();
                    return false;
                }
                Err(ResolveError::BackendUnavailable(e)) => {
                    let delay = self.state.backoff.next_delay();
                    warn!(
                        subscriber = %self.id,
                        error = %e,
                        attempt = self.state.backoff.attempts(),
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        "Entitlement resolution failed, retrying"
                    );
                    self.state.phase = PollState::Resolving;
                    self.publish(|p| p.state = PollState::Resolving);
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Single re-resolution after an explicit invalidation. Returns `false`
    /// when the subscriber disappeared from the store.
    async fn refresh_entitlement(&mut self) -> bool {
        match self.resolver.resolve(&self.id).await {
            Ok(entitlement) => {
                info!(
                    subscriber = %self.id,
                    policy = ?entitlement.policy_name,
                    "Entitlement refreshed"
                );
                self.state.entitlement = entitlement;
            }
            Err(ResolveError::PolicyUnresolved(_)) => {
                self.state.entitlement = Entitlement::unknown(self.id.clone());
            }
            Err(ResolveError::NotFound(_)) => {
                warn!(subscriber = %self.id, "Subscriber removed from store, polling stopped");
                self.stop_unknown();
                return false;
            }
            Err(ResolveError::BackendUnavailable(e)) => {
                debug!(
                    subscriber = %self.id,
                    error = %e,
                    "Refresh failed, keeping cached entitlement"
                );
                self.invalidate.store(true, Ordering::Release);
            }
        }
        true
    }

    /// One sample-and-publish cycle. Returns the delay until the next tick.
    async fn tick(&mut self) -> Duration {
        match self.sampler.sample(&self.id).await {
            Ok(counters) => {
                let sample = self.state.tracker.observe(counters, &self.state.entitlement);
                if self.state.phase == PollState::Degraded {
                    info!(
                        subscriber = %self.id,
                        failures = self.state.consecutive_failures,
                        "Backend recovered"
                    );
                }
                self.state.consecutive_failures = 0;
                self.publish_sample(PollState::Sampling, sample);
                self.config.poll_interval
            }
            Err(SampleError::NotFound(_)) => {
                debug!(subscriber = %self.id, "No active session, publishing zero traffic");
                self.state.tracker.reset();
                let idle = UtilizationSample::idle(self.id.clone(), now_millis());
                let phase = match self.state.phase {
                    PollState::Degraded => PollState::Degraded,
                    _ => PollState::Sampling,
                };
                self.publish_sample(phase, idle);
                self.config.poll_interval
            }
            Err(SampleError::BackendUnavailable(e)) => {
                self.state.consecutive_failures =
                    self.state.consecutive_failures.saturating_add(1);
                let failures = self.state.consecutive_failures;
                let mut delay = self.config.poll_interval;

                if failures >= self.config.degraded_threshold {
                    if self.state.phase != PollState::Degraded {
                        warn!(
                            subscriber = %self.id,
                            failures,
                            error = %e,
                            "Entering degraded state"
                        );
                    }
                    self.state.phase = PollState::Degraded;
                    // Attempt 2 onward of a sequence seeded at the interval
                    let attempt = (failures - self.config.degraded_threshold).saturating_add(2);
                    delay = self.state.degraded_backoff.delay_for_attempt(attempt);
                } else {
                    warn!(subscriber = %self.id, failures, error = %e, "Sampling failed");
                    if self.state.phase != PollState::Degraded {
                        self.state.phase = PollState::Sampling;
                    }
                }

                let phase = self.state.phase;
                let entitlement = self.state.entitlement.clone();
                self.publish(|p| {
                    p.state = phase;
                    p.entitlement = Some(entitlement);
                    p.consecutive_failures = failures;
                });
                delay
            }
        }
    }

    /// Leaves the registry before publishing `Stopped`, so accessors never see
    /// a stopped entry.
    fn stop_unknown(&self) {
        if let Some(registry) = self.registry.upgrade() {
            remove_if_generation(&registry, &self.id, self.generation);
        }
        mark_stopped(&self.feed, StopReason::UnknownSubscriber);
    }

    fn publish_sample(&mut self, phase: PollState, mut sample: UtilizationSample) {
        if let Some(last) = self.state.last_sampled_at {
            sample.sampled_at = sample.sampled_at.max(last.saturating_add(1));
        }
        self.state.last_sampled_at = Some(sample.sampled_at);
        self.state.phase = phase;

        let entitlement = self.state.entitlement.clone();
        let failures = self.state.consecutive_failures;
        self.publish(|p| {
            p.state = phase;
            p.entitlement = Some(entitlement);
            p.sample = Some(sample);
            p.consecutive_failures = failures;
        });
    }

    /// Applies `update` unless the subscriber was already stopped.
    fn publish(&self, update: impl FnOnce(&mut Published)) {
        self.feed.send_if_modified(|published| {
            if published.state == PollState::Stopped {
                return false;
            }
            update(published);
            true
        });
    }
}
