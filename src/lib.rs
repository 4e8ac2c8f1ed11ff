//! Subscriber bandwidth entitlement resolution and live utilization polling.
//!
//! Given a subscriber identifier, the crate resolves the subscriber's
//! rate-limit policy from a router management backend ([`RecordStore`]),
//! normalizes the policy's rate-limit string into per-direction ceilings, and
//! runs a per-subscriber poll loop that turns raw session byte counters into
//! Mbps and percent-of-ceiling readings.

pub mod backoff;
pub mod config;
pub mod constants;
pub mod entitlement;
pub mod payload;
pub mod poll_loop;
pub mod rate_limit;
pub mod record_store;
pub mod sampler;
pub mod utilization;

pub use config::{ConfigError, PollConfig};
pub use entitlement::{Entitlement, EntitlementResolver, ResolveError};
pub use poll_loop::{FeedError, PollError, PollLoop, PollState, Published, StopReason};
pub use rate_limit::RateLimit;
pub use record_store::{
    CounterSample, InMemoryRecordStore, PolicyRecord, RecordStore, SnapshotFileStore,
    StoreError, SubscriberId, SubscriberRecord,
};
pub use sampler::{CounterSampler, SampleError};
pub use utilization::{UtilizationSample, UtilizationTracker};
