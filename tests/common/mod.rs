//! Scripted record store for poll loop tests.

#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::watch;

use traffic_polling_server::{
    CounterSample, InMemoryRecordStore, PolicyRecord, PollConfig, Published, RecordStore,
    StoreError, SubscriberId, SubscriberRecord,
};

/// In-memory store with failure injection.
#[derive(Default)]
pub struct ScriptedStore {
    pub inner: InMemoryRecordStore,
    /// Fail the next N subscriber listings.
    pub fail_listings: AtomicU32,
    /// Fail every counter read while set.
    pub counters_down: AtomicBool,
    /// Counter reads for these subscribers never complete.
    pub hanging: Mutex<HashSet<SubscriberId>>,
    pub listing_calls: AtomicU32,
    pub counter_calls: Mutex<Vec<SubscriberId>>,
}

impl ScriptedStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn hang(&self, id: &str) {
        self.hanging.lock().insert(SubscriberId::new(id));
    }

    pub fn counter_calls_for(&self, id: &str) -> usize {
        let id = SubscriberId::new(id);
        self.counter_calls.lock().iter().filter(|c| **c == id).count()
    }
}

#[async_trait]
impl RecordStore for ScriptedStore {
    async fn list_subscriber_records(&self) -> Result<Vec<SubscriberRecord>, StoreError> {
        self.listing_calls.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .fail_listings
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(StoreError::Unavailable("router unreachable".to_string()));
        }
        self.inner.list_subscriber_records().await
    }

    async fn list_policy_records(
        &self,
        filter_name: &str,
    ) -> Result<Vec<PolicyRecord>, StoreError> {
        self.inner.list_policy_records(filter_name).await
    }

    async fn sample_counters(&self, id: &SubscriberId) -> Result<CounterSample, StoreError> {
        self.counter_calls.lock().push(id.clone());
        let hanging = self.hanging.lock().contains(id);
        if hanging {
            std::future::pending::<()>().await;
        }
        if self.counters_down.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("router unreachable".to_string()));
        }
        self.inner.sample_counters(id).await
    }
}

/// One-second cadence, half-second call timeout, default thresholds.
pub fn test_config() -> PollConfig {
    PollConfig::new()
        .with_poll_interval(Duration::from_secs(1))
        .with_call_timeout(Duration::from_millis(500))
}

/// Waits for the next publication and returns it.
pub async fn next_published(rx: &mut watch::Receiver<Published>) -> Published {
    rx.changed().await.expect("feed closed");
    rx.borrow_and_update().clone()
}
