//! Live session counter sampling.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::trace;

use crate::entitlement::bounded;
use crate::record_store::{CounterSample, RecordStore, StoreError, SubscriberId};

/// Why a counter sample could not be taken.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SampleError {
    /// The subscriber has no active session.
    #[error("no active session for subscriber {0}")]
    NotFound(SubscriberId),

    /// The record store failed or timed out.
    #[error("backend unavailable: {0}")]
    BackendUnavailable(#[source] StoreError),
}

/// Reads a subscriber's session counters through a [`RecordStore`].
#[derive(Clone)]
pub struct CounterSampler {
    store: Arc<dyn RecordStore>,
    call_timeout: Duration,
}

impl CounterSampler {
    pub fn new(store: Arc<dyn RecordStore>, call_timeout: Duration) -> Self {
        Self {
            store,
            call_timeout,
        }
    }

    /// Sample the active session of `id`. A missing session is `NotFound`,
    /// anything else the store reports (including timeouts) is
    /// `BackendUnavailable`.
    pub async fn sample(&self, id: &SubscriberId) -> Result<CounterSample, SampleError> {
        match bounded(self.call_timeout, self.store.sample_counters(id)).await {
            Ok(sample) => {
                trace!(
                    subscriber = %id,
                    rx = sample.rx_bytes_total,
                    tx = sample.tx_bytes_total,
                    "Sampled counters"
                );
                Ok(sample)
            }
            Err(StoreError::SessionNotFound(_)) => Err(SampleError::NotFound(id.clone())),
            Err(e) => Err(SampleError::BackendUnavailable(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;
    use crate::record_store::{InMemoryRecordStore, PolicyRecord, SubscriberRecord};

    /// Store whose counter reads never complete.
    struct HangingStore;

    #[async_trait]
    impl RecordStore for HangingStore {
        async fn list_subscriber_records(&self) -> Result<Vec<SubscriberRecord>, StoreError> {
            Ok(Vec::new())
        }

        async fn list_policy_records(&self, _: &str) -> Result<Vec<PolicyRecord>, StoreError> {
            Ok(Vec::new())
        }

        async fn sample_counters(&self, _: &SubscriberId) -> Result<CounterSample, StoreError> {
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn test_sample_active_session() {
        let store = InMemoryRecordStore::new();
        store.set_session("alice", 100, 200);
        let sampler = CounterSampler::new(Arc::new(store), Duration::from_secs(1));
        let sample = sampler.sample(&SubscriberId::new("alice")).await.unwrap();
        assert_eq!(sample.rx_bytes_total, 100);
        assert_eq!(sample.tx_bytes_total, 200);
    }

    #[tokio::test]
    async fn test_sample_no_session_is_not_found() {
        let store = Arc::new(InMemoryRecordStore::new());
        let sampler = CounterSampler::new(store, Duration::from_secs(1));
        let bob = SubscriberId::new("bob");
        assert_eq!(sampler.sample(&bob).await, Err(SampleError::NotFound(bob)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sample_timeout_is_backend_unavailable() {
        let sampler = CounterSampler::new(Arc::new(HangingStore), Duration::from_millis(50));
        assert_eq!(
            sampler.sample(&SubscriberId::new("alice")).await,
            Err(SampleError::BackendUnavailable(StoreError::Timeout))
        );
    }
}
