//! Subscriber → policy join producing a bandwidth entitlement.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tracing::debug;

use crate::rate_limit::{self, RateLimit};
use crate::record_store::{now_millis, RecordStore, StoreError, SubscriberId};

/// Resolved bandwidth ceilings for one subscriber.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Entitlement {
    /// Subscriber the ceilings belong to.
    pub subscriber_id: SubscriberId,
    /// Policy the ceilings came from, when one was found.
    pub policy_name: Option<String>,
    /// Downlink ceiling in Mbps; 0 means unlimited or unknown.
    pub downlink_ceiling_mbps: u64,
    /// Uplink ceiling in Mbps; 0 means unlimited or unknown.
    pub uplink_ceiling_mbps: u64,
    /// When the entitlement was computed, in Unix milliseconds.
    pub resolved_at: u64,
}

impl Entitlement {
    /// Entitlement with both ceilings unknown.
    pub fn unknown(subscriber_id: SubscriberId) -> Self {
        Self {
            subscriber_id,
            policy_name: None,
            downlink_ceiling_mbps: 0,
            uplink_ceiling_mbps: 0,
            resolved_at: now_millis(),
        }
    }

    /// Larger of the two ceilings.
    #[must_use]
    pub fn peak_ceiling(&self) -> u64 {
        self.downlink_ceiling_mbps.max(self.uplink_ceiling_mbps)
    }

    /// Whether the entitlement carries no usable ceiling.
    #[must_use]
    pub fn is_unknown(&self) -> bool {
        self.peak_ceiling() == 0
    }
}

/// Why an entitlement could not be resolved.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ResolveError {
    /// No subscriber record carries this identifier.
    #[error("subscriber {0} not found")]
    NotFound(SubscriberId),

    /// The subscriber has no policy, or the policy does not exist.
    #[error("no policy resolvable for subscriber {0}")]
    PolicyUnresolved(SubscriberId),

    /// The record store failed or timed out.
    #[error("backend unavailable: {0}")]
    BackendUnavailable(#[source] StoreError),
}

/// Joins subscriber records with policy records through a [`RecordStore`].
#[derive(Clone)]
pub struct EntitlementResolver {
    store: Arc<dyn RecordStore>,
    call_timeout: Duration,
}

impl EntitlementResolver {
    /// Creates a resolver bounding every store call by `call_timeout`.
    pub fn new(store: Arc<dyn RecordStore>, call_timeout: Duration) -> Self {
        Self {
            store,
            call_timeout,
        }
    }

    /// Resolves the entitlement for `id`.
    ///
    /// Idempotent: repeated calls against an unchanged store yield the same
    /// ceilings, differing only in `resolved_at`.
    ///
    /// # Errors
    ///
    /// [`ResolveError::NotFound`] when `id` has no record,
    /// [`ResolveError::PolicyUnresolved`] when no policy applies, and
    /// [`ResolveError::BackendUnavailable`] on store failure or timeout.
    pub async fn resolve(&self, id: &SubscriberId) -> Result<Entitlement, ResolveError> {
        let subscribers = bounded(self.call_timeout, self.store.list_subscriber_records())
            .await
            .map_err(ResolveError::BackendUnavailable)?;

        // Linear scan over the full listing
        let record = subscribers
            .into_iter()
            .find(|r| &r.id == id)
            .ok_or_else(|| ResolveError::NotFound(id.clone()))?;

        let policy_name = match record.policy_name {
            Some(name) if !name.is_empty() => name,
            _ => return Err(ResolveError::PolicyUnresolved(id.clone())),
        };

        let policies = bounded(self.call_timeout, self.store.list_policy_records(&policy_name))
            .await
            .map_err(ResolveError::BackendUnavailable)?;

        let policy = policies
            .into_iter()
            .next()
            .ok_or_else(|| ResolveError::PolicyUnresolved(id.clone()))?;

        let RateLimit { downlink, uplink } = rate_limit::parse(policy.rate_limit_raw.as_deref());
        debug!(
            subscriber = %id,
            policy = %policy_name,
            raw = policy.rate_limit_raw.as_deref().unwrap_or(""),
            downlink,
            uplink,
            "Resolved entitlement"
        );

        Ok(Entitlement {
            subscriber_id: id.clone(),
            policy_name: Some(policy_name),
            downlink_ceiling_mbps: downlink,
            uplink_ceiling_mbps: uplink,
            resolved_at: now_millis(),
        })
    }
}

/// Runs a store call under a time bound, folding expiry into
/// [`StoreError::Timeout`].
pub(crate) async fn bounded<T, F>(limit: Duration, call: F) -> Result<T, StoreError>
where
    F: std::future::Future<Output = Result<T, StoreError>>,
{
    tokio::time::timeout(limit, call)
        .await
        .unwrap_or(Err(StoreError::Timeout))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record_store::InMemoryRecordStore;

    fn resolver(store: InMemoryRecordStore) -> EntitlementResolver {
        EntitlementResolver::new(Arc::new(store), Duration::from_secs(1))
    }

    fn populated() -> InMemoryRecordStore {
        let store = InMemoryRecordStore::new();
        store.upsert_subscriber("alice", Some("gold"));
        store.upsert_subscriber("carol", Some(""));
        store.upsert_subscriber("erin", None);
        store.upsert_subscriber("frank", Some("platinum"));
        store.upsert_policy("gold", Some("50000000/20000000"));
        store
    }

    #[tokio::test]
    async fn test_resolve_joins_policy() {
        let entitlement = resolver(populated())
            .resolve(&SubscriberId::new("alice"))
            .await
            .unwrap();
        assert_eq!(entitlement.downlink_ceiling_mbps, 50_000_000);
        assert_eq!(entitlement.uplink_ceiling_mbps, 20_000_000);
        assert_eq!(entitlement.policy_name.as_deref(), Some("gold"));
        assert_eq!(entitlement.peak_ceiling(), 50_000_000);
    }

    #[tokio::test]
    async fn test_resolve_unknown_subscriber() {
        let bob = SubscriberId::new("bob");
        assert_eq!(
            resolver(populated()).resolve(&bob).await,
            Err(ResolveError::NotFound(bob))
        );
    }

    #[tokio::test]
    async fn test_resolve_is_case_sensitive() {
        let alice = SubscriberId::new("Alice");
        assert_eq!(
            resolver(populated()).resolve(&alice).await,
            Err(ResolveError::NotFound(alice))
        );
    }

    #[tokio::test]
    async fn test_resolve_empty_or_missing_policy_name() {
        let resolver = resolver(populated());
        for name in ["carol", "erin"] {
            let id = SubscriberId::new(name);
            assert_eq!(
                resolver.resolve(&id).await,
                Err(ResolveError::PolicyUnresolved(id))
            );
        }
    }

    #[tokio::test]
    async fn test_resolve_dangling_policy() {
        let frank = SubscriberId::new("frank");
        assert_eq!(
            resolver(populated()).resolve(&frank).await,
            Err(ResolveError::PolicyUnresolved(frank))
        );
    }

    #[tokio::test]
    async fn test_resolve_is_idempotent() {
        let resolver = resolver(populated());
        let alice = SubscriberId::new("alice");
        let first = resolver.resolve(&alice).await.unwrap();
        let second = resolver.resolve(&alice).await.unwrap();
        assert_eq!(
            Entitlement {
                resolved_at: 0,
                ..first
            },
            Entitlement {
                resolved_at: 0,
                ..second
            }
        );
    }

    #[tokio::test]
    async fn test_resolve_malformed_rate_limit_is_zero() {
        let store = populated();
        store.upsert_policy("gold", Some("unlimited"));
        let entitlement = resolver(store)
            .resolve(&SubscriberId::new("alice"))
            .await
            .unwrap();
        assert!(entitlement.is_unknown());
    }

    #[tokio::test(start_paused = true)]
    async fn test_bounded_times_out() {
        let result: Result<(), StoreError> = bounded(Duration::from_millis(10), async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        })
        .await;
        assert_eq!(result, Err(StoreError::Timeout));
    }
}
