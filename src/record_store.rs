//! Router management backend capability.
//!
//! The core never talks to the router directly. It calls into a
//! [`RecordStore`], which is injected as `Arc<dyn RecordStore>` and shared by
//! every subscriber's poll task. Implementations must accept concurrent calls.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::Instant;

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
}

/// Opaque subscriber identifier (the account name on the router).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubscriberId(String);

impl SubscriberId {
    /// Wraps an identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SubscriberId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// A subscriber account and the policy it is bound to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriberRecord {
    /// Subscriber identifier.
    #[serde(rename = "name")]
    pub id: SubscriberId,
    /// Policy (profile) name, if any.
    #[serde(rename = "profile", default)]
    pub policy_name: Option<String>,
}

/// A named policy and its raw rate-limit encoding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyRecord {
    /// Policy name.
    #[serde(rename = "name")]
    pub policy_name: String,
    /// Unstructured rate-limit string (e.g. "10M/20M").
    #[serde(rename = "rate_limit", default)]
    pub rate_limit_raw: Option<String>,
}

/// Raw byte counters for a subscriber's active session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CounterSample {
    /// Subscriber whose session was read.
    pub subscriber_id: SubscriberId,
    /// Total bytes received in this session.
    pub rx_bytes_total: u64,
    /// Total bytes transmitted in this session.
    pub tx_bytes_total: u64,
    /// When the counters were read, in Unix milliseconds.
    pub sampled_at: u64,
}

/// Errors a [`RecordStore`] call can produce.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum StoreError {
    /// The backend could not be reached or answered garbage.
    #[error("record store unavailable: {0}")]
    Unavailable(String),

    /// The call did not complete within its time bound.
    #[error("record store call timed out")]
    Timeout,

    /// The subscriber has no active session to sample.
    #[error("no active session for subscriber {0}")]
    SessionNotFound(SubscriberId),
}

/// Record queries the polling core needs from the router management backend.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Lists every subscriber record.
    async fn list_subscriber_records(&self) -> Result<Vec<SubscriberRecord>, StoreError>;

    /// Lists policy records whose name equals `filter_name` exactly.
    async fn list_policy_records(&self, filter_name: &str)
        -> Result<Vec<PolicyRecord>, StoreError>;

    /// Reads the live counters of the subscriber's active session.
    async fn sample_counters(&self, id: &SubscriberId) -> Result<CounterSample, StoreError>;
}

/// Live session counters as held by [`InMemoryRecordStore`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionCounters {
    /// Bytes received.
    pub rx: u64,
    /// Bytes transmitted.
    pub tx: u64,
}

#[derive(Default)]
struct Tables {
    subscribers: Vec<SubscriberRecord>,
    policies: Vec<PolicyRecord>,
    sessions: HashMap<SubscriberId, SessionCounters>,
}

/// Record store backed by in-process tables.
///
/// Sample timestamps follow the tokio clock, so a paused runtime yields
/// deterministic rates.
pub struct InMemoryRecordStore {
    tables: RwLock<Tables>,
    origin_millis: u64,
    origin: Instant,
}

impl Default for InMemoryRecordStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryRecordStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(Tables::default()),
            origin_millis: now_millis(),
            origin: Instant::now(),
        }
    }

    fn clock_millis(&self) -> u64 {
        let since = u64::try_from(self.origin.elapsed().as_millis()).unwrap_or(u64::MAX);
        self.origin_millis.saturating_add(since)
    }

    /// Inserts or replaces a subscriber record.
    pub fn upsert_subscriber(&self, id: impl Into<SubscriberId>, policy_name: Option<&str>) {
        let id = id.into();
        let record = SubscriberRecord {
            id: id.clone(),
            policy_name: policy_name.map(str::to_string),
        };
        let mut tables = self.tables.write();
        match tables.subscribers.iter_mut().find(|r| r.id == id) {
            Some(existing) => *existing = record,
            None => tables.subscribers.push(record),
        }
    }

    /// Inserts or replaces a policy record.
    pub fn upsert_policy(&self, policy_name: &str, rate_limit_raw: Option<&str>) {
        let record = PolicyRecord {
            policy_name: policy_name.to_string(),
            rate_limit_raw: rate_limit_raw.map(str::to_string),
        };
        let mut tables = self.tables.write();
        match tables
            .policies
            .iter_mut()
            .find(|r| r.policy_name == policy_name)
        {
            Some(existing) => *existing = record,
            None => tables.policies.push(record),
        }
    }

    /// Deletes a subscriber record along with any active session.
    pub fn remove_subscriber(&self, id: &SubscriberId) {
        let mut tables = self.tables.write();
        tables.subscribers.retain(|r| &r.id != id);
        tables.sessions.remove(id);
    }

    /// Starts or updates a subscriber's active session.
    pub fn set_session(&self, id: impl Into<SubscriberId>, rx: u64, tx: u64) {
        self.tables
            .write()
            .sessions
            .insert(id.into(), SessionCounters { rx, tx });
    }

    /// Ends a subscriber's active session.
    pub fn end_session(&self, id: &SubscriberId) {
        self.tables.write().sessions.remove(id);
    }
}

#[async_trait]
impl RecordStore for InMemoryRecordStore {
    async fn list_subscriber_records(&self) -> Result<Vec<SubscriberRecord>, StoreError> {
        Ok(self.tables.read().subscribers.clone())
    }

    async fn list_policy_records(
        &self,
        filter_name: &str,
    ) -> Result<Vec<PolicyRecord>, StoreError> {
        Ok(self
            .tables
            .read()
            .policies
            .iter()
            .filter(|p| p.policy_name == filter_name)
            .cloned()
            .collect())
    }

    async fn sample_counters(&self, id: &SubscriberId) -> Result<CounterSample, StoreError> {
        let counters = self
            .tables
            .read()
            .sessions
            .get(id)
            .copied()
            .ok_or_else(|| StoreError::SessionNotFound(id.clone()))?;
        Ok(CounterSample {
            subscriber_id: id.clone(),
            rx_bytes_total: counters.rx,
            tx_bytes_total: counters.tx,
            sampled_at: self.clock_millis(),
        })
    }
}

/// One row of the active-session table in a snapshot file.
#[derive(Debug, Clone, Deserialize)]
struct SessionRow {
    name: SubscriberId,
    #[serde(default)]
    rx_bytes: u64,
    #[serde(default)]
    tx_bytes: u64,
}

/// On-disk layout of a router snapshot.
#[derive(Debug, Clone, Default, Deserialize)]
struct Snapshot {
    #[serde(default)]
    subscribers: Vec<SubscriberRecord>,
    #[serde(default)]
    profiles: Vec<PolicyRecord>,
    #[serde(default)]
    sessions: Vec<SessionRow>,
}

/// Record store that re-reads a JSON router snapshot on every call.
///
/// An external exporter keeps the file current. A missing or unparsable file
/// is reported as [`StoreError::Unavailable`], the same as an unreachable
/// router.
pub struct SnapshotFileStore {
    path: PathBuf,
}

impl SnapshotFileStore {
    /// Creates a store reading from `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    async fn load(&self) -> Result<Snapshot, StoreError> {
        let bytes = tokio::fs::read(&self.path).await.map_err(|e| {
            StoreError::Unavailable(format!("reading {}: {e}", self.path.display()))
        })?;
        serde_json::from_slice(&bytes).map_err(|e| {
            StoreError::Unavailable(format!("parsing {}: {e}", self.path.display()))
        })
    }
}

#[async_trait]
impl RecordStore for SnapshotFileStore {
    async fn list_subscriber_records(&self) -> Result<Vec<SubscriberRecord>, StoreError> {
        Ok(self.load().await?.subscribers)
    }

    async fn list_policy_records(
        &self,
        filter_name: &str,
    ) -> Result<Vec<PolicyRecord>, StoreError> {
        let mut profiles = self.load().await?.profiles;
        profiles.retain(|p| p.policy_name == filter_name);
        Ok(profiles)
    }

    async fn sample_counters(&self, id: &SubscriberId) -> Result<CounterSample, StoreError> {
        let snapshot = self.load().await?;
        let session = snapshot
            .sessions
            .into_iter()
            .find(|s| &s.name == id)
            .ok_or_else(|| StoreError::SessionNotFound(id.clone()))?;
        Ok(CounterSample {
            subscriber_id: session.name,
            rx_bytes_total: session.rx_bytes,
            tx_bytes_total: session.tx_bytes,
            sampled_at: now_millis(),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    const SNAPSHOT: &str = r#"{
        "subscribers": [
            {"name": "alice", "profile": "gold"},
            {"name": "carol", "profile": ""},
            {"name": "erin"}
        ],
        "profiles": [
            {"name": "gold", "rate_limit": "50000000/20000000"},
            {"name": "silver", "rate_limit": "10M/10M"}
        ],
        "sessions": [
            {"name": "alice", "rx_bytes": 1000, "tx_bytes": 2000}
        ]
    }"#;

    fn snapshot_file(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[tokio::test]
    async fn test_in_memory_upsert_replaces() {
        let store = InMemoryRecordStore::new();
        store.upsert_subscriber("alice", Some("gold"));
        store.upsert_subscriber("alice", Some("silver"));
        let records = store.list_subscriber_records().await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].policy_name.as_deref(), Some("silver"));
    }

    #[tokio::test]
    async fn test_in_memory_policy_filter_is_exact() {
        let store = InMemoryRecordStore::new();
        store.upsert_policy("gold", Some("10/10"));
        store.upsert_policy("Gold", Some("20/20"));
        let policies = store.list_policy_records("gold").await.unwrap();
        assert_eq!(policies.len(), 1);
        assert_eq!(policies[0].rate_limit_raw.as_deref(), Some("10/10"));
    }

    #[tokio::test]
    async fn test_in_memory_session_lifecycle() {
        let store = InMemoryRecordStore::new();
        let id = SubscriberId::new("alice");
        store.set_session("alice", 10, 20);
        let sample = store.sample_counters(&id).await.unwrap();
        assert_eq!(sample.subscriber_id, id);
        assert_eq!(sample.rx_bytes_total, 10);
        assert_eq!(sample.tx_bytes_total, 20);

        store.end_session(&id);
        assert_eq!(
            store.sample_counters(&id).await,
            Err(StoreError::SessionNotFound(id))
        );
    }

    #[tokio::test]
    async fn test_in_memory_remove_subscriber_drops_session() {
        let store = InMemoryRecordStore::new();
        let alice = SubscriberId::new("alice");
        store.upsert_subscriber("alice", Some("gold"));
        store.upsert_subscriber("bob", Some("gold"));
        store.set_session("alice", 10, 20);

        store.remove_subscriber(&alice);
        let records = store.list_subscriber_records().await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].id, SubscriberId::new("bob"));
        assert_eq!(
            store.sample_counters(&alice).await,
            Err(StoreError::SessionNotFound(alice))
        );
    }

    #[tokio::test]
    async fn test_snapshot_store_reads_tables() {
        let file = snapshot_file(SNAPSHOT);
        let store = SnapshotFileStore::new(file.path());

        let subscribers = store.list_subscriber_records().await.unwrap();
        assert_eq!(subscribers.len(), 3);
        assert_eq!(subscribers[2].policy_name, None);

        let gold = store.list_policy_records("gold").await.unwrap();
        assert_eq!(gold.len(), 1);
        assert_eq!(gold[0].rate_limit_raw.as_deref(), Some("50000000/20000000"));

        let sample = store
            .sample_counters(&SubscriberId::new("alice"))
            .await
            .unwrap();
        assert_eq!(sample.rx_bytes_total, 1000);
        assert_eq!(sample.tx_bytes_total, 2000);
    }

    #[tokio::test]
    async fn test_snapshot_store_missing_session() {
        let file = snapshot_file(SNAPSHOT);
        let store = SnapshotFileStore::new(file.path());
        let carol = SubscriberId::new("carol");
        assert_eq!(
            store.sample_counters(&carol).await,
            Err(StoreError::SessionNotFound(carol))
        );
    }

    #[tokio::test]
    async fn test_snapshot_store_unreadable_is_unavailable() {
        let store = SnapshotFileStore::new("/nonexistent/router-snapshot.json");
        assert!(matches!(
            store.list_subscriber_records().await,
            Err(StoreError::Unavailable(_))
        ));

        let file = snapshot_file("{ not json");
        let store = SnapshotFileStore::new(file.path());
        assert!(matches!(
            store.list_policy_records("gold").await,
            Err(StoreError::Unavailable(_))
        ));
    }
}
