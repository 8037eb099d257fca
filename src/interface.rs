use crate::core::{Result, TrialRecordPatch, UserId, UserTrialRecord};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;

/// Live feed of a single user's record.
///
/// `Ok(None)` means the store has no record for the user. An `Err` is a
/// transient condition unless it is `TrialError::MalformedRecord`.
pub type RecordFeed = BoxStream<'static, Result<Option<UserTrialRecord>>>;

/// Read side of the remote record store.
///
/// Implement this over whatever backend owns user profiles. `InMemoryRecordStore`
/// covers tests and local tooling.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Current record, if any.
    async fn get(&self, user_id: &UserId) -> Result<Option<UserTrialRecord>>;

    /// Open a change feed. The first item is the current record.
    async fn watch(&self, user_id: &UserId) -> Result<RecordFeed>;
}

/// Write side of the remote record store.
#[async_trait]
pub trait RecordWriter: Send + Sync {
    /// Apply a partial update. Fields not set in `patch` are left untouched.
    async fn update(&self, user_id: &UserId, patch: &TrialRecordPatch) -> Result<()>;
}

/// Per-origin key-value storage backing the event ledger.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn set(&self, key: &str, value: &str) -> Result<()>;

    async fn remove(&self, key: &str) -> Result<()>;
}

/// Analytics calls. Fire-and-forget: implementations must not block and own
/// their own delivery and retries.
pub trait AnalyticsSink: Send + Sync {
    fn track_trial_start(&self, user_id: &UserId, trial_start: DateTime<Utc>);

    fn track_trial_day(&self, user_id: &UserId, day_index: u32, days_remaining: u32);

    fn track_trial_expired(&self, user_id: &UserId);

    fn track_trial_grace_lock(&self, user_id: &UserId);
}

/// User-facing notification calls. Same delivery contract as `AnalyticsSink`.
pub trait NotificationSink: Send + Sync {
    fn create_day6_notification(&self, user_id: &UserId);

    fn create_trial_expired_notification(&self, user_id: &UserId);

    fn create_grace_day_notification(&self, user_id: &UserId);
}
