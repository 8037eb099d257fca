//! Per-user record of which one-time lifecycle events already fired.
//!
//! The ledger is stored as a flat JSON object:
//!
//! ```text
//! {"trial_start_timestamp": "...", "trial_start": true, "day_0": true, ..., "notif_grace": true}
//! ```
//!
//! It is tied to one trial window through `trial_start_timestamp`; a record
//! whose `trial_start` differs gets a fresh ledger (see [`EventLedger::reconcile`]).

pub mod store;

pub use store::{FileLedgerStore, InMemoryLedgerStore};

use crate::config::TrialConfig;
use crate::core::{Result, TrialError, UserId};
use crate::interface::LedgerStore;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tracing::warn;

const TIMESTAMP_KEY: &str = "trial_start_timestamp";

/// One-time event flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum LedgerFlag {
    TrialStart,
    /// Daily check-in for the zero-based trial day.
    Day(u32),
    /// Last-day warning notification (`trial_days_remaining == 1`).
    FinalDayNotice,
    TrialExpired,
    ExpiredNotice,
    GraceLock,
    GraceNotice,
}

impl LedgerFlag {
    pub fn key(&self) -> String {
        match self {
            Self::TrialStart => "trial_start".to_string(),
            Self::Day(index) => format!("day_{}", index),
            Self::FinalDayNotice => "notif_day6".to_string(),
            Self::TrialExpired => "trial_expired".to_string(),
            Self::ExpiredNotice => "notif_expired".to_string(),
            Self::GraceLock => "grace_lock".to_string(),
            Self::GraceNotice => "notif_grace".to_string(),
        }
    }
}

impl fmt::Display for LedgerFlag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventLedger {
    trial_start_timestamp: Option<DateTime<Utc>>,
    flags: BTreeMap<String, Value>,
}

impl EventLedger {
    /// Empty ledger bound to the trial that started at `trial_start`.
    pub fn for_trial(trial_start: DateTime<Utc>) -> Self {
        Self {
            trial_start_timestamp: Some(trial_start),
            flags: BTreeMap::new(),
        }
    }

    pub fn trial_start_timestamp(&self) -> Option<DateTime<Utc>> {
        self.trial_start_timestamp
    }

    pub fn is_empty(&self) -> bool {
        self.trial_start_timestamp.is_none() && self.flags.is_empty()
    }

    pub fn is_set(&self, flag: LedgerFlag) -> bool {
        self.flags.get(&flag.key()).is_some_and(is_truthy)
    }

    pub fn set(&mut self, flag: LedgerFlag) {
        self.flags.insert(flag.key(), Value::Bool(true));
    }

    /// Keys of all truthy flags, in key order.
    pub fn set_flags(&self) -> Vec<&str> {
        self.flags
            .iter()
            .filter(|(_, value)| is_truthy(value))
            .map(|(key, _)| key.as_str())
            .collect()
    }

    /// Restart detection.
    ///
    /// Returns the ledger to evaluate against `trial_start` and whether it was
    /// rebuilt. A ledger whose timestamp differs from a non-null `trial_start`
    /// is discarded; a null `trial_start` leaves the ledger untouched.
    pub fn reconcile(self, trial_start: Option<DateTime<Utc>>) -> (Self, bool) {
        match trial_start {
            Some(start) if self.trial_start_timestamp != Some(start) => {
                (Self::for_trial(start), true)
            }
            _ => (self, false),
        }
    }

    pub fn encode(&self) -> Result<String> {
        let mut object = Map::new();
        if let Some(ts) = self.trial_start_timestamp {
            object.insert(TIMESTAMP_KEY.to_string(), Value::String(ts.to_rfc3339()));
        }
        for (key, value) in &self.flags {
            object.insert(key.clone(), value.clone());
        }
        Ok(serde_json::to_string(&Value::Object(object))?)
    }

    /// Parses a stored ledger. The timestamp may be RFC 3339 or epoch millis;
    /// keys this crate does not know are carried along untouched.
    pub fn decode(raw: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(raw)?;
        let Value::Object(mut object) = value else {
            return Err(TrialError::Serialization(
                "ledger is not a JSON object".to_string(),
            ));
        };

        let trial_start_timestamp = match object.remove(TIMESTAMP_KEY) {
            None | Some(Value::Null) => None,
            Some(Value::String(raw)) => Some(
                DateTime::parse_from_rfc3339(&raw)
                    .map_err(|err| {
                        TrialError::Serialization(format!("{} '{}': {}", TIMESTAMP_KEY, raw, err))
                    })?
                    .with_timezone(&Utc),
            ),
            Some(Value::Number(n)) => Some(
                n.as_i64()
                    .and_then(DateTime::from_timestamp_millis)
                    .ok_or_else(|| {
                        TrialError::Serialization(format!("{} out of range: {}", TIMESTAMP_KEY, n))
                    })?,
            ),
            Some(other) => {
                return Err(TrialError::Serialization(format!(
                    "{} has unexpected value {}",
                    TIMESTAMP_KEY, other
                )));
            }
        };

        Ok(Self {
            trial_start_timestamp,
            flags: object.into_iter().collect(),
        })
    }
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Bool(flag) => *flag,
        Value::Number(n) => n.as_f64().is_some_and(|v| v != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
        Value::Null => false,
    }
}

/// Loads and stores ledgers for users under the configured key prefix.
#[derive(Clone)]
pub struct LedgerBook {
    store: Arc<dyn LedgerStore>,
    config: TrialConfig,
}

impl LedgerBook {
    pub fn new(store: Arc<dyn LedgerStore>, config: TrialConfig) -> Self {
        Self { store, config }
    }

    /// Stored ledger, or an empty one when absent or unreadable.
    ///
    /// Store failures are returned; a corrupt payload is logged and treated as
    /// absent.
    pub async fn load(&self, user_id: &UserId) -> Result<EventLedger> {
        let key = self.config.ledger_key(user_id);
        let Some(raw) = self.store.get(&key).await? else {
            return Ok(EventLedger::default());
        };
        match EventLedger::decode(&raw) {
            Ok(ledger) => Ok(ledger),
            Err(err) => {
                warn!(user = %user_id, error = %err, "discarding unreadable event ledger");
                Ok(EventLedger::default())
            }
        }
    }

    pub async fn save(&self, user_id: &UserId, ledger: &EventLedger) -> Result<()> {
        let encoded = ledger.encode()?;
        self.store
            .set(&self.config.ledger_key(user_id), &encoded)
            .await
    }

    pub async fn clear(&self, user_id: &UserId) -> Result<()> {
        self.store.remove(&self.config.ledger_key(user_id)).await
    }
}
