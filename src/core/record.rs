//! The user trial record as owned by the remote store, plus the partial
//! updates this crate is allowed to write back.

use super::error::{Result, TrialError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Stable identity of a signed-in user.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for UserId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for UserId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Billing tier of the account.
///
/// Tiers this crate does not recognise decode as `Unknown` and grant nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionTier {
    #[default]
    Free,
    Premium,
    Family,
    #[serde(other)]
    Unknown,
}

impl SubscriptionTier {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "free" | "" => Self::Free,
            "premium" => Self::Premium,
            "family" => Self::Family,
            _ => Self::Unknown,
        }
    }

    pub fn is_paid(&self) -> bool {
        matches!(self, Self::Premium | Self::Family)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Free => "free",
            Self::Premium => "premium",
            Self::Family => "family",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for SubscriptionTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserTrialRecord {
    #[serde(default)]
    pub trial_start: Option<DateTime<Utc>>,
    #[serde(default)]
    pub trial_expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub trial_used: bool,
    #[serde(default)]
    pub trial_grace_used: bool,
    #[serde(default)]
    pub subscription_tier: SubscriptionTier,
}

impl UserTrialRecord {
    /// A free-tier record with a trial window `[start, expires_at)`.
    pub fn with_window(start: DateTime<Utc>, expires_at: DateTime<Utc>) -> Self {
        Self {
            trial_start: Some(start),
            trial_expires_at: Some(expires_at),
            ..Self::default()
        }
    }

    pub fn tier(mut self, tier: SubscriptionTier) -> Self {
        self.subscription_tier = tier;
        self
    }

    /// Decodes a stored document.
    ///
    /// Missing or `null` fields take their defaults. Timestamps may be RFC 3339
    /// strings or epoch milliseconds. Any field of the wrong shape yields
    /// `TrialError::MalformedRecord`.
    pub fn from_document(user_id: &UserId, doc: &Value) -> Result<Self> {
        let fields = doc
            .as_object()
            .ok_or_else(|| TrialError::malformed(user_id.as_str(), "document is not an object"))?;

        Ok(Self {
            trial_start: timestamp_field(user_id, fields, "trial_start")?,
            trial_expires_at: timestamp_field(user_id, fields, "trial_expires_at")?,
            trial_used: bool_field(user_id, fields, "trial_used")?,
            trial_grace_used: bool_field(user_id, fields, "trial_grace_used")?,
            subscription_tier: match fields.get("subscription_tier") {
                None | Some(Value::Null) => SubscriptionTier::Free,
                Some(Value::String(raw)) => SubscriptionTier::parse(raw),
                Some(other) => {
                    return Err(TrialError::malformed(
                        user_id.as_str(),
                        format!("subscription_tier has unexpected value {}", other),
                    ));
                }
            },
        })
    }

    pub fn to_document(&self) -> Result<Value> {
        Ok(serde_json::to_value(self)?)
    }

    pub fn apply_patch(&mut self, patch: &TrialRecordPatch) {
        if let Some(start) = patch.trial_start {
            self.trial_start = Some(start);
        }
        if let Some(expires_at) = patch.trial_expires_at {
            self.trial_expires_at = Some(expires_at);
        }
        if let Some(used) = patch.trial_used {
            self.trial_used = used;
        }
        if let Some(grace_used) = patch.trial_grace_used {
            self.trial_grace_used = grace_used;
        }
    }
}

fn timestamp_field(
    user_id: &UserId,
    fields: &Map<String, Value>,
    name: &str,
) -> Result<Option<DateTime<Utc>>> {
    match fields.get(name) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(raw)) => DateTime::parse_from_rfc3339(raw)
            .map(|ts| Some(ts.with_timezone(&Utc)))
            .map_err(|err| {
                TrialError::malformed(user_id.as_str(), format!("{} '{}': {}", name, raw, err))
            }),
        Some(Value::Number(n)) => n
            .as_i64()
            .and_then(DateTime::from_timestamp_millis)
            .map(Some)
            .ok_or_else(|| {
                TrialError::malformed(user_id.as_str(), format!("{} is out of range: {}", name, n))
            }),
        Some(other) => Err(TrialError::malformed(
            user_id.as_str(),
            format!("{} has unexpected value {}", name, other),
        )),
    }
}

fn bool_field(user_id: &UserId, fields: &Map<String, Value>, name: &str) -> Result<bool> {
    match fields.get(name) {
        None | Some(Value::Null) => Ok(false),
        Some(Value::Bool(flag)) => Ok(*flag),
        Some(other) => Err(TrialError::malformed(
            user_id.as_str(),
            format!("{} has unexpected value {}", name, other),
        )),
    }
}

/// Partial update of a `UserTrialRecord`. Unset fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrialRecordPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trial_start: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trial_expires_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trial_used: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trial_grace_used: Option<bool>,
}

impl TrialRecordPatch {
    pub fn mark_trial_used() -> Self {
        Self {
            trial_used: Some(true),
            ..Self::default()
        }
    }

    pub fn mark_grace_used() -> Self {
        Self {
            trial_grace_used: Some(true),
            ..Self::default()
        }
    }

    /// A brand new trial window with both usage flags cleared.
    pub fn fresh_window(start: DateTime<Utc>, expires_at: DateTime<Utc>) -> Self {
        Self {
            trial_start: Some(start),
            trial_expires_at: Some(expires_at),
            trial_used: Some(false),
            trial_grace_used: Some(false),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.trial_start.is_none()
            && self.trial_expires_at.is_none()
            && self.trial_used.is_none()
            && self.trial_grace_used.is_none()
    }

    /// Folds `other` into `self`; fields set in `other` win.
    pub fn merge(&mut self, other: &TrialRecordPatch) {
        if other.trial_start.is_some() {
            self.trial_start = other.trial_start;
        }
        if other.trial_expires_at.is_some() {
            self.trial_expires_at = other.trial_expires_at;
        }
        if other.trial_used.is_some() {
            self.trial_used = other.trial_used;
        }
        if other.trial_grace_used.is_some() {
            self.trial_grace_used = other.trial_grace_used;
        }
    }
}
