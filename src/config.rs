use crate::core::{Result, TrialError, UserId};
use chrono::Duration as ChronoDuration;
use std::time::Duration;

pub const ENV_TOTAL_DAYS: &str = "TRIAL_TOTAL_DAYS";
pub const ENV_GRACE_OFFSET_DAYS: &str = "TRIAL_GRACE_OFFSET_DAYS";
pub const ENV_LEDGER_PREFIX: &str = "TRIAL_LEDGER_PREFIX";
pub const ENV_REFRESH_SECS: &str = "TRIAL_REFRESH_SECS";

/// Trial entitlement configuration
///
/// Shared by the derivation functions, the dispatcher and the watcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrialConfig {
    /// Length of the trial window in days
    pub total_trial_days: u32,

    /// Whole days after expiry at which the single grace day falls
    pub grace_offset_days: i64,

    /// Prefix of the per-user key in the ledger store
    pub ledger_key_prefix: String,

    /// Re-evaluate the last record on this cadence (None disables the timer)
    pub refresh_interval: Option<Duration>,
}

impl TrialConfig {
    /// Create a configuration with the reference trial length of 7 days
    pub fn new() -> Self {
        Self {
            total_trial_days: 7,
            grace_offset_days: 1,
            ledger_key_prefix: "trial_events_".to_string(),
            refresh_interval: None,
        }
    }

    /// Set the trial length
    pub fn total_trial_days(mut self, days: u32) -> Self {
        self.total_trial_days = days;
        self
    }

    /// Set the grace day offset
    pub fn grace_offset_days(mut self, days: i64) -> Self {
        self.grace_offset_days = days;
        self
    }

    /// Set the ledger key prefix
    pub fn ledger_key_prefix(mut self, prefix: &str) -> Self {
        self.ledger_key_prefix = prefix.to_string();
        self
    }

    /// Enable the refresh timer
    pub fn refresh_interval(mut self, interval: Duration) -> Self {
        self.refresh_interval = Some(interval);
        self
    }

    pub fn trial_length(&self) -> ChronoDuration {
        ChronoDuration::days(i64::from(self.total_trial_days))
    }

    /// Key under which `user_id`'s ledger is stored
    pub fn ledger_key(&self, user_id: &UserId) -> String {
        format!("{}{}", self.ledger_key_prefix, user_id)
    }

    /// Load from `TRIAL_*` environment variables, falling back to defaults
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as `from_env` with an arbitrary variable source
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::new();

        if let Some(raw) = lookup(ENV_TOTAL_DAYS) {
            config.total_trial_days = parse_var(ENV_TOTAL_DAYS, &raw)?;
        }
        if let Some(raw) = lookup(ENV_GRACE_OFFSET_DAYS) {
            config.grace_offset_days = parse_var(ENV_GRACE_OFFSET_DAYS, &raw)?;
        }
        if let Some(raw) = lookup(ENV_LEDGER_PREFIX) {
            config.ledger_key_prefix = raw;
        }
        if let Some(raw) = lookup(ENV_REFRESH_SECS) {
            let secs: u64 = parse_var(ENV_REFRESH_SECS, &raw)?;
            config.refresh_interval = (secs > 0).then(|| Duration::from_secs(secs));
        }

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.total_trial_days == 0 {
            return Err(TrialError::Config(
                "total_trial_days must be > 0".to_string(),
            ));
        }

        if self.grace_offset_days < 0 {
            return Err(TrialError::Config(
                "grace_offset_days cannot be negative".to_string(),
            ));
        }

        if self.ledger_key_prefix.is_empty() {
            return Err(TrialError::Config(
                "ledger_key_prefix cannot be empty".to_string(),
            ));
        }

        if self.refresh_interval == Some(Duration::ZERO) {
            return Err(TrialError::Config(
                "refresh_interval must be > 0".to_string(),
            ));
        }

        Ok(())
    }
}

impl Default for TrialConfig {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_var<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T> {
    raw.trim()
        .parse()
        .map_err(|_| TrialError::Config(format!("{} has invalid value '{}'", key, raw)))
}
