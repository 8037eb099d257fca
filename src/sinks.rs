//! Ready-made analytics and notification sinks.

use crate::core::UserId;
use crate::interface::{AnalyticsSink, NotificationSink};
use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex};
use tracing::info;

/// Logs every call at INFO under the `trialwatch::sink` target.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl AnalyticsSink for TracingSink {
    fn track_trial_start(&self, user_id: &UserId, trial_start: DateTime<Utc>) {
        info!(target: "trialwatch::sink", user = %user_id, trial_start = %trial_start, "trial_start");
    }

    fn track_trial_day(&self, user_id: &UserId, day_index: u32, days_remaining: u32) {
        info!(target: "trialwatch::sink", user = %user_id, day_index, days_remaining, "trial_day");
    }

    fn track_trial_expired(&self, user_id: &UserId) {
        info!(target: "trialwatch::sink", user = %user_id, "trial_expired");
    }

    fn track_trial_grace_lock(&self, user_id: &UserId) {
        info!(target: "trialwatch::sink", user = %user_id, "trial_grace_lock");
    }
}

impl NotificationSink for TracingSink {
    fn create_day6_notification(&self, user_id: &UserId) {
        info!(target: "trialwatch::sink", user = %user_id, "notification: trial ends tomorrow");
    }

    fn create_trial_expired_notification(&self, user_id: &UserId) {
        info!(target: "trialwatch::sink", user = %user_id, "notification: trial expired");
    }

    fn create_grace_day_notification(&self, user_id: &UserId) {
        info!(target: "trialwatch::sink", user = %user_id, "notification: grace day");
    }
}

/// A single captured sink call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkCall {
    TrialStart {
        user_id: UserId,
        trial_start: DateTime<Utc>,
    },
    TrialDay {
        user_id: UserId,
        day_index: u32,
        days_remaining: u32,
    },
    TrialExpired {
        user_id: UserId,
    },
    TrialGraceLock {
        user_id: UserId,
    },
    Day6Notification {
        user_id: UserId,
    },
    TrialExpiredNotification {
        user_id: UserId,
    },
    GraceDayNotification {
        user_id: UserId,
    },
}

impl SinkCall {
    /// Short name of the call, e.g. `"trial_day"`.
    pub fn name(&self) -> &'static str {
        match self {
            Self::TrialStart { .. } => "trial_start",
            Self::TrialDay { .. } => "trial_day",
            Self::TrialExpired { .. } => "trial_expired",
            Self::TrialGraceLock { .. } => "trial_grace_lock",
            Self::Day6Notification { .. } => "day6_notification",
            Self::TrialExpiredNotification { .. } => "trial_expired_notification",
            Self::GraceDayNotification { .. } => "grace_day_notification",
        }
    }
}

/// Captures calls in order. Clones share the same buffer, so one instance can
/// be handed out as both sinks and inspected afterwards.
#[derive(Debug, Clone, Default)]
pub struct RecordingSink {
    calls: Arc<Mutex<Vec<SinkCall>>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<SinkCall> {
        self.lock().clone()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.lock().iter().map(SinkCall::name).collect()
    }

    pub fn count(&self, name: &str) -> usize {
        self.lock().iter().filter(|call| call.name() == name).count()
    }

    /// Returns and clears the captured calls.
    pub fn take(&self) -> Vec<SinkCall> {
        std::mem::take(&mut *self.lock())
    }

    fn push(&self, call: SinkCall) {
        self.lock().push(call);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<SinkCall>> {
        self.calls
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl AnalyticsSink for RecordingSink {
    fn track_trial_start(&self, user_id: &UserId, trial_start: DateTime<Utc>) {
        self.push(SinkCall::TrialStart {
            user_id: user_id.clone(),
            trial_start,
        });
    }

    fn track_trial_day(&self, user_id: &UserId, day_index: u32, days_remaining: u32) {
        self.push(SinkCall::TrialDay {
            user_id: user_id.clone(),
            day_index,
            days_remaining,
        });
    }

    fn track_trial_expired(&self, user_id: &UserId) {
        self.push(SinkCall::TrialExpired {
            user_id: user_id.clone(),
        });
    }

    fn track_trial_grace_lock(&self, user_id: &UserId) {
        self.push(SinkCall::TrialGraceLock {
            user_id: user_id.clone(),
        });
    }
}

impl NotificationSink for RecordingSink {
    fn create_day6_notification(&self, user_id: &UserId) {
        self.push(SinkCall::Day6Notification {
            user_id: user_id.clone(),
        });
    }

    fn create_trial_expired_notification(&self, user_id: &UserId) {
        self.push(SinkCall::TrialExpiredNotification {
            user_id: user_id.clone(),
        });
    }

    fn create_grace_day_notification(&self, user_id: &UserId) {
        self.push(SinkCall::GraceDayNotification {
            user_id: user_id.clone(),
        });
    }
}
