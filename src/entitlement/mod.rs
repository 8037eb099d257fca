//! Pure entitlement math.
//!
//! Every function here is total and takes `now` explicitly; nothing reads the
//! clock or touches storage.

use crate::config::TrialConfig;
use crate::core::UserTrialRecord;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

const MILLIS_PER_DAY: i64 = 86_400_000;

/// Lifecycle position of a user, derived from the record and the clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrialPhase {
    NoTrial,
    OnTrial,
    /// Trial over, grace day not reached yet.
    Expired,
    GraceDay,
    Locked,
    Paid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DerivedEntitlementState {
    pub is_on_trial: bool,
    pub trial_expired: bool,
    pub trial_days_remaining: u32,
    pub in_grace_day: bool,
    pub has_premium_access: bool,
    pub phase: TrialPhase,
}

impl DerivedEntitlementState {
    /// State of a user with no (valid) trial and no paid tier.
    pub fn no_trial() -> Self {
        Self {
            is_on_trial: false,
            trial_expired: false,
            trial_days_remaining: 0,
            in_grace_day: false,
            has_premium_access: false,
            phase: TrialPhase::NoTrial,
        }
    }
}

/// The `[start, expires_at)` window, or `None` when the record has no usable one.
pub fn trial_window(record: &UserTrialRecord) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
    match (record.trial_start, record.trial_expires_at) {
        (Some(start), Some(expires_at)) if expires_at > start => Some((start, expires_at)),
        _ => None,
    }
}

pub fn is_on_trial(record: &UserTrialRecord, now: DateTime<Utc>) -> bool {
    trial_window(record).is_some_and(|(_, expires_at)| now < expires_at)
}

pub fn is_trial_expired(record: &UserTrialRecord, now: DateTime<Utc>) -> bool {
    trial_window(record).is_some_and(|(_, expires_at)| now >= expires_at)
}

/// Whole days left, partial days rounded up, clamped to `[0, total_trial_days]`.
pub fn trial_days_remaining(
    record: &UserTrialRecord,
    now: DateTime<Utc>,
    config: &TrialConfig,
) -> u32 {
    let Some((_, expires_at)) = trial_window(record) else {
        return 0;
    };
    let days = ceil_days(expires_at - now).clamp(0, i64::from(config.total_trial_days));
    u32::try_from(days).unwrap_or(0)
}

/// Whole days elapsed since expiry, or `None` before expiry.
pub fn days_since_expiry(record: &UserTrialRecord, now: DateTime<Utc>) -> Option<i64> {
    let (_, expires_at) = trial_window(record)?;
    (now >= expires_at).then(|| floor_days(now - expires_at))
}

pub fn in_grace_day(record: &UserTrialRecord, now: DateTime<Utc>, config: &TrialConfig) -> bool {
    !record.trial_grace_used
        && days_since_expiry(record, now) == Some(config.grace_offset_days)
}

pub fn has_premium_access(
    record: &UserTrialRecord,
    now: DateTime<Utc>,
    config: &TrialConfig,
) -> bool {
    record.subscription_tier.is_paid()
        || is_on_trial(record, now)
        || in_grace_day(record, now, config)
}

pub fn derive(
    record: &UserTrialRecord,
    now: DateTime<Utc>,
    config: &TrialConfig,
) -> DerivedEntitlementState {
    let is_on_trial = is_on_trial(record, now);
    let trial_expired = is_trial_expired(record, now);
    let in_grace_day = in_grace_day(record, now, config);
    let paid = record.subscription_tier.is_paid();

    let phase = if paid {
        TrialPhase::Paid
    } else if is_on_trial {
        TrialPhase::OnTrial
    } else if in_grace_day {
        TrialPhase::GraceDay
    } else if trial_expired {
        match days_since_expiry(record, now) {
            Some(days) if days < config.grace_offset_days => TrialPhase::Expired,
            _ => TrialPhase::Locked,
        }
    } else {
        TrialPhase::NoTrial
    };

    DerivedEntitlementState {
        is_on_trial,
        trial_expired,
        trial_days_remaining: trial_days_remaining(record, now, config),
        in_grace_day,
        has_premium_access: paid || is_on_trial || in_grace_day,
        phase,
    }
}

fn ceil_days(span: Duration) -> i64 {
    let millis = span.num_milliseconds();
    if millis <= 0 {
        return millis.div_euclid(MILLIS_PER_DAY);
    }
    (millis + MILLIS_PER_DAY - 1) / MILLIS_PER_DAY
}

fn floor_days(span: Duration) -> i64 {
    span.num_milliseconds().div_euclid(MILLIS_PER_DAY)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::SubscriptionTier;
    use chrono::TimeZone;

    fn day0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 2, 1, 9, 30, 0).unwrap()
    }

    fn record() -> UserTrialRecord {
        UserTrialRecord::with_window(day0(), day0() + Duration::days(7))
    }

    #[test]
    fn test_fresh_trial() {
        let state = derive(&record(), day0(), &TrialConfig::default());
        assert!(state.is_on_trial);
        assert!(!state.trial_expired);
        assert_eq!(state.trial_days_remaining, 7);
        assert!(!state.in_grace_day);
        assert!(state.has_premium_access);
        assert_eq!(state.phase, TrialPhase::OnTrial);
    }

    #[test]
    fn test_partial_days_round_up() {
        let config = TrialConfig::default();
        assert_eq!(
            trial_days_remaining(&record(), day0() + Duration::hours(1), &config),
            7
        );
        assert_eq!(
            trial_days_remaining(&record(), day0() + Duration::days(6), &config),
            1
        );
        assert_eq!(
            trial_days_remaining(&record(), day0() + Duration::days(7) - Duration::seconds(1), &config),
            1
        );
        assert_eq!(
            trial_days_remaining(&record(), day0() + Duration::days(7), &config),
            0
        );
    }

    #[test]
    fn test_remaining_is_clamped_to_window() {
        let config = TrialConfig::default();
        let long = UserTrialRecord::with_window(day0(), day0() + Duration::days(30));
        assert_eq!(trial_days_remaining(&long, day0(), &config), 7);
        assert_eq!(
            trial_days_remaining(&record(), day0() + Duration::days(40), &config),
            0
        );
    }

    #[test]
    fn test_expiry_and_grace_boundaries() {
        let config = TrialConfig::default();
        let expires_at = day0() + Duration::days(7);

        let at_expiry = derive(&record(), expires_at, &config);
        assert!(at_expiry.trial_expired);
        assert!(!at_expiry.is_on_trial);
        assert!(!at_expiry.in_grace_day);
        assert!(!at_expiry.has_premium_access);
        assert_eq!(at_expiry.phase, TrialPhase::Expired);

        for offset in [Duration::days(1), Duration::hours(47)] {
            let state = derive(&record(), expires_at + offset, &config);
            assert!(state.in_grace_day, "grace expected at {:?}", offset);
            assert!(state.has_premium_access);
            assert_eq!(state.phase, TrialPhase::GraceDay);
        }

        let exhausted = derive(&record(), expires_at + Duration::days(2), &config);
        assert!(exhausted.trial_expired);
        assert!(!exhausted.in_grace_day);
        assert!(!exhausted.has_premium_access);
        assert_eq!(exhausted.phase, TrialPhase::Locked);
    }

    #[test]
    fn test_used_grace_is_not_granted_again() {
        let mut used = record();
        used.trial_grace_used = true;
        let state = derive(&used, day0() + Duration::days(8), &TrialConfig::default());
        assert!(!state.in_grace_day);
        assert!(!state.has_premium_access);
        assert_eq!(state.phase, TrialPhase::Locked);
    }

    #[test]
    fn test_paid_tier_overrides_trial_math() {
        let paid = record().tier(SubscriptionTier::Premium);
        let state = derive(&paid, day0() + Duration::days(90), &TrialConfig::default());
        assert!(state.has_premium_access);
        assert!(state.trial_expired);
        assert_eq!(state.phase, TrialPhase::Paid);
    }

    #[test]
    fn test_malformed_windows_are_no_trial() {
        let config = TrialConfig::default();
        let missing_expiry = UserTrialRecord {
            trial_start: Some(day0()),
            ..UserTrialRecord::default()
        };
        let inverted = UserTrialRecord::with_window(day0(), day0() - Duration::days(1));

        for record in [UserTrialRecord::default(), missing_expiry, inverted] {
            assert_eq!(derive(&record, day0(), &config), DerivedEntitlementState::no_trial());
        }
    }
}
