//! `(record, now, ledger) -> (state, ledger, effects)` with no I/O.

use crate::config::TrialConfig;
use crate::core::{TrialRecordPatch, UserTrialRecord};
use crate::entitlement::{DerivedEntitlementState, TrialPhase, derive, trial_window};
use crate::ledger::{EventLedger, LedgerFlag};
use chrono::{DateTime, Utc};
use serde::Serialize;

/// A side effect that became due in a cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "effect", rename_all = "snake_case")]
pub enum DueEffect {
    TrialStarted { trial_start: DateTime<Utc> },
    TrialDay { day_index: u32, days_remaining: u32 },
    FinalDayNotice,
    TrialExpired,
    ExpiredNotice,
    GraceLocked,
    GraceNotice,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CycleOutcome {
    pub state: DerivedEntitlementState,
    /// Ledger after restart detection and with every fired flag set.
    pub ledger: EventLedger,
    /// Flags set this cycle, in firing order.
    pub fired: Vec<LedgerFlag>,
    /// Callbacks to issue, in firing order.
    pub effects: Vec<DueEffect>,
    /// Record fields to write back, if any.
    pub record_patch: Option<TrialRecordPatch>,
    /// Whether restart detection replaced the ledger.
    pub rebuilt: bool,
}

impl CycleOutcome {
    pub fn ledger_changed(&self) -> bool {
        self.rebuilt || !self.fired.is_empty()
    }

    fn fire(&mut self, flag: LedgerFlag, effect: DueEffect) {
        self.ledger.set(flag);
        self.fired.push(flag);
        self.effects.push(effect);
    }

    fn patch(&mut self, patch: TrialRecordPatch) {
        match self.record_patch.as_mut() {
            Some(existing) => existing.merge(&patch),
            None => self.record_patch = Some(patch),
        }
    }
}

/// One dispatch cycle.
///
/// Events are evaluated in a fixed order (trial start, daily check-in,
/// last-day warning, expiry, grace lock) so a cycle that spans several due
/// events fires all of them. Paid tiers and records without a valid window
/// fire nothing and leave the ledger as it was.
///
/// A fired expiry or grace flag whose record bit is still unset re-emits the
/// record write only; the callback is never repeated.
pub fn reduce(
    record: &UserTrialRecord,
    now: DateTime<Utc>,
    ledger: &EventLedger,
    config: &TrialConfig,
) -> CycleOutcome {
    let state = derive(record, now, config);
    let mut outcome = CycleOutcome {
        state,
        ledger: ledger.clone(),
        fired: Vec::new(),
        effects: Vec::new(),
        record_patch: None,
        rebuilt: false,
    };

    let Some((trial_start, _)) = trial_window(record) else {
        return outcome;
    };
    if state.phase == TrialPhase::Paid {
        return outcome;
    }

    let (reconciled, rebuilt) = ledger.clone().reconcile(Some(trial_start));
    outcome.ledger = reconciled;
    outcome.rebuilt = rebuilt;

    if !outcome.ledger.is_set(LedgerFlag::TrialStart) {
        outcome.fire(LedgerFlag::TrialStart, DueEffect::TrialStarted { trial_start });
    }

    if state.is_on_trial {
        let days_remaining = state.trial_days_remaining;
        let day_index = config.total_trial_days.saturating_sub(days_remaining);
        let flag = LedgerFlag::Day(day_index);
        if !outcome.ledger.is_set(flag) {
            outcome.fire(
                flag,
                DueEffect::TrialDay {
                    day_index,
                    days_remaining,
                },
            );
        }

        if days_remaining == 1 && !outcome.ledger.is_set(LedgerFlag::FinalDayNotice) {
            outcome.fire(LedgerFlag::FinalDayNotice, DueEffect::FinalDayNotice);
        }
    }

    if state.trial_expired {
        if !outcome.ledger.is_set(LedgerFlag::TrialExpired) {
            outcome.fire(LedgerFlag::TrialExpired, DueEffect::TrialExpired);
        }
        if !record.trial_used {
            outcome.patch(TrialRecordPatch::mark_trial_used());
        }
        if !outcome.ledger.is_set(LedgerFlag::ExpiredNotice) {
            outcome.fire(LedgerFlag::ExpiredNotice, DueEffect::ExpiredNotice);
        }
    }

    if state.in_grace_day {
        if !outcome.ledger.is_set(LedgerFlag::GraceLock) {
            outcome.fire(LedgerFlag::GraceLock, DueEffect::GraceLocked);
        }
        outcome.patch(TrialRecordPatch::mark_grace_used());
        if !outcome.ledger.is_set(LedgerFlag::GraceNotice) {
            outcome.fire(LedgerFlag::GraceNotice, DueEffect::GraceNotice);
        }
    }

    outcome
}
