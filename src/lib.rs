// ============================================================================
// trialwatch Library
// ============================================================================

pub mod config;
pub mod core;
pub mod dispatch;
pub mod entitlement;
pub mod interface;
pub mod ledger;
pub mod sinks;
pub mod storage;
pub mod watcher;

// Re-export main types for convenience
pub use config::TrialConfig;
pub use core::{
    Clock, ManualClock, Result, SubscriptionTier, SystemClock, TrialError, TrialRecordPatch,
    UserId, UserTrialRecord,
};
pub use dispatch::{CycleOutcome, DispatchGate, DueEffect, SideEffectDispatcher, reduce};
pub use entitlement::{
    DerivedEntitlementState, TrialPhase, derive, has_premium_access, in_grace_day,
    is_on_trial, is_trial_expired, trial_days_remaining,
};
pub use interface::{
    AnalyticsSink, LedgerStore, NotificationSink, RecordFeed, RecordStore, RecordWriter,
};
pub use ledger::{EventLedger, FileLedgerStore, InMemoryLedgerStore, LedgerBook, LedgerFlag};
pub use sinks::{RecordingSink, SinkCall, TracingSink};
pub use storage::InMemoryRecordStore;
pub use watcher::{Collaborators, EntitlementSnapshot, EntitlementWatcher, Subscription};
