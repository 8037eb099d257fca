use super::reducer::{CycleOutcome, DueEffect, reduce};
use crate::config::TrialConfig;
use crate::core::{UserId, UserTrialRecord};
use crate::interface::{AnalyticsSink, LedgerStore, NotificationSink, RecordWriter};
use crate::ledger::{EventLedger, LedgerBook};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{Level, debug, event, info, warn};

/// Switch that callbacks are issued under.
///
/// Closing the gate waits for any callback batch in progress; after `close`
/// returns no batch can start. Clones share the same switch.
#[derive(Debug, Clone)]
pub struct DispatchGate {
    open: Arc<Mutex<bool>>,
}

impl DispatchGate {
    pub fn open() -> Self {
        Self {
            open: Arc::new(Mutex::new(true)),
        }
    }

    pub fn close(&self) {
        *lock(&self.open) = false;
    }

    pub fn is_open(&self) -> bool {
        *lock(&self.open)
    }

    /// Runs `f` while holding the gate, or returns `None` if it is closed.
    pub fn run_if_open<T>(&self, f: impl FnOnce() -> T) -> Option<T> {
        let guard = lock(&self.open);
        if *guard { Some(f()) } else { None }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Runs dispatch cycles: consults the ledger, issues due callbacks, and
/// writes back the ledger and record flags.
///
/// The ledger of every user seen is cached in memory after the first load;
/// the cache is what later cycles read, so a failed ledger write never causes
/// a duplicate within the same process.
pub struct SideEffectDispatcher {
    config: TrialConfig,
    ledgers: LedgerBook,
    records: Arc<dyn RecordWriter>,
    analytics: Arc<dyn AnalyticsSink>,
    notifications: Arc<dyn NotificationSink>,
    cache: Mutex<HashMap<UserId, EventLedger>>,
}

impl SideEffectDispatcher {
    pub fn new(
        config: TrialConfig,
        ledger_store: Arc<dyn LedgerStore>,
        records: Arc<dyn RecordWriter>,
        analytics: Arc<dyn AnalyticsSink>,
        notifications: Arc<dyn NotificationSink>,
    ) -> Self {
        Self {
            ledgers: LedgerBook::new(ledger_store, config.clone()),
            config,
            records,
            analytics,
            notifications,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &TrialConfig {
        &self.config
    }

    /// Evaluates one cycle and issues its callbacks.
    ///
    /// Returns `None` without side effects if `gate` closed before the
    /// callbacks could be issued. Nothing is persisted here; call
    /// [`persist`](Self::persist) with the outcome afterwards.
    pub async fn evaluate(
        &self,
        user_id: &UserId,
        record: &UserTrialRecord,
        now: DateTime<Utc>,
        gate: &DispatchGate,
    ) -> Option<CycleOutcome> {
        let ledger = self.ledger(user_id).await;
        let outcome = reduce(record, now, &ledger, &self.config);

        if outcome.rebuilt {
            match ledger.trial_start_timestamp() {
                Some(previous) => info!(
                    user = %user_id,
                    previous = %previous,
                    current = ?outcome.ledger.trial_start_timestamp(),
                    "trial restarted, discarding stale event ledger"
                ),
                None => debug!(user = %user_id, "creating event ledger"),
            }
        }

        gate.run_if_open(|| {
            for effect in &outcome.effects {
                self.issue(user_id, effect);
            }
            if outcome.ledger_changed() {
                lock(&self.cache).insert(user_id.clone(), outcome.ledger.clone());
            }
            outcome
        })
    }

    /// Writes the ledger (if it changed) and the record patch (if any).
    /// Failures are logged and left for the next cycle.
    pub async fn persist(&self, user_id: &UserId, outcome: &CycleOutcome) {
        if outcome.ledger_changed() {
            if let Err(err) = self.ledgers.save(user_id, &outcome.ledger).await {
                warn!(user = %user_id, error = %err, "event ledger write failed");
            }
        }

        if let Some(patch) = outcome.record_patch.as_ref() {
            if let Err(err) = self.records.update(user_id, patch).await {
                warn!(user = %user_id, error = %err, "trial record write failed, retrying next cycle");
            }
        }
    }

    /// `evaluate` followed by `persist`.
    ///
    /// # Examples
    ///
    /// ```
    /// use chrono::{Duration, Utc};
    /// use std::sync::Arc;
    /// use trialwatch::{
    ///     DispatchGate, InMemoryLedgerStore, InMemoryRecordStore, RecordingSink,
    ///     SideEffectDispatcher, TrialConfig, UserId, UserTrialRecord,
    /// };
    ///
    /// # tokio_test::block_on(async {
    /// let records = InMemoryRecordStore::new();
    /// let sink = RecordingSink::new();
    /// let dispatcher = SideEffectDispatcher::new(
    ///     TrialConfig::default(),
    ///     Arc::new(InMemoryLedgerStore::new()),
    ///     Arc::new(records),
    ///     Arc::new(sink.clone()),
    ///     Arc::new(sink.clone()),
    /// );
    ///
    /// let now = Utc::now();
    /// let record = UserTrialRecord::with_window(now, now + Duration::days(7));
    /// let gate = DispatchGate::open();
    /// let user = UserId::from("u1");
    ///
    /// dispatcher.run_cycle(&user, &record, now, &gate).await.unwrap();
    /// dispatcher.run_cycle(&user, &record, now, &gate).await.unwrap();
    /// assert_eq!(sink.names(), vec!["trial_start", "trial_day"]);
    /// # });
    /// ```
    pub async fn run_cycle(
        &self,
        user_id: &UserId,
        record: &UserTrialRecord,
        now: DateTime<Utc>,
        gate: &DispatchGate,
    ) -> Option<CycleOutcome> {
        let outcome = self.evaluate(user_id, record, now, gate).await?;
        self.persist(user_id, &outcome).await;
        Some(outcome)
    }

    /// Clears the ledger for a trial restarting at `new_start`.
    ///
    /// A cached ledger already rebuilt for `new_start` by a concurrent cycle
    /// is kept, so the new trial's events are not fired twice.
    pub async fn reset_ledger(&self, user_id: &UserId, new_start: DateTime<Utc>) {
        {
            let mut cache = lock(&self.cache);
            if let Some(existing) = cache.get(user_id) {
                if existing.trial_start_timestamp() == Some(new_start) {
                    return;
                }
            }
            cache.insert(user_id.clone(), EventLedger::default());
        }

        if let Err(err) = self.ledgers.clear(user_id).await {
            warn!(user = %user_id, error = %err, "failed to clear stored event ledger");
        }
    }

    /// Clears the ledger of a user with no live cycle, leaving nothing cached.
    pub async fn discard_ledger(&self, user_id: &UserId) {
        self.forget(user_id);
        if let Err(err) = self.ledgers.clear(user_id).await {
            warn!(user = %user_id, error = %err, "failed to clear stored event ledger");
        }
    }

    /// Drops the cached ledger of `user_id`. The stored ledger is kept.
    pub fn forget(&self, user_id: &UserId) {
        lock(&self.cache).remove(user_id);
    }

    /// The ledger the next cycle for `user_id` will evaluate against.
    pub async fn ledger(&self, user_id: &UserId) -> EventLedger {
        let cached = lock(&self.cache).get(user_id).cloned();
        if let Some(cached) = cached {
            return cached;
        }

        let loaded = match self.ledgers.load(user_id).await {
            Ok(ledger) => ledger,
            Err(err) => {
                warn!(user = %user_id, error = %err, "event ledger unavailable, starting empty");
                EventLedger::default()
            }
        };

        lock(&self.cache)
            .entry(user_id.clone())
            .or_insert(loaded)
            .clone()
    }

    fn issue(&self, user_id: &UserId, effect: &DueEffect) {
        event!(Level::INFO, user = %user_id, effect = ?effect, "dispatching trial effect");
        match *effect {
            DueEffect::TrialStarted { trial_start } => {
                self.analytics.track_trial_start(user_id, trial_start)
            }
            DueEffect::TrialDay {
                day_index,
                days_remaining,
            } => self
                .analytics
                .track_trial_day(user_id, day_index, days_remaining),
            DueEffect::FinalDayNotice => self.notifications.create_day6_notification(user_id),
            DueEffect::TrialExpired => self.analytics.track_trial_expired(user_id),
            DueEffect::ExpiredNotice => self
                .notifications
                .create_trial_expired_notification(user_id),
            DueEffect::GraceLocked => self.analytics.track_trial_grace_lock(user_id),
            DueEffect::GraceNotice => self.notifications.create_grace_day_notification(user_id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::InMemoryLedgerStore;
    use crate::sinks::RecordingSink;
    use crate::storage::InMemoryRecordStore;
    use chrono::{Duration, TimeZone};

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 8, 3, 10, 0, 0).unwrap()
    }

    fn dispatcher(store: Arc<InMemoryLedgerStore>) -> SideEffectDispatcher {
        let sink = RecordingSink::new();
        SideEffectDispatcher::new(
            TrialConfig::default(),
            store,
            Arc::new(InMemoryRecordStore::new()),
            Arc::new(sink.clone()),
            Arc::new(sink),
        )
    }

    #[tokio::test]
    async fn test_discard_ledger_leaves_cache_empty() {
        let store = Arc::new(InMemoryLedgerStore::new());
        let dispatcher = dispatcher(store.clone());
        let user = UserId::from("u1");
        let record = UserTrialRecord::with_window(start(), start() + Duration::days(7));

        dispatcher
            .run_cycle(&user, &record, start(), &DispatchGate::open())
            .await
            .unwrap();
        assert_eq!(lock(&dispatcher.cache).len(), 1);

        dispatcher.discard_ledger(&user).await;
        dispatcher.discard_ledger(&UserId::from("never-seen")).await;

        assert!(lock(&dispatcher.cache).is_empty());
        assert!(store.keys().await.is_empty());
    }

    #[tokio::test]
    async fn test_closed_gate_keeps_cache_untouched() {
        let dispatcher = dispatcher(Arc::new(InMemoryLedgerStore::new()));
        let user = UserId::from("u1");
        let record = UserTrialRecord::with_window(start(), start() + Duration::days(7));
        let gate = DispatchGate::open();
        gate.close();

        assert!(dispatcher.evaluate(&user, &record, start(), &gate).await.is_none());
        assert!(dispatcher.ledger(&user).await.is_empty());
    }
}
