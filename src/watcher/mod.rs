//! The live entitlement service.
//!
//! An [`EntitlementWatcher`] is built once at the composition root. Attaching
//! an identity spawns one task that owns the record feed, the refresh timer
//! and every dispatch cycle for that user; consumers read the result through
//! [`EntitlementWatcher::subscribe`] or [`EntitlementWatcher::updates`].

use crate::config::TrialConfig;
use crate::core::{
    Clock, Result, SystemClock, TrialError, TrialRecordPatch, UserId, UserTrialRecord,
};
use crate::dispatch::{DispatchGate, SideEffectDispatcher};
use crate::entitlement::{DerivedEntitlementState, derive};
use crate::interface::{
    AnalyticsSink, LedgerStore, NotificationSink, RecordFeed, RecordStore, RecordWriter,
};
use chrono::{DateTime, Utc};
use futures::StreamExt;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{Instrument, debug, info, info_span, warn};

/// What consumers see: the record as last received and what it entitles to.
#[derive(Debug, Clone, PartialEq)]
pub struct EntitlementSnapshot {
    pub user_id: UserId,
    pub record: UserTrialRecord,
    pub state: DerivedEntitlementState,
    pub evaluated_at: DateTime<Utc>,
}

impl EntitlementSnapshot {
    fn same_view(&self, other: &EntitlementSnapshot) -> bool {
        self.user_id == other.user_id && self.record == other.record && self.state == other.state
    }
}

/// External collaborators of the watcher.
pub struct Collaborators {
    pub records: Arc<dyn RecordStore>,
    pub writer: Arc<dyn RecordWriter>,
    pub ledger_store: Arc<dyn LedgerStore>,
    pub analytics: Arc<dyn AnalyticsSink>,
    pub notifications: Arc<dyn NotificationSink>,
    pub clock: Arc<dyn Clock>,
}

impl Collaborators {
    pub fn new(
        records: Arc<dyn RecordStore>,
        writer: Arc<dyn RecordWriter>,
        ledger_store: Arc<dyn LedgerStore>,
        analytics: Arc<dyn AnalyticsSink>,
        notifications: Arc<dyn NotificationSink>,
    ) -> Self {
        Self {
            records,
            writer,
            ledger_store,
            analytics,
            notifications,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }
}

enum WatcherCommand {
    Refresh,
    Reset {
        patch: TrialRecordPatch,
        new_start: DateTime<Utc>,
        done: oneshot::Sender<()>,
    },
}

struct ActiveIdentity {
    user_id: UserId,
    gate: DispatchGate,
    commands: mpsc::UnboundedSender<WatcherCommand>,
    stop: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl ActiveIdentity {
    /// Closes the gate and asks the task to exit once its current cycle has
    /// finished persisting. The returned handle completes when it has.
    fn stop(self) -> JoinHandle<()> {
        self.gate.close();
        let _ = self.stop.send(());
        self.task
    }
}

/// Handle returned by [`EntitlementWatcher::subscribe`]. Dropping it also
/// unsubscribes.
pub struct Subscription {
    task: JoinHandle<()>,
}

impl Subscription {
    pub fn unsubscribe(self) {
        self.task.abort();
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.task.abort();
    }
}

pub struct EntitlementWatcher {
    config: TrialConfig,
    clock: Arc<dyn Clock>,
    records: Arc<dyn RecordStore>,
    writer: Arc<dyn RecordWriter>,
    dispatcher: Arc<SideEffectDispatcher>,
    published: Arc<watch::Sender<Option<EntitlementSnapshot>>>,
    active: Mutex<Option<ActiveIdentity>>,
}

impl EntitlementWatcher {
    pub fn new(config: TrialConfig, parts: Collaborators) -> Self {
        let dispatcher = SideEffectDispatcher::new(
            config.clone(),
            parts.ledger_store,
            parts.writer.clone(),
            parts.analytics,
            parts.notifications,
        );
        let (published, _) = watch::channel(None);

        Self {
            config,
            clock: parts.clock,
            records: parts.records,
            writer: parts.writer,
            dispatcher: Arc::new(dispatcher),
            published: Arc::new(published),
            active: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &TrialConfig {
        &self.config
    }

    pub fn dispatcher(&self) -> &Arc<SideEffectDispatcher> {
        &self.dispatcher
    }

    /// Start following `user_id`, replacing any attached identity.
    ///
    /// Fails only if the feed cannot be opened.
    pub async fn attach(&self, user_id: UserId) -> Result<()> {
        self.detach();

        let feed = self.records.watch(&user_id).await?;
        let gate = DispatchGate::open();
        let (commands, inbox) = mpsc::unbounded_channel();
        let (stop, stopped) = oneshot::channel();

        let cycles = CycleLoop {
            user_id: user_id.clone(),
            config: self.config.clone(),
            clock: Arc::clone(&self.clock),
            dispatcher: Arc::clone(&self.dispatcher),
            published: Arc::clone(&self.published),
            gate: gate.clone(),
        };
        let span = info_span!("entitlement_watcher", user = %user_id);
        let task = tokio::spawn(cycles.run(feed, inbox, stopped).instrument(span));

        let replaced = lock(&self.active).replace(ActiveIdentity {
            user_id: user_id.clone(),
            gate,
            commands,
            stop,
            task,
        });
        if let Some(previous) = replaced {
            // A concurrent attach won the race; only one identity may stay live.
            drop(previous.stop());
        }

        info!(user = %user_id, "identity attached");
        Ok(())
    }

    /// Stop following the current identity. No callback fires once this
    /// returns.
    ///
    /// A cycle already in progress still writes its ledger and record flags;
    /// the cached ledger is dropped after that write. Use
    /// [`close`](Self::close) to wait for it.
    pub fn detach(&self) {
        self.release();
    }

    /// `detach`, then wait until the identity's task has finished writing.
    pub async fn close(&self) {
        let Some(task) = self.release() else {
            return;
        };
        if let Err(err) = task.await {
            if err.is_panic() {
                warn!(error = %err, "entitlement task panicked");
            }
        }
    }

    fn release(&self) -> Option<JoinHandle<()>> {
        let previous = lock(&self.active).take()?;
        let user_id = previous.user_id.clone();
        let task = previous.stop();
        self.published.send_replace(None);
        info!(user = %user_id, "identity detached");
        Some(task)
    }

    pub fn attached_user(&self) -> Option<UserId> {
        lock(&self.active).as_ref().map(|active| active.user_id.clone())
    }

    /// Re-evaluate the last received record now.
    pub fn refresh(&self) -> Result<()> {
        let guard = lock(&self.active);
        let active = guard.as_ref().ok_or(TrialError::NotAttached)?;
        active
            .commands
            .send(WatcherCommand::Refresh)
            .map_err(|_| TrialError::Subscription("watcher task has stopped".to_string()))
    }

    /// Issue a fresh trial window to `user_id` and clear its ledger.
    ///
    /// When `user_id` is the attached identity the new state is published
    /// before this returns.
    pub async fn reset_trial(&self, user_id: &UserId) -> Result<()> {
        let now = self.clock.now();
        let patch = TrialRecordPatch::fresh_window(now, now + self.config.trial_length());
        self.writer.update(user_id, &patch).await?;
        info!(user = %user_id, trial_start = %now, "trial reset");

        let commands = lock(&self.active)
            .as_ref()
            .filter(|active| &active.user_id == user_id)
            .map(|active| active.commands.clone());

        if let Some(commands) = commands {
            let (done, acked) = oneshot::channel();
            let sent = commands.send(WatcherCommand::Reset {
                patch,
                new_start: now,
                done,
            });
            if sent.is_ok() && acked.await.is_ok() {
                return Ok(());
            }
        }

        self.dispatcher.discard_ledger(user_id).await;
        Ok(())
    }

    /// Invoke `on_update` with the current snapshot and after every change.
    ///
    /// While no identity is attached the callback receives an empty record
    /// and [`DerivedEntitlementState::no_trial`].
    pub fn subscribe<F>(&self, on_update: F) -> Subscription
    where
        F: Fn(&UserTrialRecord, &DerivedEntitlementState) + Send + Sync + 'static,
    {
        let mut updates = self.published.subscribe();
        let task = tokio::spawn(async move {
            loop {
                let snapshot = updates.borrow_and_update().clone();
                match snapshot {
                    Some(snapshot) => on_update(&snapshot.record, &snapshot.state),
                    None => on_update(
                        &UserTrialRecord::default(),
                        &DerivedEntitlementState::no_trial(),
                    ),
                }
                if updates.changed().await.is_err() {
                    break;
                }
            }
        });
        Subscription { task }
    }

    pub fn updates(&self) -> watch::Receiver<Option<EntitlementSnapshot>> {
        self.published.subscribe()
    }

    pub fn current(&self) -> Option<EntitlementSnapshot> {
        self.published.borrow().clone()
    }

    /// The one place the rest of the application should read access from.
    pub fn has_premium_access(&self) -> bool {
        self.published
            .borrow()
            .as_ref()
            .is_some_and(|snapshot| snapshot.state.has_premium_access)
    }

    /// Follow an identity feed: attach on sign-in, detach on sign-out or when
    /// the feed goes away.
    pub fn bind_identity(
        self: &Arc<Self>,
        mut identities: watch::Receiver<Option<UserId>>,
    ) -> JoinHandle<()> {
        let watcher = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let wanted = identities.borrow_and_update().clone();
                match wanted {
                    Some(user_id) if watcher.attached_user().as_ref() != Some(&user_id) => {
                        if let Err(err) = watcher.attach(user_id.clone()).await {
                            warn!(user = %user_id, error = %err, "failed to attach identity");
                        }
                    }
                    Some(_) => {}
                    None => watcher.detach(),
                }

                if identities.changed().await.is_err() {
                    watcher.detach();
                    break;
                }
            }
        })
    }
}

impl Drop for EntitlementWatcher {
    fn drop(&mut self) {
        if let Some(active) = lock(&self.active).take() {
            drop(active.stop());
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Everything the per-identity task needs.
struct CycleLoop {
    user_id: UserId,
    config: TrialConfig,
    clock: Arc<dyn Clock>,
    dispatcher: Arc<SideEffectDispatcher>,
    published: Arc<watch::Sender<Option<EntitlementSnapshot>>>,
    gate: DispatchGate,
}

impl CycleLoop {
    async fn run(
        self,
        mut feed: RecordFeed,
        mut inbox: mpsc::UnboundedReceiver<WatcherCommand>,
        mut stopped: oneshot::Receiver<()>,
    ) {
        let mut ticker = self.config.refresh_interval.map(|period| {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            ticker
        });
        let mut last: Option<UserTrialRecord> = None;
        let mut feed_open = true;
        // Start of a reset issued from this process, see `admit`.
        let mut reset_floor: Option<DateTime<Utc>> = None;

        loop {
            tokio::select! {
                biased;

                // Sender dropped counts as a stop too.
                _ = &mut stopped => break,

                Some(command) = inbox.recv() => match command {
                    WatcherCommand::Refresh => {
                        if let Some(record) = last.clone() {
                            if !self.cycle(&record).await {
                                break;
                            }
                        }
                    }
                    WatcherCommand::Reset { patch, new_start, done } => {
                        self.dispatcher.reset_ledger(&self.user_id, new_start).await;
                        reset_floor = Some(new_start);
                        let mut record = last.take().unwrap_or_default();
                        record.apply_patch(&patch);
                        let now = self.clock.now();
                        let state = derive(&record, now, &self.config);
                        last = Some(record.clone());
                        if !self.publish(record, state, now) {
                            break;
                        }
                        let _ = done.send(());
                    }
                },

                item = feed.next(), if feed_open => match item {
                    Some(Ok(record)) => {
                        let record = record.unwrap_or_default();
                        if !admit(&mut reset_floor, &record) {
                            debug!(trial_start = ?record.trial_start, "skipping record older than local reset");
                            continue;
                        }
                        last = Some(record.clone());
                        if !self.cycle(&record).await {
                            break;
                        }
                    }
                    Some(Err(TrialError::MalformedRecord { reason, .. })) => {
                        warn!(reason = %reason, "malformed trial record, treating as no trial");
                        let record = UserTrialRecord::default();
                        last = Some(record.clone());
                        if !self.cycle(&record).await {
                            break;
                        }
                    }
                    Some(Err(err)) => {
                        warn!(error = %err, "record feed error, keeping last known state");
                    }
                    None => {
                        info!("record feed closed");
                        feed_open = false;
                    }
                },

                _ = next_tick(&mut ticker) => {
                    if let Some(record) = last.clone() {
                        if !self.cycle(&record).await {
                            break;
                        }
                    }
                }
            }
        }

        // Every dispatched outcome has been persisted by now.
        self.dispatcher.forget(&self.user_id);
        debug!("entitlement task stopped");
    }

    /// Dispatch, publish, then persist. Returns `false` once the identity has
    /// been detached.
    ///
    /// An outcome whose callbacks were issued is always persisted, even if
    /// the identity was detached in between.
    async fn cycle(&self, record: &UserTrialRecord) -> bool {
        let now = self.clock.now();
        let Some(outcome) = self
            .dispatcher
            .evaluate(&self.user_id, record, now, &self.gate)
            .await
        else {
            return false;
        };

        let published = self.publish(record.clone(), outcome.state, now);
        self.dispatcher.persist(&self.user_id, &outcome).await;
        published
    }

    fn publish(
        &self,
        record: UserTrialRecord,
        state: DerivedEntitlementState,
        now: DateTime<Utc>,
    ) -> bool {
        let snapshot = EntitlementSnapshot {
            user_id: self.user_id.clone(),
            record,
            state,
            evaluated_at: now,
        };
        self.gate
            .run_if_open(|| {
                self.published.send_if_modified(|current| {
                    if current
                        .as_ref()
                        .is_some_and(|existing| existing.same_view(&snapshot))
                    {
                        return false;
                    }
                    *current = Some(snapshot);
                    true
                })
            })
            .is_some()
    }
}

/// Whether a feed item may replace the last record.
///
/// Only the first item after a local reset is checked against the reset
/// start; an older window there was already in flight when the reset was
/// written. Later items are taken as they come, whatever their start.
fn admit(reset_floor: &mut Option<DateTime<Utc>>, record: &UserTrialRecord) -> bool {
    match (reset_floor.take(), record.trial_start) {
        (Some(floor), Some(start)) => start >= floor,
        _ => true,
    }
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}
