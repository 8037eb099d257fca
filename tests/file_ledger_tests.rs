/// File-backed ledger tests
///
/// Run with: cargo test --test file_ledger_tests
use chrono::{DateTime, Duration, TimeZone, Utc};
use std::sync::Arc;
use tempfile::tempdir;
use trialwatch::{
    DispatchGate, EventLedger, FileLedgerStore, InMemoryRecordStore, LedgerBook, LedgerFlag,
    LedgerStore, RecordingSink, SideEffectDispatcher, TrialConfig, UserId, UserTrialRecord,
};

fn day0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 9, 14, 7, 0, 0).unwrap()
}

#[tokio::test]
async fn test_set_get_remove() {
    let dir = tempdir().unwrap();
    let store = FileLedgerStore::new(dir.path().join("ledgers"));

    assert_eq!(store.get("trial_events_u1").await.unwrap(), None);

    store.set("trial_events_u1", "{\"a\":1}").await.unwrap();
    store.set("trial_events_u1", "{\"a\":2}").await.unwrap();
    assert_eq!(
        store.get("trial_events_u1").await.unwrap().as_deref(),
        Some("{\"a\":2}")
    );
    assert!(store.path_for("trial_events_u1").exists());
    assert!(!store.path_for("trial_events_u1").with_extension("tmp").exists());

    store.remove("trial_events_u1").await.unwrap();
    assert_eq!(store.get("trial_events_u1").await.unwrap(), None);

    // Removing what is not there is fine.
    store.remove("trial_events_u1").await.unwrap();
}

#[tokio::test]
async fn test_keys_with_path_characters_stay_inside_root() {
    let dir = tempdir().unwrap();
    let store = FileLedgerStore::new(dir.path());

    store.set("trial_events_../../escape", "x").await.unwrap();

    let path = store.path_for("trial_events_../../escape");
    assert_eq!(path.parent(), Some(dir.path()));
    assert_eq!(
        store.get("trial_events_../../escape").await.unwrap().as_deref(),
        Some("x")
    );
}

#[tokio::test]
async fn test_corrupt_ledger_reads_as_empty() {
    let dir = tempdir().unwrap();
    let store = Arc::new(FileLedgerStore::new(dir.path()));
    let config = TrialConfig::default();
    let user = UserId::from("kid-1");

    std::fs::write(store.path_for(&config.ledger_key(&user)), "{not json").unwrap();

    let book = LedgerBook::new(store, config);
    let ledger = book.load(&user).await.unwrap();
    assert!(ledger.is_empty());
}

#[tokio::test]
async fn test_ledger_survives_restart_of_dispatcher() {
    let dir = tempdir().unwrap();
    let user = UserId::from("kid-1");
    let records = InMemoryRecordStore::new();
    let record = UserTrialRecord::with_window(day0(), day0() + Duration::days(7));
    records.put_record(&user, &record).await.unwrap();
    let sink = RecordingSink::new();
    let gate = DispatchGate::open();

    let build = || {
        SideEffectDispatcher::new(
            TrialConfig::default(),
            Arc::new(FileLedgerStore::new(dir.path())),
            Arc::new(records.clone()),
            Arc::new(sink.clone()),
            Arc::new(sink.clone()),
        )
    };

    build().run_cycle(&user, &record, day0(), &gate).await.unwrap();
    assert_eq!(sink.names(), vec!["trial_start", "trial_day"]);

    build()
        .run_cycle(&user, &record, day0() + Duration::hours(20), &gate)
        .await
        .unwrap();
    assert_eq!(sink.calls().len(), 2);

    let book = LedgerBook::new(
        Arc::new(FileLedgerStore::new(dir.path())),
        TrialConfig::default(),
    );
    let stored: EventLedger = book.load(&user).await.unwrap();
    assert_eq!(stored.trial_start_timestamp(), Some(day0()));
    assert!(stored.is_set(LedgerFlag::Day(0)));

    book.clear(&user).await.unwrap();
    assert!(book.load(&user).await.unwrap().is_empty());
}
