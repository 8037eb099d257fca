use crate::core::{Result, TrialError, TrialRecordPatch, UserId, UserTrialRecord};
use crate::interface::{RecordFeed, RecordStore, RecordWriter};
use async_trait::async_trait;
use futures::stream;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::RwLock;
use tokio::sync::broadcast::{self, error::RecvError};

const SIGNAL_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
enum StoreSignal {
    Changed(UserId),
    Disconnected(UserId, String),
}

struct StoreInner {
    /// Raw documents, so malformed records can be stored and observed.
    documents: RwLock<HashMap<UserId, Value>>,
    signals: broadcast::Sender<StoreSignal>,
    writes_available: AtomicBool,
    updates: AtomicUsize,
}

/// Document store with a per-user change feed.
///
/// Stands in for the remote profile store. Clones share the same data.
/// Besides plain reads and writes it can simulate a feed disconnect
/// ([`disconnect`](Self::disconnect)) and rejected writes
/// ([`set_writes_available`](Self::set_writes_available)).
#[derive(Clone)]
pub struct InMemoryRecordStore {
    inner: Arc<StoreInner>,
}

impl Default for InMemoryRecordStore {
    fn default() -> Self {
        let (signals, _) = broadcast::channel(SIGNAL_CAPACITY);
        Self {
            inner: Arc::new(StoreInner {
                documents: RwLock::new(HashMap::new()),
                signals,
                writes_available: AtomicBool::new(true),
                updates: AtomicUsize::new(0),
            }),
        }
    }
}

impl InMemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the record of `user_id`.
    pub async fn put_record(&self, user_id: &UserId, record: &UserTrialRecord) -> Result<()> {
        let document = record.to_document()?;
        self.put_document(user_id, document).await;
        Ok(())
    }

    /// Replace the raw document of `user_id`, valid or not.
    pub async fn put_document(&self, user_id: &UserId, document: Value) {
        self.inner
            .documents
            .write()
            .await
            .insert(user_id.clone(), document);
        self.notify(StoreSignal::Changed(user_id.clone()));
    }

    pub async fn remove(&self, user_id: &UserId) {
        self.inner.documents.write().await.remove(user_id);
        self.notify(StoreSignal::Changed(user_id.clone()));
    }

    pub async fn document(&self, user_id: &UserId) -> Option<Value> {
        self.inner.documents.read().await.get(user_id).cloned()
    }

    /// Push a transport error into every open feed of `user_id`.
    pub fn disconnect(&self, user_id: &UserId, reason: &str) {
        self.notify(StoreSignal::Disconnected(
            user_id.clone(),
            reason.to_string(),
        ));
    }

    pub fn set_writes_available(&self, available: bool) {
        self.inner
            .writes_available
            .store(available, Ordering::SeqCst);
    }

    /// Number of successful `RecordWriter::update` calls.
    pub fn update_count(&self) -> usize {
        self.inner.updates.load(Ordering::SeqCst)
    }

    fn notify(&self, signal: StoreSignal) {
        // No receivers just means nobody is watching.
        let _ = self.inner.signals.send(signal);
    }
}

#[async_trait]
impl RecordStore for InMemoryRecordStore {
    async fn get(&self, user_id: &UserId) -> Result<Option<UserTrialRecord>> {
        let documents = self.inner.documents.read().await;
        documents
            .get(user_id)
            .map(|doc| UserTrialRecord::from_document(user_id, doc))
            .transpose()
    }

    async fn watch(&self, user_id: &UserId) -> Result<RecordFeed> {
        // Subscribe before the initial read so no change can slip in between.
        let signals = self.inner.signals.subscribe();
        let state = (self.clone(), user_id.clone(), signals, true);

        let feed = stream::unfold(state, |(store, user_id, mut signals, first)| async move {
            if first {
                let item = store.get(&user_id).await;
                return Some((item, (store, user_id, signals, false)));
            }

            loop {
                let item = match signals.recv().await {
                    Ok(StoreSignal::Changed(changed)) if changed == user_id => {
                        store.get(&user_id).await
                    }
                    Ok(StoreSignal::Disconnected(target, reason)) if target == user_id => {
                        Err(TrialError::Subscription(reason))
                    }
                    Ok(_) => continue,
                    Err(RecvError::Lagged(_)) => store.get(&user_id).await,
                    Err(RecvError::Closed) => return None,
                };
                return Some((item, (store, user_id, signals, false)));
            }
        });

        Ok(Box::pin(feed))
    }
}

#[async_trait]
impl RecordWriter for InMemoryRecordStore {
    async fn update(&self, user_id: &UserId, patch: &TrialRecordPatch) -> Result<()> {
        if !self.inner.writes_available.load(Ordering::SeqCst) {
            return Err(TrialError::Persistence(format!(
                "record store rejected update for user '{}'",
                user_id
            )));
        }

        let fields = match serde_json::to_value(patch)? {
            Value::Object(fields) => fields,
            _ => Map::new(),
        };

        {
            let mut documents = self.inner.documents.write().await;
            let document = documents
                .entry(user_id.clone())
                .or_insert_with(|| Value::Object(Map::new()));
            if !document.is_object() {
                *document = Value::Object(Map::new());
            }
            if let Value::Object(existing) = document {
                for (key, value) in fields {
                    existing.insert(key, value);
                }
            }
        }

        self.inner.updates.fetch_add(1, Ordering::SeqCst);
        self.notify(StoreSignal::Changed(user_id.clone()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};
    use futures::StreamExt;
    use serde_json::json;

    #[tokio::test]
    async fn test_update_merges_into_document() {
        let store = InMemoryRecordStore::new();
        let user = UserId::from("u1");
        store
            .put_document(&user, json!({"trial_used": false, "nickname": "kit"}))
            .await;

        store
            .update(&user, &TrialRecordPatch::mark_trial_used())
            .await
            .unwrap();

        assert_eq!(
            store.document(&user).await,
            Some(json!({"trial_used": true, "nickname": "kit"}))
        );
        assert_eq!(store.update_count(), 1);
    }

    #[tokio::test]
    async fn test_rejected_writes() {
        let store = InMemoryRecordStore::new();
        store.set_writes_available(false);
        let err = store
            .update(&UserId::from("u1"), &TrialRecordPatch::mark_grace_used())
            .await
            .unwrap_err();
        assert!(matches!(err, TrialError::Persistence(_)));
        assert_eq!(store.update_count(), 0);
    }

    #[tokio::test]
    async fn test_watch_emits_current_then_changes() {
        let store = InMemoryRecordStore::new();
        let user = UserId::from("u1");
        let other = UserId::from("u2");
        let start = Utc.with_ymd_and_hms(2026, 7, 1, 0, 0, 0).unwrap();

        let mut feed = store.watch(&user).await.unwrap();
        assert_eq!(feed.next().await.unwrap().unwrap(), None);

        store
            .put_record(&other, &UserTrialRecord::default())
            .await
            .unwrap();
        let record = UserTrialRecord::with_window(start, start + Duration::days(7));
        store.put_record(&user, &record).await.unwrap();
        assert_eq!(feed.next().await.unwrap().unwrap(), Some(record));

        store.disconnect(&user, "socket closed");
        assert!(matches!(
            feed.next().await.unwrap(),
            Err(TrialError::Subscription(_))
        ));

        store.put_document(&user, json!({"trial_start": 12})).await;
        assert!(feed.next().await.unwrap().unwrap().is_some());

        store.put_document(&user, json!({"trial_start": "soon"})).await;
        assert!(matches!(
            feed.next().await.unwrap(),
            Err(TrialError::MalformedRecord { .. })
        ));
    }
}
