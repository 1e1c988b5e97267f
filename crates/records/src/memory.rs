//! `InMemoryStore` — a process-local [`RecordStore`] + [`NotificationFeed`].
//!
//! Used by the engine's tests and for local runs without a real store.
//! A few switches let tests reproduce the feed's failure modes: dropped
//! notifications, redelivered notifications, events without inline
//! context, and transient search errors.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{
    EventStream, NotificationFeed, Record, RecordCreate, RecordEvent, RecordFilter, RecordStore,
    StoreError,
};

const FEED_CAPACITY: usize = 1024;

pub struct InMemoryStore {
    records: RwLock<Vec<Record>>,
    events: broadcast::Sender<RecordEvent>,
    mute_events: AtomicBool,
    duplicate_events: AtomicBool,
    inline_context: AtomicBool,
    failing_searches: AtomicUsize,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(FEED_CAPACITY);
        Self {
            records: RwLock::new(Vec::new()),
            events,
            mute_events: AtomicBool::new(false),
            duplicate_events: AtomicBool::new(false),
            inline_context: AtomicBool::new(true),
            failing_searches: AtomicUsize::new(0),
        }
    }

    /// Stop publishing notifications (records are still stored).
    pub fn mute_events(&self, muted: bool) {
        self.mute_events.store(muted, Ordering::SeqCst);
    }

    /// Publish every notification twice.
    pub fn duplicate_events(&self, enabled: bool) {
        self.duplicate_events.store(enabled, Ordering::SeqCst);
    }

    /// Whether events carry the record's context inline.
    pub fn inline_context(&self, enabled: bool) {
        self.inline_context.store(enabled, Ordering::SeqCst);
    }

    /// Make the next `n` calls to `search` fail with `Unavailable`.
    pub fn fail_next_searches(&self, n: usize) {
        self.failing_searches.store(n, Ordering::SeqCst);
    }

    /// Publish an arbitrary event on the feed.
    pub fn publish(&self, event: RecordEvent) {
        // No subscribers is not an error.
        let _ = self.events.send(event);
    }

    /// Snapshot of every stored record, oldest first.
    pub async fn records(&self) -> Vec<Record> {
        self.records.read().await.clone()
    }

    /// Number of subscribers currently attached to the feed.
    pub fn subscriber_count(&self) -> usize {
        self.events.receiver_count()
    }

    fn notify(&self, record: &Record) {
        if self.mute_events.load(Ordering::SeqCst) {
            debug!(record_id = %record.id, "notification dropped (muted)");
            return;
        }
        let mut event = RecordEvent::created(record);
        if !self.inline_context.load(Ordering::SeqCst) {
            event = event.without_context();
        }
        if self.duplicate_events.load(Ordering::SeqCst) {
            self.publish(event.clone());
        }
        self.publish(event);
    }
}

#[async_trait]
impl RecordStore for InMemoryStore {
    async fn create(&self, record: RecordCreate) -> Result<Record, StoreError> {
        if record.schema_name.is_empty() {
            return Err(StoreError::Invalid("schema_name must not be empty".into()));
        }

        let now = Utc::now();
        let stored = Record {
            id: Uuid::new_v4(),
            schema_name: record.schema_name,
            title: record.title,
            tags: record.tags,
            context: record.context,
            version: 1,
            created_at: now,
            updated_at: now,
        };

        self.records.write().await.push(stored.clone());
        self.notify(&stored);
        Ok(stored)
    }

    async fn search(&self, filter: &RecordFilter) -> Result<Vec<Record>, StoreError> {
        let failing = self
            .failing_searches
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if failing.is_ok() {
            return Err(StoreError::Unavailable("injected search failure".into()));
        }

        let records = self.records.read().await;
        Ok(records
            .iter()
            .rev()
            .filter(|r| filter.matches_record(r))
            .cloned()
            .collect())
    }

    async fn get(&self, id: Uuid) -> Result<Record, StoreError> {
        self.records
            .read()
            .await
            .iter()
            .find(|r| r.id == id)
            .cloned()
            .ok_or(StoreError::NotFound(id))
    }
}

impl NotificationFeed for InMemoryStore {
    fn subscribe(&self) -> Result<EventStream, StoreError> {
        let rx = self.events.subscribe();
        let stream = futures::stream::unfold(rx, |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(event) => return Some((event, rx)),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("feed subscriber lagged, {skipped} notifications skipped");
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });
        Ok(Box::pin(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use serde_json::json;

    #[tokio::test]
    async fn create_then_search_and_get() {
        let store = InMemoryStore::new();
        let rec = store
            .create(RecordCreate::new("s.v1", json!({ "a": 1 })).with_tag("t:1"))
            .await
            .unwrap();
        store
            .create(RecordCreate::new("s.v1", json!({ "a": 2 })).with_tag("t:2"))
            .await
            .unwrap();

        let hits = store.search(&RecordFilter::schema("s.v1").with_tag("t:1")).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, rec.id);

        assert_eq!(store.get(rec.id).await.unwrap().context["a"], 1);
        assert!(matches!(store.get(Uuid::new_v4()).await, Err(StoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn subscribers_only_see_later_events() {
        let store = InMemoryStore::new();
        store.create(RecordCreate::new("s.v1", json!(1))).await.unwrap();

        let mut events = store.subscribe().unwrap();
        let rec = store.create(RecordCreate::new("s.v1", json!(2))).await.unwrap();

        let event = events.next().await.unwrap();
        assert_eq!(event.record_id, rec.id);
        assert_eq!(event.context, Some(json!(2)));
    }

    #[tokio::test]
    async fn muted_feed_still_stores() {
        let store = InMemoryStore::new();
        let mut events = store.subscribe().unwrap();
        store.mute_events(true);
        store.create(RecordCreate::new("s.v1", json!(1))).await.unwrap();
        store.mute_events(false);
        let second = store.create(RecordCreate::new("s.v1", json!(2))).await.unwrap();

        assert_eq!(events.next().await.unwrap().record_id, second.id);
        assert_eq!(store.records().await.len(), 2);
    }

    #[tokio::test]
    async fn injected_search_failures_are_consumed() {
        let store = InMemoryStore::new();
        store.fail_next_searches(2);
        let filter = RecordFilter::default();
        assert!(store.search(&filter).await.is_err());
        assert!(store.search(&filter).await.is_err());
        assert!(store.search(&filter).await.is_ok());
    }

    #[tokio::test]
    async fn dropping_the_stream_unsubscribes() {
        let store = InMemoryStore::new();
        let events = store.subscribe().unwrap();
        assert_eq!(store.subscriber_count(), 1);
        drop(events);
        assert_eq!(store.subscriber_count(), 0);
    }
}
