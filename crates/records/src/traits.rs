//! The store and feed contracts the engine is written against.

use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use uuid::Uuid;

use crate::{Record, RecordCreate, RecordEvent, RecordFilter, StoreError};

/// Live sequence of store notifications.  Dropping it unsubscribes.
pub type EventStream = Pin<Box<dyn Stream<Item = RecordEvent> + Send>>;

/// Create/search/get over tagged, schema-typed records.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Persist a new record and return it with its assigned id.
    async fn create(&self, record: RecordCreate) -> Result<Record, StoreError>;

    /// Return every record matching `filter`, newest first.
    async fn search(&self, filter: &RecordFilter) -> Result<Vec<Record>, StoreError>;

    /// Fetch a single record by id.
    async fn get(&self, id: Uuid) -> Result<Record, StoreError>;
}

/// The store's notification feed.
///
/// Delivery is at-least-once with no ordering guarantee; a subscriber only
/// sees events published after it subscribed.
pub trait NotificationFeed: Send + Sync {
    fn subscribe(&self) -> Result<EventStream, StoreError>;
}
