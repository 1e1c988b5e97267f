//! Store-level error type.

use thiserror::Error;
use uuid::Uuid;

/// Errors returned by a [`crate::RecordStore`] or [`crate::NotificationFeed`].
#[derive(Debug, Error, Clone)]
pub enum StoreError {
    /// No record exists with the given id.
    #[error("record not found: {0}")]
    NotFound(Uuid),

    /// The store could not be reached or refused the call; callers may retry.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// The notification feed could not be subscribed to.
    #[error("subscription failed: {0}")]
    Subscription(String),

    /// The record payload was rejected.
    #[error("invalid record: {0}")]
    Invalid(String),
}
