//! `records` crate — the boundary to the external record store.
//!
//! The orchestration engine never talks to a concrete store.  It goes
//! through [`RecordStore`] for create/search/get and [`NotificationFeed`]
//! for the live stream of "record created/updated" events.  The
//! [`memory`] module provides an in-process implementation of both.

pub mod error;
pub mod models;
pub mod traits;
pub mod memory;

pub use error::StoreError;
pub use models::{EventKind, Record, RecordCreate, RecordEvent, RecordFilter};
pub use traits::{EventStream, NotificationFeed, RecordStore};
