//! Record, filter and event types shared by every store implementation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Record
// ---------------------------------------------------------------------------

/// A persisted, schema-typed, tag-searchable unit of data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub id: Uuid,
    pub schema_name: String,
    pub title: Option<String>,
    pub tags: Vec<String>,
    /// Free-form JSON payload.
    pub context: serde_json::Value,
    pub version: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Record {
    /// `true` if the record carries `tag`.
    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t == tag)
    }
}

/// Payload for [`crate::RecordStore::create`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordCreate {
    pub schema_name: String,
    pub title: Option<String>,
    pub tags: Vec<String>,
    pub context: serde_json::Value,
}

impl RecordCreate {
    pub fn new(schema_name: impl Into<String>, context: serde_json::Value) -> Self {
        Self {
            schema_name: schema_name.into(),
            title: None,
            tags: Vec::new(),
            context,
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }
}

// ---------------------------------------------------------------------------
// RecordFilter
// ---------------------------------------------------------------------------

/// Search selector.  Every populated criterion must match.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordFilter {
    /// Exact schema name.
    pub schema_name: Option<String>,
    /// Every tag listed here must be present on the record.
    #[serde(default)]
    pub all_tags: Vec<String>,
    /// At least one of these tags must be present (ignored when empty).
    #[serde(default)]
    pub any_tags: Vec<String>,
}

impl RecordFilter {
    pub fn schema(schema_name: impl Into<String>) -> Self {
        Self {
            schema_name: Some(schema_name.into()),
            ..Self::default()
        }
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.all_tags.push(tag.into());
        self
    }

    pub fn with_any_tag(mut self, tag: impl Into<String>) -> Self {
        self.any_tags.push(tag.into());
        self
    }

    /// Test the filter against the metadata carried by a record or event.
    pub fn matches(&self, schema_name: Option<&str>, tags: &[String]) -> bool {
        if let Some(wanted) = &self.schema_name {
            if schema_name != Some(wanted.as_str()) {
                return false;
            }
        }
        if !self.all_tags.iter().all(|t| tags.contains(t)) {
            return false;
        }
        self.any_tags.is_empty() || self.any_tags.iter().any(|t| tags.contains(t))
    }

    pub fn matches_record(&self, record: &Record) -> bool {
        self.matches(Some(&record.schema_name), &record.tags)
    }

    pub fn matches_event(&self, event: &RecordEvent) -> bool {
        self.matches(event.schema_name.as_deref(), &event.tags)
    }
}

// ---------------------------------------------------------------------------
// RecordEvent
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Created,
    Updated,
}

/// A notification published by the store when a record changes.
///
/// Carries enough metadata to test tag membership without a fetch; the
/// `context` is included only by feeds that inline it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordEvent {
    pub kind: EventKind,
    pub record_id: Uuid,
    pub schema_name: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    pub context: Option<serde_json::Value>,
}

impl RecordEvent {
    pub fn created(record: &Record) -> Self {
        Self {
            kind: EventKind::Created,
            record_id: record.id,
            schema_name: Some(record.schema_name.clone()),
            tags: record.tags.clone(),
            context: Some(record.context.clone()),
        }
    }

    /// The same event with the inline context stripped.
    pub fn without_context(mut self) -> Self {
        self.context = None;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tags(list: &[&str]) -> Vec<String> {
        list.iter().map(|t| t.to_string()).collect()
    }

    #[test]
    fn filter_requires_schema_and_all_tags() {
        let filter = RecordFilter::schema("tool.response.v1").with_tag("correlation:1");

        assert!(filter.matches(Some("tool.response.v1"), &tags(&["correlation:1", "x"])));
        assert!(!filter.matches(Some("tool.request.v1"), &tags(&["correlation:1"])));
        assert!(!filter.matches(Some("tool.response.v1"), &tags(&["correlation:2"])));
        assert!(!filter.matches(None, &tags(&["correlation:1"])));
    }

    #[test]
    fn any_tags_needs_one_overlap() {
        let filter = RecordFilter::default().with_any_tag("a").with_any_tag("b");
        assert!(filter.matches(None, &tags(&["b"])));
        assert!(!filter.matches(None, &tags(&["c"])));
        assert!(RecordFilter::default().matches(None, &[]));
    }
}
