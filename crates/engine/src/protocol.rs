//! Record wire format shared with executors.
//!
//! One request record is written per dispatch; the executor answers with
//! one response record tagged with the same correlation id:
//!
//! ```json
//! { "status": "success", "output": { ... } }
//! { "status": "error", "error_detail": "..." }
//! ```

use std::fmt;

use records::{Record, RecordCreate, RecordEvent};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

pub const REQUEST_TAG: &str = "tool:request";
pub const RESPONSE_TAG: &str = "tool:response";
pub const FEEDBACK_TAG: &str = "workflow:feedback";

/// Links one dispatched step to its response.  Fresh for every dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(Uuid);

impl CorrelationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Tag carried by both the request and the response record.
    pub fn tag(&self) -> String {
        format!("correlation:{}", self.0)
    }

    /// Extract a correlation id from a record's tags.
    pub fn from_tags(tags: &[String]) -> Option<Self> {
        tags.iter()
            .filter_map(|t| t.strip_prefix("correlation:"))
            .find_map(|raw| Uuid::parse_str(raw).ok())
            .map(Self)
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

pub fn run_tag(run_id: Uuid) -> String {
    format!("workflow:{run_id}")
}

pub fn step_tag(step_id: &str) -> String {
    format!("step:{step_id}")
}

// ---------------------------------------------------------------------------
// Request
// ---------------------------------------------------------------------------

/// Context of an outbound request record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolRequest {
    pub executor: String,
    pub input: Value,
    pub correlation_id: CorrelationId,
    pub run_id: Uuid,
    pub step_id: String,
    #[serde(default)]
    pub retries: u32,
}

impl ToolRequest {
    pub fn into_record(self, schema_name: &str) -> RecordCreate {
        let tags = vec![
            REQUEST_TAG.to_owned(),
            run_tag(self.run_id),
            step_tag(&self.step_id),
            self.correlation_id.tag(),
        ];
        let title = format!("{} for step {}", self.executor, self.step_id);
        RecordCreate {
            schema_name: schema_name.to_owned(),
            title: Some(title),
            tags,
            context: json!(self),
        }
    }

    pub fn from_record(record: &Record) -> Option<Self> {
        serde_json::from_value(record.context.clone()).ok()
    }
}

// ---------------------------------------------------------------------------
// Response
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseStatus {
    Success,
    Error,
}

/// Context of an inbound response record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResponse {
    pub status: ResponseStatus,
    #[serde(default)]
    pub output: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_detail: Option<String>,
}

impl ToolResponse {
    pub fn success(output: Value) -> Self {
        Self {
            status: ResponseStatus::Success,
            output,
            error_detail: None,
        }
    }

    pub fn error(detail: impl Into<String>) -> Self {
        Self {
            status: ResponseStatus::Error,
            output: Value::Null,
            error_detail: Some(detail.into()),
        }
    }

    /// Parse a response context; anything unparsable becomes an error response.
    pub fn from_context(context: &Value) -> Self {
        serde_json::from_value(context.clone())
            .unwrap_or_else(|e| Self::error(format!("malformed response: {e}")))
    }

    pub fn into_record(self, schema_name: &str, correlation_id: CorrelationId) -> RecordCreate {
        RecordCreate {
            schema_name: schema_name.to_owned(),
            title: None,
            tags: vec![RESPONSE_TAG.to_owned(), correlation_id.tag()],
            context: json!(self),
        }
    }
}

/// A response matched to its request.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub record_id: Uuid,
    pub correlation_id: CorrelationId,
    pub body: ToolResponse,
}

impl Response {
    pub fn from_record(record: &Record, correlation_id: CorrelationId) -> Self {
        Self {
            record_id: record.id,
            correlation_id,
            body: ToolResponse::from_context(&record.context),
        }
    }

    /// Build from an event that carries its context inline.
    pub fn from_event(event: &RecordEvent, correlation_id: CorrelationId) -> Option<Self> {
        event.context.as_ref().map(|context| Self {
            record_id: event.record_id,
            correlation_id,
            body: ToolResponse::from_context(context),
        })
    }
}
