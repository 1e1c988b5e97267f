//! Engine configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::EngineError;

/// Tuning knobs and record schema names for the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Step timeout when the step doesn't set `timeout_ms`.
    #[serde(with = "millis")]
    pub default_timeout: Duration,
    /// Interval of the correlator's fallback store poll.
    #[serde(with = "millis")]
    pub poll_interval: Duration,
    /// Upper bound on one feedback hook call.
    #[serde(with = "millis", default = "default_feedback_timeout")]
    pub feedback_timeout: Duration,
    pub request_schema: String,
    pub response_schema: String,
    pub feedback_schema: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_millis(60_000),
            poll_interval: Duration::from_millis(1_000),
            feedback_timeout: default_feedback_timeout(),
            request_schema: "tool.request.v1".into(),
            response_schema: "tool.response.v1".into(),
            feedback_schema: "workflow.feedback.v1".into(),
        }
    }
}

fn default_feedback_timeout() -> Duration {
    Duration::from_millis(5_000)
}

impl EngineConfig {
    /// Defaults overridden by `WORKFLOW_*` environment variables.
    pub fn from_env() -> Result<Self, EngineError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, EngineError> {
        let mut config = Self::default();

        if let Some(ms) = parse_millis(&lookup, "WORKFLOW_DEFAULT_TIMEOUT_MS")? {
            config.default_timeout = ms;
        }
        if let Some(ms) = parse_millis(&lookup, "WORKFLOW_POLL_INTERVAL_MS")? {
            config.poll_interval = ms;
        }
        if let Some(ms) = parse_millis(&lookup, "WORKFLOW_FEEDBACK_TIMEOUT_MS")? {
            config.feedback_timeout = ms;
        }
        if let Some(schema) = lookup("WORKFLOW_REQUEST_SCHEMA") {
            config.request_schema = schema;
        }
        if let Some(schema) = lookup("WORKFLOW_RESPONSE_SCHEMA") {
            config.response_schema = schema;
        }
        if let Some(schema) = lookup("WORKFLOW_FEEDBACK_SCHEMA") {
            config.feedback_schema = schema;
        }

        if config.poll_interval.is_zero() {
            return Err(EngineError::Config("poll interval must be greater than zero".into()));
        }
        Ok(config)
    }

    /// Timeout for a step, falling back to the engine default.
    pub fn step_timeout(&self, timeout_ms: Option<u64>) -> Duration {
        timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(self.default_timeout)
    }
}

fn parse_millis(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<Duration>, EngineError> {
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<u64>()
            .map(|ms| Some(Duration::from_millis(ms)))
            .map_err(|e| EngineError::Config(format!("{key}={raw:?}: {e}"))),
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
