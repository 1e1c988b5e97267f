//! Core domain models for the orchestration engine.
//!
//! A [`Workflow`] is the immutable input of a run; [`StepResult`],
//! [`TraceEntry`] and [`RunOutcome`] are what a run produces.  Workflow
//! definitions deserialize from JSON in either snake_case or the
//! camelCase spelling agents tend to emit.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::StepErrorKind;
use crate::interpolate::UnresolvedRef;
use crate::protocol::CorrelationId;

// ---------------------------------------------------------------------------
// StepDefinition
// ---------------------------------------------------------------------------

/// A single tool call in the workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepDefinition {
    /// Unique identifier within this workflow (referenced by `${id...}`).
    pub id: String,
    /// Opaque identifier of the external executor; never interpreted here.
    #[serde(alias = "executorRef", alias = "tool")]
    pub executor_ref: String,
    /// Input payload, possibly containing reference expressions.
    #[serde(default)]
    pub input: Value,
    /// Steps that must complete first, in addition to detected references.
    #[serde(default, alias = "declaredDependencies", alias = "dependencies")]
    pub depends_on: Vec<String>,
    /// Per-step timeout override.
    #[serde(default, alias = "timeoutMs")]
    pub timeout_ms: Option<u64>,
    /// Forwarded to the executor; the scheduler never retries on its own.
    #[serde(default)]
    pub retries: u32,
    /// Top-level input keys whose references may stay unresolved.
    #[serde(default, alias = "optionalInputs")]
    pub optional_inputs: Vec<String>,
}

impl StepDefinition {
    /// Convenience constructor for testing.
    pub fn new(id: impl Into<String>, executor_ref: impl Into<String>, input: Value) -> Self {
        Self {
            id: id.into(),
            executor_ref: executor_ref.into(),
            input,
            depends_on: Vec::new(),
            timeout_ms: None,
            retries: 0,
            optional_inputs: Vec::new(),
        }
    }

    pub fn depends_on(mut self, ids: &[&str]) -> Self {
        self.depends_on = ids.iter().map(|id| id.to_string()).collect();
        self
    }

    pub fn timeout_ms(mut self, ms: u64) -> Self {
        self.timeout_ms = Some(ms);
        self
    }

    pub fn optional_input(mut self, key: impl Into<String>) -> Self {
        self.optional_inputs.push(key.into());
        self
    }
}

// ---------------------------------------------------------------------------
// Workflow
// ---------------------------------------------------------------------------

/// Per-run policy.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunOptions {
    /// Keep running independent branches after a step fails.
    #[serde(default, alias = "continueOnError")]
    pub continue_on_error: bool,
    /// Step whose output becomes the run's output.
    #[serde(default, alias = "returnStep")]
    pub return_step: Option<String>,
}

/// A complete workflow definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    #[serde(default)]
    pub name: String,
    pub steps: Vec<StepDefinition>,
    #[serde(flatten)]
    pub options: RunOptions,
}

impl Workflow {
    /// Convenience constructor for testing.
    pub fn new(name: impl Into<String>, steps: Vec<StepDefinition>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            steps,
            options: RunOptions::default(),
        }
    }

    pub fn continue_on_error(mut self, enabled: bool) -> Self {
        self.options.continue_on_error = enabled;
        self
    }

    pub fn return_step(mut self, step_id: impl Into<String>) -> Self {
        self.options.return_step = Some(step_id.into());
        self
    }

    pub fn step(&self, id: &str) -> Option<&StepDefinition> {
        self.steps.iter().find(|s| s.id == id)
    }
}

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

/// Final state of one step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StepResult {
    Success { output: Value },
    Failure { kind: StepErrorKind, detail: String },
    TimedOut,
}

impl StepResult {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    pub fn output(&self) -> Option<&Value> {
        match self {
            Self::Success { output } => Some(output),
            _ => None,
        }
    }

    /// The error kind, or `None` for a success.
    pub fn error_kind(&self) -> Option<StepErrorKind> {
        match self {
            Self::Success { .. } => None,
            Self::Failure { kind, .. } => Some(*kind),
            Self::TimedOut => Some(StepErrorKind::Timeout),
        }
    }
}

/// Run-scoped results keyed by step id.
pub type ResultMap = HashMap<String, StepResult>;

/// One entry of the run's failure list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepFailure {
    pub step_id: String,
    pub executor_ref: String,
    pub kind: StepErrorKind,
    pub detail: String,
    /// Populated for `Interpolation` failures.
    #[serde(default)]
    pub unresolved: Vec<UnresolvedRef>,
}

// ---------------------------------------------------------------------------
// Trace
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TraceStatus {
    Succeeded,
    Failed,
    TimedOut,
    Skipped,
}

/// Observability record for one step of the run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceEntry {
    pub level: usize,
    pub step_id: String,
    pub correlation_id: Option<CorrelationId>,
    /// The input as dispatched, after interpolation.
    pub resolved_input: Option<Value>,
    pub status: TraceStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

/// Aggregate result of a completed run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunOutcome {
    pub run_id: Uuid,
    pub workflow_id: Uuid,
    /// Ordered by level, then by completion within a level.
    pub trace: Vec<TraceEntry>,
    pub results: ResultMap,
    /// Output of the returning step, if it succeeded.
    pub output: Option<Value>,
    /// Every step failure (only non-empty with `continue_on_error`).
    pub failures: Vec<StepFailure>,
}

impl RunOutcome {
    pub fn output_of(&self, step_id: &str) -> Option<&Value> {
        self.results.get(step_id).and_then(StepResult::output)
    }

    pub fn trace_for(&self, step_id: &str) -> Option<&TraceEntry> {
        self.trace.iter().find(|t| t.step_id == step_id)
    }
}
