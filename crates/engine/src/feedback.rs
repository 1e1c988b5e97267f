//! Structured diagnostics for failed steps.
//!
//! After a run the orchestrator hands one [`FeedbackReport`] per
//! classifiable failure to the configured [`FeedbackHook`].  The hook is a
//! side effect only: whatever it returns, the run outcome is unchanged.

use std::collections::BTreeSet;
use std::sync::Arc;

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use records::{RecordCreate, RecordStore};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::dag::DependencyGraph;
use crate::error::StepErrorKind;
use crate::interpolate::{PathSegment, Reference, UnresolvedReason};
use crate::models::{ResultMap, StepFailure, StepResult};
use crate::protocol::{run_tag, step_tag, FEEDBACK_TAG};

// ---------------------------------------------------------------------------
// Report
// ---------------------------------------------------------------------------

/// Everything a caller needs to suggest a fix for one failed step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedbackReport {
    pub run_id: Uuid,
    pub workflow_id: Uuid,
    pub step_id: String,
    pub executor_ref: String,
    pub kind: StepErrorKind,
    pub detail: String,
    /// The offending reference expression, as written.
    pub reference: Option<String>,
    pub referenced_step: Option<String>,
    /// Type skeleton of the referenced step's actual output.
    pub output_shape: Option<Value>,
    /// A corrected expression that resolves against the actual output.
    pub suggestion: Option<String>,
    pub declared_dependencies: BTreeSet<String>,
    pub detected_dependencies: BTreeSet<String>,
}

impl FeedbackReport {
    pub fn from_failure(
        run_id: Uuid,
        workflow_id: Uuid,
        failure: &StepFailure,
        graph: &DependencyGraph,
        results: &ResultMap,
    ) -> Self {
        let unresolved = failure.unresolved.first();
        let referenced_step = unresolved
            .map(|u| u.step_id.clone())
            .filter(|id| !id.is_empty());
        let referenced_output = referenced_step
            .as_deref()
            .and_then(|id| results.get(id))
            .and_then(StepResult::output);

        let suggestion = match (unresolved, referenced_output) {
            (Some(u), Some(output)) if matches!(u.reason, UnresolvedReason::MissingPath { .. }) => {
                suggest(&u.expression, output)
            }
            _ => None,
        };

        Self {
            run_id,
            workflow_id,
            step_id: failure.step_id.clone(),
            executor_ref: failure.executor_ref.clone(),
            kind: failure.kind,
            detail: failure.detail.clone(),
            reference: unresolved.map(|u| u.expression.clone()),
            referenced_step,
            output_shape: referenced_output.map(shape_of),
            suggestion,
            declared_dependencies: graph
                .declared_of(&failure.step_id)
                .cloned()
                .unwrap_or_default(),
            detected_dependencies: graph
                .detected_of(&failure.step_id)
                .cloned()
                .unwrap_or_default(),
        }
    }
}

/// Replace every leaf of `value` with the name of its JSON type.  Arrays keep
/// the shape of their first element only.
pub fn shape_of(value: &Value) -> Value {
    match value {
        Value::Null => Value::from("null"),
        Value::Bool(_) => Value::from("boolean"),
        Value::Number(_) => Value::from("number"),
        Value::String(_) => Value::from("string"),
        Value::Array(items) => Value::Array(items.first().map(shape_of).into_iter().collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(key, item)| (key.clone(), shape_of(item)))
                .collect::<Map<_, _>>(),
        ),
    }
}

/// Propose a corrected `${...}` expression for a reference whose path does
/// not exist in `output`.
///
/// Two repairs are tried in order: dropping the missing segment, then
/// re-rooting it at another place in the output where a key of that name
/// exists.  A candidate is only returned if it actually resolves.
pub fn suggest(expression: &str, output: &Value) -> Option<String> {
    let reference = Reference::parse(strip_delimiters(expression)?)?;
    let missing = (0..reference.path.len()).find(|&i| {
        let prefix = Reference {
            step_id: reference.step_id.clone(),
            path: reference.path[..=i].to_vec(),
        };
        prefix.extract(output).is_err()
    })?;

    let rest = &reference.path[missing + 1..];
    let mut candidates = Vec::new();

    let mut dropped = reference.path[..missing].to_vec();
    dropped.extend_from_slice(rest);
    candidates.push(dropped);

    if let PathSegment::Key(key) = &reference.path[missing] {
        let mut found = Vec::new();
        paths_ending_in(output, key, &mut Vec::new(), &mut found);
        for mut path in found {
            path.extend_from_slice(rest);
            candidates.push(path);
        }
    }

    candidates
        .into_iter()
        .filter(|path| !path.is_empty())
        .map(|path| Reference {
            step_id: reference.step_id.clone(),
            path,
        })
        .find(|candidate| candidate.extract(output).is_ok())
        .map(|candidate| format!("${{{candidate}}}"))
}

fn strip_delimiters(expression: &str) -> Option<&str> {
    expression
        .strip_prefix("${")
        .and_then(|e| e.strip_suffix('}'))
        .or_else(|| {
            expression
                .strip_prefix("{{")
                .and_then(|e| e.strip_suffix("}}"))
        })
}

fn paths_ending_in(
    value: &Value,
    key: &str,
    prefix: &mut Vec<PathSegment>,
    found: &mut Vec<Vec<PathSegment>>,
) {
    match value {
        Value::Object(map) => {
            for (name, item) in map {
                prefix.push(PathSegment::Key(name.clone()));
                if name == key {
                    found.push(prefix.clone());
                }
                paths_ending_in(item, key, prefix, found);
                prefix.pop();
            }
        }
        Value::Array(items) => {
            for (i, item) in items.iter().enumerate() {
                prefix.push(PathSegment::Index(i));
                paths_ending_in(item, key, prefix, found);
                prefix.pop();
            }
        }
        _ => {}
    }
}

// ---------------------------------------------------------------------------
// Hooks
// ---------------------------------------------------------------------------

#[async_trait]
pub trait FeedbackHook: Send + Sync {
    async fn on_failure(&self, report: &FeedbackReport) -> anyhow::Result<()>;
}

/// Discards every report.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopFeedback;

#[async_trait]
impl FeedbackHook for NoopFeedback {
    async fn on_failure(&self, _report: &FeedbackReport) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Forwards reports to an in-process consumer.
#[derive(Debug, Clone)]
pub struct ChannelFeedback {
    tx: mpsc::UnboundedSender<FeedbackReport>,
}

impl ChannelFeedback {
    pub fn new(tx: mpsc::UnboundedSender<FeedbackReport>) -> Self {
        Self { tx }
    }

    /// A hook together with the receiving end.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<FeedbackReport>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl FeedbackHook for ChannelFeedback {
    async fn on_failure(&self, report: &FeedbackReport) -> anyhow::Result<()> {
        self.tx
            .send(report.clone())
            .map_err(|_| anyhow!("feedback receiver dropped"))
    }
}

/// Writes each report as a feedback record so external consumers can
/// subscribe to it.
pub struct RecordFeedback {
    store: Arc<dyn RecordStore>,
    schema_name: String,
}

impl RecordFeedback {
    pub fn new(store: Arc<dyn RecordStore>, schema_name: impl Into<String>) -> Self {
        Self {
            store,
            schema_name: schema_name.into(),
        }
    }
}

#[async_trait]
impl FeedbackHook for RecordFeedback {
    async fn on_failure(&self, report: &FeedbackReport) -> anyhow::Result<()> {
        let context = serde_json::to_value(report).context("serializing feedback report")?;
        let record = RecordCreate::new(self.schema_name.clone(), context)
            .with_title(format!("{} in step {}", report.kind, report.step_id))
            .with_tag(FEEDBACK_TAG)
            .with_tag(run_tag(report.run_id))
            .with_tag(step_tag(&report.step_id));
        self.store
            .create(record)
            .await
            .context("writing feedback record")?;
        Ok(())
    }
}
