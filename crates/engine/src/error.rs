//! Engine-level error types.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors produced by the workflow engine (validation + execution).
#[derive(Debug, Error)]
pub enum EngineError {
    // ------ Validation errors ------

    /// The workflow contains no steps.
    #[error("workflow has no steps")]
    EmptyWorkflow,

    /// Two or more steps share the same ID.
    #[error("duplicate step ID: '{0}'")]
    DuplicateStepId(String),

    /// A step depends on a step ID that doesn't exist in the workflow.
    #[error("step '{step_id}' depends on unknown step '{dependency}'")]
    UnknownDependency {
        step_id: String,
        dependency: String,
    },

    /// Leveling found a cycle; `cycle` lists it with the first ID repeated at the end.
    #[error("dependency cycle: {}", cycle.join(" -> "))]
    CyclicDependency { cycle: Vec<String> },

    /// `return_step` names a step that doesn't exist.
    #[error("return step '{0}' is not part of the workflow")]
    UnknownReturnStep(String),

    // ------ Execution errors ------

    /// A step failed and `continue_on_error` was off; the run was aborted.
    #[error("step '{step_id}' failed ({kind}): {detail}")]
    StepFailed {
        step_id: String,
        kind: StepErrorKind,
        detail: String,
    },

    /// Invalid engine configuration.
    #[error("configuration error: {0}")]
    Config(String),
}

/// Classification of a step-local failure.
///
/// The three user-facing classes (timeout, executor error, unresolvable
/// input) call for different fixes and are never merged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Error)]
#[serde(rename_all = "snake_case")]
pub enum StepErrorKind {
    /// A required reference in the step's input could not be resolved.
    #[error("input could not be resolved")]
    Interpolation,
    /// The executor answered with an error.
    #[error("executor reported an error")]
    Executor,
    /// No matching response arrived within the step's timeout.
    #[error("timed out waiting for executor")]
    Timeout,
    /// A dependency did not succeed, so the step was never dispatched.
    #[error("dependency failed")]
    DependencyFailed,
    /// The outbound request record could not be written.
    #[error("request could not be dispatched")]
    Dispatch,
}
