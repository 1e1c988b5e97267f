//! Workflow orchestration.
//!
//! `Orchestrator` is the entry point of the engine:
//! 1. Builds and validates the dependency graph and the return step.
//! 2. Drives the [`Scheduler`] level by level until completion or abort.
//! 3. Reports every classifiable failure to the feedback hook.
//! 4. Selects the run's output.

use std::sync::Arc;

use records::{NotificationFeed, RecordStore};
use serde_json::Value;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::correlator::Correlator;
use crate::dag::DependencyGraph;
use crate::dispatcher::Dispatcher;
use crate::error::{EngineError, StepErrorKind};
use crate::feedback::{FeedbackHook, FeedbackReport, NoopFeedback, RecordFeedback};
use crate::models::{ResultMap, RunOutcome, StepResult, Workflow};
use crate::scheduler::{ScheduleReport, Scheduler};

/// Runs workflows against one record store and notification feed.
///
/// Construct one orchestrator per process; concurrent runs share its
/// correlator and never see each other's responses.
pub struct Orchestrator {
    store: Arc<dyn RecordStore>,
    correlator: Arc<Correlator>,
    dispatcher: Dispatcher,
    feedback: Arc<dyn FeedbackHook>,
    config: EngineConfig,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn RecordStore>,
        feed: Arc<dyn NotificationFeed>,
        config: EngineConfig,
    ) -> Self {
        let correlator = Arc::new(Correlator::new(store.clone(), feed, &config));
        let dispatcher = Dispatcher::new(store.clone(), correlator.clone(), config.clone());
        Self {
            store,
            correlator,
            dispatcher,
            feedback: Arc::new(NoopFeedback),
            config,
        }
    }

    /// Replace the feedback hook (the default discards reports).
    pub fn with_feedback(mut self, hook: Arc<dyn FeedbackHook>) -> Self {
        self.feedback = hook;
        self
    }

    /// Write feedback reports to the record store under the configured schema.
    pub fn with_record_feedback(self) -> Self {
        let hook = RecordFeedback::new(self.store.clone(), self.config.feedback_schema.clone());
        self.with_feedback(Arc::new(hook))
    }

    pub fn correlator(&self) -> &Arc<Correlator> {
        &self.correlator
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Validate `workflow` without running it.
    ///
    /// # Errors
    /// Any graph validation error, or [`EngineError::UnknownReturnStep`].
    pub fn plan(&self, workflow: &Workflow) -> Result<DependencyGraph, EngineError> {
        DependencyGraph::for_workflow(workflow)
    }

    /// Run the workflow to completion.
    ///
    /// # Errors
    /// Validation errors surface before anything is dispatched.  With
    /// `continue_on_error` off, the first step failure aborts the remaining
    /// levels and is returned as [`EngineError::StepFailed`]; with it on,
    /// failures are collected in [`RunOutcome::failures`] instead.
    #[instrument(skip(self, workflow), fields(workflow_id = %workflow.id, run_id))]
    pub async fn run_workflow(&self, workflow: &Workflow) -> Result<RunOutcome, EngineError> {
        let graph = self.plan(workflow)?;
        let run_id = Uuid::new_v4();
        tracing::Span::current().record("run_id", tracing::field::display(run_id));
        info!(
            steps = workflow.steps.len(),
            levels = graph.levels().len(),
            "starting run"
        );

        let ScheduleReport {
            results,
            trace,
            failures,
            aborted,
        } = Scheduler::new(&self.dispatcher).run(run_id, workflow, &graph).await;

        for failure in &failures {
            if failure.kind == StepErrorKind::DependencyFailed {
                continue;
            }
            let report =
                FeedbackReport::from_failure(run_id, workflow.id, failure, &graph, &results);
            let delivery = self.feedback.on_failure(&report);
            match tokio::time::timeout(self.config.feedback_timeout, delivery).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!(step_id = %failure.step_id, error = %e, "feedback hook failed");
                }
                Err(_) => warn!(
                    step_id = %failure.step_id,
                    timeout = ?self.config.feedback_timeout,
                    "feedback hook timed out"
                ),
            }
        }

        if let Some(failure) = aborted {
            return Err(EngineError::StepFailed {
                step_id: failure.step_id,
                kind: failure.kind,
                detail: failure.detail,
            });
        }

        let output = returning_step(workflow, &graph)
            .and_then(|id| output_of(&results, id));

        info!(
            succeeded = results.values().filter(|r| r.is_success()).count(),
            failed = failures.len(),
            "run finished"
        );

        Ok(RunOutcome {
            run_id,
            workflow_id: workflow.id,
            trace,
            results,
            output,
            failures,
        })
    }
}

/// `return_step` if set, else the sole step of the last level, else the
/// last-declared step of that level.
fn returning_step<'a>(workflow: &'a Workflow, graph: &'a DependencyGraph) -> Option<&'a str> {
    match &workflow.options.return_step {
        Some(step_id) => Some(step_id.as_str()),
        None => graph
            .levels()
            .last()
            .and_then(|level| level.last())
            .map(String::as_str),
    }
}

fn output_of(results: &ResultMap, step_id: &str) -> Option<Value> {
    results
        .get(step_id)
        .and_then(StepResult::output)
        .cloned()
}
