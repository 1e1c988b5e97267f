//! Level-by-level parallel execution.
//!
//! Every step of a level is dispatched concurrently and the level is a
//! barrier: results are only published to the result map once all of its
//! steps have settled, so interpolation in level *k+1* always sees a
//! stable view of levels `<= k`.

use futures::stream::{FuturesUnordered, StreamExt};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::dag::DependencyGraph;
use crate::dispatcher::{Dispatched, Dispatcher};
use crate::error::StepErrorKind;
use crate::models::{
    ResultMap, StepDefinition, StepFailure, StepResult, TraceEntry, TraceStatus, Workflow,
};

/// What the scheduler hands back to the orchestrator.
#[derive(Debug, Default)]
pub struct ScheduleReport {
    pub results: ResultMap,
    pub trace: Vec<TraceEntry>,
    /// Every failure, in the order it was observed.
    pub failures: Vec<StepFailure>,
    /// Set when a failure stopped the run (`continue_on_error` off).
    pub aborted: Option<StepFailure>,
}

pub struct Scheduler<'a> {
    dispatcher: &'a Dispatcher,
}

impl<'a> Scheduler<'a> {
    pub fn new(dispatcher: &'a Dispatcher) -> Self {
        Self { dispatcher }
    }

    pub async fn run(
        &self,
        run_id: Uuid,
        workflow: &Workflow,
        graph: &DependencyGraph,
    ) -> ScheduleReport {
        let continue_on_error = workflow.options.continue_on_error;
        let mut report = ScheduleReport::default();

        for (level, ids) in graph.levels().iter().enumerate() {
            let steps: Vec<&StepDefinition> =
                ids.iter().filter_map(|id| workflow.step(id)).collect();

            // --------------------------------------------------------------
            // Steps whose dependencies didn't all succeed are never dispatched.
            // --------------------------------------------------------------
            let mut ready = Vec::with_capacity(steps.len());
            let mut skipped = Vec::new();
            for step in steps {
                let failed_dep = graph.dependencies_of(&step.id).and_then(|deps| {
                    deps.iter()
                        .find(|dep| {
                            !report.results.get(*dep).is_some_and(StepResult::is_success)
                        })
                        .cloned()
                });
                match failed_dep {
                    Some(dep) => skipped.push((step, dep)),
                    None => ready.push(step),
                }
            }

            info!(
                level,
                dispatching = ready.len(),
                skipped = skipped.len(),
                "starting level"
            );

            // --------------------------------------------------------------
            // Dispatch concurrently and wait for the level to settle.
            // --------------------------------------------------------------
            let mut settled: Vec<(&StepDefinition, Dispatched)> = Vec::with_capacity(ready.len());
            let mut aborting = false;
            {
                let results = &report.results;
                let mut in_flight: FuturesUnordered<_> = ready
                    .iter()
                    .map(|&step| async move {
                        let dispatched =
                            self.dispatcher.dispatch(run_id, graph, step, results).await;
                        (step, dispatched)
                    })
                    .collect();

                while let Some((step, dispatched)) = in_flight.next().await {
                    let failed = !dispatched.result.is_success();
                    settled.push((step, dispatched));
                    if failed && !continue_on_error {
                        aborting = true;
                        break;
                    }
                }

                if aborting && !in_flight.is_empty() {
                    // Dropping the futures discards their pending requests.
                    warn!(level, abandoned = in_flight.len(), "abandoning in-flight siblings");
                }
            }

            // --------------------------------------------------------------
            // Barrier passed: publish results.
            // --------------------------------------------------------------
            for (step, dep) in skipped {
                let detail = format!("dependency '{dep}' did not succeed");
                let now = chrono::Utc::now();
                report.trace.push(TraceEntry {
                    level,
                    step_id: step.id.clone(),
                    correlation_id: None,
                    resolved_input: None,
                    status: TraceStatus::Skipped,
                    started_at: now,
                    finished_at: now,
                });
                report.failures.push(StepFailure {
                    step_id: step.id.clone(),
                    executor_ref: step.executor_ref.clone(),
                    kind: StepErrorKind::DependencyFailed,
                    detail: detail.clone(),
                    unresolved: Vec::new(),
                });
                report.results.insert(
                    step.id.clone(),
                    StepResult::Failure {
                        kind: StepErrorKind::DependencyFailed,
                        detail,
                    },
                );
            }

            for (step, dispatched) in settled {
                report.trace.push(TraceEntry {
                    level,
                    step_id: step.id.clone(),
                    correlation_id: dispatched.correlation_id,
                    resolved_input: dispatched.resolved_input.clone(),
                    status: trace_status(&dispatched.result),
                    started_at: dispatched.started_at,
                    finished_at: dispatched.finished_at,
                });

                if let Some(failure) = failure_of(step, &dispatched) {
                    if aborting && report.aborted.is_none() {
                        error!(
                            step_id = %step.id,
                            kind = %failure.kind,
                            detail = %failure.detail,
                            "step failed; aborting run"
                        );
                        report.aborted = Some(failure.clone());
                    } else {
                        warn!(
                            step_id = %step.id,
                            kind = %failure.kind,
                            detail = %failure.detail,
                            "step failed"
                        );
                    }
                    report.failures.push(failure);
                }
                report.results.insert(step.id.clone(), dispatched.result);
            }

            if report.aborted.is_some() {
                break;
            }
        }

        report
    }
}

fn trace_status(result: &StepResult) -> TraceStatus {
    match result {
        StepResult::Success { .. } => TraceStatus::Succeeded,
        StepResult::Failure { .. } => TraceStatus::Failed,
        StepResult::TimedOut => TraceStatus::TimedOut,
    }
}

fn failure_of(step: &StepDefinition, dispatched: &Dispatched) -> Option<StepFailure> {
    let (kind, detail) = match &dispatched.result {
        StepResult::Success { .. } => return None,
        StepResult::Failure { kind, detail } => (*kind, detail.clone()),
        StepResult::TimedOut => (
            StepErrorKind::Timeout,
            format!("no response within {} ms", dispatched.timeout.as_millis()),
        ),
    };
    Some(StepFailure {
        step_id: step.id.clone(),
        executor_ref: step.executor_ref.clone(),
        kind,
        detail,
        unresolved: dispatched.unresolved.clone(),
    })
}
