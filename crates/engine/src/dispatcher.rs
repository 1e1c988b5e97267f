//! One outbound request per step, one awaited response.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use records::RecordStore;
use serde_json::Value;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::correlator::{Correlator, Resolution};
use crate::dag::DependencyGraph;
use crate::error::StepErrorKind;
use crate::interpolate::{resolve, UnresolvedRef};
use crate::models::{ResultMap, StepDefinition, StepResult};
use crate::protocol::{CorrelationId, ResponseStatus, ToolRequest};

/// Everything the scheduler needs to know about one dispatch.
#[derive(Debug, Clone)]
pub struct Dispatched {
    pub result: StepResult,
    /// `None` when the step failed before a request was written.
    pub correlation_id: Option<CorrelationId>,
    pub resolved_input: Option<Value>,
    /// References that could not be resolved (required or not).
    pub unresolved: Vec<UnresolvedRef>,
    pub timeout: Duration,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

pub struct Dispatcher {
    store: Arc<dyn RecordStore>,
    correlator: Arc<Correlator>,
    config: EngineConfig,
}

impl Dispatcher {
    pub fn new(store: Arc<dyn RecordStore>, correlator: Arc<Correlator>, config: EngineConfig) -> Self {
        Self {
            store,
            correlator,
            config,
        }
    }

    /// Resolve the step's input against `results`, write the request record
    /// and wait for the matching response within the step's timeout.
    #[instrument(skip_all, fields(run_id = %run_id, step_id = %step.id))]
    pub async fn dispatch(
        &self,
        run_id: Uuid,
        graph: &DependencyGraph,
        step: &StepDefinition,
        results: &ResultMap,
    ) -> Dispatched {
        let started_at = Utc::now();
        let timeout = self.config.step_timeout(step.timeout_ms);

        // ------------------------------------------------------------------
        // Interpolate.  References to names that aren't steps are literals.
        // ------------------------------------------------------------------
        let interpolated = resolve(&step.input, results);
        let unresolved: Vec<UnresolvedRef> = interpolated
            .unresolved
            .into_iter()
            .filter(|u| graph.contains(&u.step_id))
            .collect();
        let required: Vec<&UnresolvedRef> = unresolved
            .iter()
            .filter(|u| {
                u.top_level_field()
                    .map_or(true, |key| !step.optional_inputs.iter().any(|o| o == key))
            })
            .collect();

        if !required.is_empty() {
            let detail = required
                .iter()
                .map(|u| format!("{} at {}", u.expression, display_field(&u.field)))
                .collect::<Vec<_>>()
                .join(", ");
            warn!(%detail, "unresolved references; step not dispatched");
            return Dispatched {
                result: StepResult::Failure {
                    kind: StepErrorKind::Interpolation,
                    detail: format!("unresolved reference(s): {detail}"),
                },
                correlation_id: None,
                resolved_input: Some(interpolated.value),
                unresolved,
                timeout,
                started_at,
                finished_at: Utc::now(),
            };
        }
        if !unresolved.is_empty() {
            debug!(count = unresolved.len(), "optional references left unresolved");
        }

        // ------------------------------------------------------------------
        // Issue the request.
        // ------------------------------------------------------------------
        let correlation_id = CorrelationId::new();
        let request = ToolRequest {
            executor: step.executor_ref.clone(),
            input: interpolated.value.clone(),
            correlation_id,
            run_id,
            step_id: step.id.clone(),
            retries: step.retries,
        };

        if let Err(e) = self
            .store
            .create(request.into_record(&self.config.request_schema))
            .await
        {
            warn!(error = %e, "request record rejected");
            return Dispatched {
                result: StepResult::Failure {
                    kind: StepErrorKind::Dispatch,
                    detail: e.to_string(),
                },
                correlation_id: None,
                resolved_input: Some(interpolated.value),
                unresolved,
                timeout,
                started_at,
                finished_at: Utc::now(),
            };
        }
        info!(%correlation_id, executor = %step.executor_ref, "request issued");

        // ------------------------------------------------------------------
        // Await the response.
        // ------------------------------------------------------------------
        let result = match self
            .correlator
            .await_response(correlation_id, &step.id, timeout)
            .await
        {
            Resolution::Response(response) => match response.body.status {
                ResponseStatus::Success => StepResult::Success {
                    output: response.body.output,
                },
                ResponseStatus::Error => StepResult::Failure {
                    kind: StepErrorKind::Executor,
                    detail: response
                        .body
                        .error_detail
                        .unwrap_or_else(|| "executor reported an error".into()),
                },
            },
            Resolution::TimedOut => StepResult::TimedOut,
        };

        Dispatched {
            result,
            correlation_id: Some(correlation_id),
            resolved_input: Some(interpolated.value),
            unresolved,
            timeout,
            started_at,
            finished_at: Utc::now(),
        }
    }
}

fn display_field(pointer: &str) -> &str {
    if pointer.is_empty() {
        "input"
    } else {
        pointer
    }
}
