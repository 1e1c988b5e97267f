//! `MockExecutor` — an in-process stand-in for the external executors.
//!
//! Watches the notification feed for request records and answers each one
//! with a response record according to the behaviour registered for its
//! executor ref.  Useful in tests and local runs where no real executor is
//! attached.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::StreamExt;
use records::{NotificationFeed, RecordEvent, RecordStore, StoreError};
use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::EngineConfig;
use crate::protocol::{ToolRequest, ToolResponse, REQUEST_TAG};

/// What the mock does with a request.
#[derive(Debug, Clone)]
pub enum MockBehaviour {
    /// Answer with a successful response carrying this output.
    Return(Value),
    /// Answer with `{ "input": <resolved input> }`.
    Echo,
    /// Answer with an error response.
    Fail(String),
    /// Never answer.
    Silent,
    /// Answer with this output after a delay.
    Delayed(Duration, Value),
}

/// Builder for [`MockExecutor`].
#[derive(Debug, Default)]
pub struct MockExecutorBuilder {
    routes: HashMap<String, MockBehaviour>,
}

impl MockExecutorBuilder {
    /// Register `behaviour` for requests addressed to `executor_ref`.
    pub fn route(mut self, executor_ref: impl Into<String>, behaviour: MockBehaviour) -> Self {
        self.routes.insert(executor_ref.into(), behaviour);
        self
    }

    /// Subscribe to `feed` and start answering.  Requests written before this
    /// call are never seen.
    pub fn spawn(
        self,
        store: Arc<dyn RecordStore>,
        feed: &dyn NotificationFeed,
        config: &EngineConfig,
    ) -> Result<MockExecutor, StoreError> {
        let mut events = feed.subscribe()?;
        let calls: Arc<Mutex<Vec<ToolRequest>>> = Arc::default();

        let worker = Worker {
            store,
            routes: Arc::new(self.routes),
            calls: calls.clone(),
            request_schema: config.request_schema.clone(),
            response_schema: config.response_schema.clone(),
        };

        let handle = tokio::spawn(async move {
            let mut seen = HashSet::new();
            while let Some(event) = events.next().await {
                if !worker.is_request(&event) || !seen.insert(event.record_id) {
                    continue;
                }
                worker.handle(event).await;
            }
        });

        Ok(MockExecutor { handle, calls })
    }
}

/// A running mock executor.  Stops answering when dropped.
pub struct MockExecutor {
    handle: JoinHandle<()>,
    calls: Arc<Mutex<Vec<ToolRequest>>>,
}

impl MockExecutor {
    pub fn builder() -> MockExecutorBuilder {
        MockExecutorBuilder::default()
    }

    /// Every request received so far, in arrival order.
    pub fn calls(&self) -> Vec<ToolRequest> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    /// Number of requests received for one step.
    pub fn call_count(&self, step_id: &str) -> usize {
        self.calls()
            .iter()
            .filter(|r| r.step_id == step_id)
            .count()
    }

    /// Resolved input of the last request received for one step.
    pub fn input_of(&self, step_id: &str) -> Option<Value> {
        self.calls()
            .into_iter()
            .rev()
            .find(|r| r.step_id == step_id)
            .map(|r| r.input)
    }
}

impl Drop for MockExecutor {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

struct Worker {
    store: Arc<dyn RecordStore>,
    routes: Arc<HashMap<String, MockBehaviour>>,
    calls: Arc<Mutex<Vec<ToolRequest>>>,
    request_schema: String,
    response_schema: String,
}

impl Worker {
    fn is_request(&self, event: &RecordEvent) -> bool {
        event.schema_name.as_deref() == Some(self.request_schema.as_str())
            && event.tags.iter().any(|t| t == REQUEST_TAG)
    }

    async fn handle(&self, event: RecordEvent) {
        let context = match event.context {
            Some(context) => context,
            None => match self.store.get(event.record_id).await {
                Ok(record) => record.context,
                Err(e) => {
                    warn!(record_id = %event.record_id, error = %e, "mock could not fetch request");
                    return;
                }
            },
        };
        let request: ToolRequest = match serde_json::from_value(context) {
            Ok(request) => request,
            Err(e) => {
                warn!(record_id = %event.record_id, error = %e, "mock ignored malformed request");
                return;
            }
        };

        if let Ok(mut calls) = self.calls.lock() {
            calls.push(request.clone());
        }

        let (delay, response) = match self.routes.get(&request.executor) {
            Some(MockBehaviour::Return(output)) => (None, ToolResponse::success(output.clone())),
            Some(MockBehaviour::Echo) => {
                (None, ToolResponse::success(json!({ "input": request.input })))
            }
            Some(MockBehaviour::Fail(detail)) => (None, ToolResponse::error(detail.clone())),
            Some(MockBehaviour::Delayed(delay, output)) => {
                (Some(*delay), ToolResponse::success(output.clone()))
            }
            Some(MockBehaviour::Silent) => {
                debug!(step_id = %request.step_id, "mock staying silent");
                return;
            }
            None => (
                None,
                ToolResponse::error(format!("no executor registered for '{}'", request.executor)),
            ),
        };

        let store = self.store.clone();
        let record = response.into_record(&self.response_schema, request.correlation_id);
        tokio::spawn(async move {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            if let Err(e) = store.create(record).await {
                warn!(error = %e, "mock could not write response");
            }
        });
    }
}
