use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use opentelemetry::global;
use opentelemetry::trace::{Status, TraceContextExt, TraceResult, Tracer as _, TracerProvider as _};
use opentelemetry::{Context, KeyValue};
use opentelemetry_sdk::runtime;
use opentelemetry_sdk::trace::{Config, Tracer, TracerProvider};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, warn};

use crate::activity::{ActivityDispatcher, ActivityInput};
use crate::error::{PipelineShutdownError, WorkflowError};
use crate::exporter::SharedExporter;
use crate::identity::ServiceIdentity;

const WORKFLOW_TRACER_NAME: &str = "interceptors-worker/workflow";

/// Orchestration logic: a workflow schedules activities through its [`WorkflowContext`].
#[async_trait]
pub trait Workflow: Send + Sync {
    /// Activities this workflow schedules; checked against the worker's registry at startup.
    fn required_activities(&self) -> Vec<String> {
        Vec::new()
    }

    async fn run(&self, ctx: WorkflowContext, input: Value) -> Result<Value, WorkflowError>;
}

#[derive(Clone, Default)]
pub struct WorkflowRegistry {
    workflows: HashMap<String, Arc<dyn Workflow>>,
}

impl WorkflowRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<W: Workflow + 'static>(&mut self, name: &str, workflow: W) {
        self.workflows.insert(name.to_owned(), Arc::new(workflow));
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Workflow>> {
        self.workflows.get(name).cloned()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Arc<dyn Workflow>)> {
        self.workflows.iter()
    }
}

impl fmt::Debug for WorkflowRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&String> = self.workflows.keys().collect();
        names.sort_unstable();
        f.debug_list().entries(names).finish()
    }
}

/// One workflow execution as seen by the workflow interceptors.
#[derive(Debug, Clone)]
pub struct WorkflowInput {
    pub workflow_id: String,
    pub workflow_type: String,
    pub task_queue: String,
    /// Propagation headers of whoever started the workflow.
    pub headers: HashMap<String, String>,
    pub args: Value,
    /// Context that activities scheduled by the workflow are parented to.
    pub trace: Context,
}

impl WorkflowInput {
    pub fn new(workflow_type: &str, workflow_id: &str, task_queue: &str, args: Value) -> Self {
        Self {
            workflow_id: workflow_id.to_owned(),
            workflow_type: workflow_type.to_owned(),
            task_queue: task_queue.to_owned(),
            headers: HashMap::new(),
            args,
            trace: Context::new(),
        }
    }
}

/// Handed to a running workflow. Activities scheduled through it run through the worker's
/// interceptor chain and are parented to the workflow's span.
pub struct WorkflowContext {
    workflow_id: String,
    workflow_type: String,
    dispatcher: ActivityDispatcher,
    trace: Context,
}

impl WorkflowContext {
    pub(crate) fn new(
        workflow_id: &str,
        workflow_type: &str,
        dispatcher: ActivityDispatcher,
        trace: Context,
    ) -> Self {
        Self {
            workflow_id: workflow_id.to_owned(),
            workflow_type: workflow_type.to_owned(),
            dispatcher,
            trace,
        }
    }

    pub fn workflow_id(&self) -> &str {
        &self.workflow_id
    }

    pub fn workflow_type(&self) -> &str {
        &self.workflow_type
    }

    pub async fn execute_activity(
        &self,
        activity_type: &str,
        args: Value,
    ) -> Result<Value, WorkflowError> {
        let mut input = ActivityInput::new(activity_type, self.dispatcher.task_queue(), args);
        input.workflow_id = Some(self.workflow_id.clone());
        global::get_text_map_propagator(|propagator| {
            propagator.inject_context(&self.trace, &mut input.headers)
        });

        debug!(
            workflow.id = %self.workflow_id,
            activity.name = activity_type,
            "scheduling activity"
        );
        Ok(self.dispatcher.dispatch(input).await?)
    }

    /// Typed variant of [`execute_activity`](Self::execute_activity).
    pub async fn execute_activity_as<T: DeserializeOwned>(
        &self,
        activity_type: &str,
        args: Value,
    ) -> Result<T, WorkflowError> {
        let value = self.execute_activity(activity_type, args).await?;
        Ok(serde_json::from_value(value)?)
    }
}

/// Exports spans describing workflow executions through the worker's copy of the shared
/// exporter, tagged with the same service identity as the tracing pipeline.
pub struct WorkflowSpanSink {
    tracer: Tracer,
    provider: Mutex<Option<TracerProvider>>,
    exporter: SharedExporter,
}

impl WorkflowSpanSink {
    /// Must be called from within a tokio runtime.
    pub fn new(exporter: SharedExporter, identity: &ServiceIdentity) -> Self {
        let provider = TracerProvider::builder()
            .with_config(Config::default().with_resource(identity.resource()))
            .with_batch_exporter(exporter.clone(), runtime::Tokio)
            .build();
        let tracer = provider.tracer(WORKFLOW_TRACER_NAME);

        Self {
            tracer,
            provider: Mutex::new(Some(provider)),
            exporter,
        }
    }

    pub fn exporter(&self) -> &SharedExporter {
        &self.exporter
    }

    /// Open a `RunWorkflow:<type>` span, returning a context that owns it.
    pub fn start(&self, workflow_type: &str, workflow_id: &str, parent: &Context) -> Context {
        let span = self
            .tracer
            .start_with_context(format!("RunWorkflow:{workflow_type}"), parent);
        let cx = parent.with_span(span);
        cx.span()
            .set_attribute(KeyValue::new("workflow.id", workflow_id.to_owned()));
        cx.span()
            .set_attribute(KeyValue::new("workflow.type", workflow_type.to_owned()));
        cx
    }

    /// Close the span opened by [`start`](Self::start), recording the outcome.
    pub fn finish(&self, cx: &Context, outcome: &Result<Value, WorkflowError>) {
        let span = cx.span();
        match outcome {
            Ok(_) => span.set_status(Status::Ok),
            Err(error) => span.set_status(Status::error(error.to_string())),
        }
        span.end();
    }

    pub fn is_shut_down(&self) -> bool {
        self.with_provider(|provider| provider.is_none())
    }

    /// Export everything buffered so far.
    pub async fn flush(&self) -> Result<(), PipelineShutdownError> {
        let Some(provider) = self.with_provider(|provider| provider.clone()) else {
            return Ok(());
        };
        let results = tokio::task::spawn_blocking(move || provider.force_flush()).await?;
        flush_outcome(results)
    }

    /// Flush and release the sink's provider; spans started afterwards are not exported. The
    /// exporter itself stays open: it belongs to the tracing pipeline.
    pub async fn shutdown(&self) -> Result<(), PipelineShutdownError> {
        let Some(provider) = self.with_provider(Option::take) else {
            return Ok(());
        };
        // Dropping the provider waits on its batch task, so it must happen off the runtime.
        let results = tokio::task::spawn_blocking(move || {
            let results = provider.force_flush();
            drop(provider);
            results
        })
        .await?;
        debug!(exporter = %self.exporter.tag(), "workflow span sink shut down");
        flush_outcome(results)
    }

    fn with_provider<T>(&self, f: impl FnOnce(&mut Option<TracerProvider>) -> T) -> T {
        match self.provider.lock() {
            Ok(mut provider) => f(&mut *provider),
            Err(poisoned) => f(&mut *poisoned.into_inner()),
        }
    }
}

fn flush_outcome(results: Vec<TraceResult<()>>) -> Result<(), PipelineShutdownError> {
    let errors: Vec<String> = results
        .into_iter()
        .filter_map(|result| result.err())
        .map(|error| error.to_string())
        .collect();
    if errors.is_empty() {
        Ok(())
    } else {
        warn!("workflow span sink failed to flush: {}", errors.join("; "));
        Err(PipelineShutdownError::Flush(errors.join("; ")))
    }
}

impl Drop for WorkflowSpanSink {
    fn drop(&mut self) {
        let Some(provider) = self.with_provider(Option::take) else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => drop(runtime.spawn_blocking(move || drop(provider))),
            Err(_) => drop(provider),
        }
    }
}

impl fmt::Debug for WorkflowSpanSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkflowSpanSink")
            .field("exporter", &self.exporter)
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}
