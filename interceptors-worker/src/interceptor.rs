//! Interceptors wrapped around every activity and workflow execution.
//!
//! A chain is an ordered list; the first registered interceptor is the outermost one. Each
//! interceptor receives a [`Next`] (or [`WorkflowNext`]) and decides when (and whether) to call
//! the rest of the chain. A panic in the activity or workflow itself surfaces to the interceptors
//! as a `Panicked` error.

use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::FutureExt;
use opentelemetry::global;
use serde_json::Value;
use tracing::field::{display, Empty};
use tracing::{info_span, Instrument};
use tracing_opentelemetry::OpenTelemetrySpanExt;

use crate::activity::{Activity, ActivityDispatcher, ActivityInput};
use crate::error::{panic_message, ActivityError, WorkflowError};
use crate::workflow::{Workflow, WorkflowContext, WorkflowInput, WorkflowSpanSink};

#[async_trait]
pub trait ActivityInterceptor: Send + Sync {
    fn name(&self) -> &str;

    /// Activities that must be registered on the worker for this interceptor to work.
    fn required_activities(&self) -> Vec<String> {
        Vec::new()
    }

    async fn intercept(
        &self,
        input: ActivityInput,
        next: Next<'_>,
    ) -> Result<Value, ActivityError>;
}

/// The remainder of an interceptor chain, ending with the activity itself.
pub struct Next<'a> {
    interceptors: &'a [Arc<dyn ActivityInterceptor>],
    activity: &'a dyn Activity,
}

impl<'a> Next<'a> {
    pub async fn run(self, input: ActivityInput) -> Result<Value, ActivityError> {
        match self.interceptors.split_first() {
            Some((outer, rest)) => {
                let next = Next {
                    interceptors: rest,
                    activity: self.activity,
                };
                outer.intercept(input, next).await
            }
            None => match AssertUnwindSafe(self.activity.execute(input))
                .catch_unwind()
                .await
            {
                Ok(result) => result,
                Err(payload) => Err(ActivityError::Panicked(panic_message(payload.as_ref()))),
            },
        }
    }
}

#[derive(Clone, Default)]
pub struct InterceptorChain {
    interceptors: Vec<Arc<dyn ActivityInterceptor>>,
}

impl InterceptorChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an interceptor; it will run inside every interceptor pushed before it.
    pub fn push<I: ActivityInterceptor + 'static>(&mut self, interceptor: I) {
        self.interceptors.push(Arc::new(interceptor));
    }

    pub fn len(&self) -> usize {
        self.interceptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.interceptors.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn ActivityInterceptor>> {
        self.interceptors.iter()
    }

    pub async fn execute(
        &self,
        activity: &dyn Activity,
        input: ActivityInput,
    ) -> Result<Value, ActivityError> {
        Next {
            interceptors: &self.interceptors,
            activity,
        }
        .run(input)
        .await
    }
}

impl fmt::Debug for InterceptorChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.interceptors.iter().map(|i| i.name()))
            .finish()
    }
}

/// Opens a `RunActivity:<type>` span per execution, parented to the trace context carried in
/// the activity headers, and marks the span as failed when the activity errors.
#[derive(Debug, Default, Clone)]
pub struct OpenTelemetryActivityInterceptor;

impl OpenTelemetryActivityInterceptor {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ActivityInterceptor for OpenTelemetryActivityInterceptor {
    fn name(&self) -> &str {
        "opentelemetry"
    }

    async fn intercept(
        &self,
        input: ActivityInput,
        next: Next<'_>,
    ) -> Result<Value, ActivityError> {
        let parent =
            global::get_text_map_propagator(|propagator| propagator.extract(&input.headers));

        let span = info_span!(
            "activity",
            otel.name = %format!("RunActivity:{}", input.activity_type),
            otel.kind = "consumer",
            otel.status_code = Empty,
            otel.status_message = Empty,
            activity.id = %input.activity_id,
            activity.name = %input.activity_type,
            task_queue = %input.task_queue,
            workflow.id = input.workflow_id.as_deref(),
        );
        span.set_parent(parent);

        let result = next.run(input).instrument(span.clone()).await;

        match &result {
            Ok(_) => {
                span.record("otel.status_code", "OK");
            }
            Err(error) => {
                span.record("otel.status_code", "ERROR");
                span.record("otel.status_message", display(error));
            }
        }
        result
    }
}

/// Counts activity outcomes and records execution time.
#[derive(Debug, Default, Clone)]
pub struct MetricsActivityInterceptor;

#[async_trait]
impl ActivityInterceptor for MetricsActivityInterceptor {
    fn name(&self) -> &str {
        "metrics"
    }

    async fn intercept(
        &self,
        input: ActivityInput,
        next: Next<'_>,
    ) -> Result<Value, ActivityError> {
        let activity = input.activity_type.clone();
        let now = Instant::now();

        let result = next.run(input).await;

        let outcome = if result.is_ok() { "success" } else { "failure" };
        let labels = [("activity", activity), ("outcome", outcome.to_owned())];
        metrics::counter!("activity_executions_total", &labels).increment(1);
        metrics::histogram!("activity_execution_duration_seconds", &labels)
            .record(now.elapsed().as_secs_f64());

        result
    }
}

#[async_trait]
pub trait WorkflowInterceptor: Send + Sync {
    fn name(&self) -> &str;

    /// Activities that must be registered on the worker for this interceptor to work.
    fn required_activities(&self) -> Vec<String> {
        Vec::new()
    }

    async fn intercept(
        &self,
        input: WorkflowInput,
        next: WorkflowNext<'_>,
    ) -> Result<Value, WorkflowError>;
}

/// The remainder of a workflow interceptor chain, ending with the workflow itself.
pub struct WorkflowNext<'a> {
    interceptors: &'a [Arc<dyn WorkflowInterceptor>],
    workflow: &'a dyn Workflow,
    dispatcher: &'a ActivityDispatcher,
}

impl<'a> WorkflowNext<'a> {
    pub async fn run(self, input: WorkflowInput) -> Result<Value, WorkflowError> {
        let Some((outer, rest)) = self.interceptors.split_first() else {
            let ctx = WorkflowContext::new(
                &input.workflow_id,
                &input.workflow_type,
                self.dispatcher.clone(),
                input.trace,
            );
            return match AssertUnwindSafe(self.workflow.run(ctx, input.args))
                .catch_unwind()
                .await
            {
                Ok(result) => result,
                Err(payload) => Err(WorkflowError::Panicked(panic_message(payload.as_ref()))),
            };
        };

        let next = WorkflowNext {
            interceptors: rest,
            workflow: self.workflow,
            dispatcher: self.dispatcher,
        };
        outer.intercept(input, next).await
    }
}

#[derive(Clone, Default)]
pub struct WorkflowInterceptorChain {
    interceptors: Vec<Arc<dyn WorkflowInterceptor>>,
}

impl WorkflowInterceptorChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an interceptor; it will run inside every interceptor pushed before it.
    pub fn push<I: WorkflowInterceptor + 'static>(&mut self, interceptor: I) {
        self.interceptors.push(Arc::new(interceptor));
    }

    pub fn len(&self) -> usize {
        self.interceptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.interceptors.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn WorkflowInterceptor>> {
        self.interceptors.iter()
    }

    /// Run `workflow` inside every interceptor; its activities go through `dispatcher`.
    pub async fn execute(
        &self,
        workflow: &dyn Workflow,
        dispatcher: &ActivityDispatcher,
        input: WorkflowInput,
    ) -> Result<Value, WorkflowError> {
        WorkflowNext {
            interceptors: &self.interceptors,
            workflow,
            dispatcher,
        }
        .run(input)
        .await
    }
}

impl fmt::Debug for WorkflowInterceptorChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.interceptors.iter().map(|i| i.name()))
            .finish()
    }
}

/// Wraps each workflow execution in a `RunWorkflow:<type>` span exported through the sink.
/// Activities the workflow schedules are parented to that span.
#[derive(Debug, Clone)]
pub struct OpenTelemetryWorkflowInterceptor {
    sink: Arc<WorkflowSpanSink>,
}

impl OpenTelemetryWorkflowInterceptor {
    pub fn new(sink: Arc<WorkflowSpanSink>) -> Self {
        Self { sink }
    }

    pub fn sink(&self) -> &Arc<WorkflowSpanSink> {
        &self.sink
    }
}

#[async_trait]
impl WorkflowInterceptor for OpenTelemetryWorkflowInterceptor {
    fn name(&self) -> &str {
        "opentelemetry"
    }

    async fn intercept(
        &self,
        mut input: WorkflowInput,
        next: WorkflowNext<'_>,
    ) -> Result<Value, WorkflowError> {
        let cx = self
            .sink
            .start(&input.workflow_type, &input.workflow_id, &input.trace);
        input.trace = cx.clone();

        let result = next.run(input).await;

        self.sink.finish(&cx, &result);
        result
    }
}
