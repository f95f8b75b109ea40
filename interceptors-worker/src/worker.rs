use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::FutureExt;
use opentelemetry::global;
use serde_json::Value;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument, Span};

use crate::activity::{Activity, ActivityDispatcher, ActivityInput, ActivityRegistry};
use crate::error::{panic_message, ActivityError, WorkerConfigError, WorkerError, WorkflowError};
use crate::interceptor::{
    ActivityInterceptor, InterceptorChain, OpenTelemetryWorkflowInterceptor, WorkflowInterceptor,
    WorkflowInterceptorChain,
};
use crate::queue::{Task, TaskKind, TaskReceiver, TaskResult};
use crate::workflow::{Workflow, WorkflowInput, WorkflowRegistry, WorkflowSpanSink};

/// The long-running collaborator driven by the coordinator.
#[async_trait]
pub trait Worker: Send {
    /// Process tasks until `shutdown` is cancelled or the task source is exhausted.
    async fn run(&mut self, shutdown: CancellationToken) -> Result<(), WorkerError>;

    /// Release whatever the worker still holds once it has stopped, whether `run` returned,
    /// failed or panicked. Called once by the coordinator before the pipeline shuts down.
    async fn close(&mut self) {}
}

/// Everything a [`TaskQueueWorker`] is built from.
pub struct WorkerConfig {
    task_queue: String,
    activities: ActivityRegistry,
    workflows: WorkflowRegistry,
    interceptors: InterceptorChain,
    workflow_interceptors: WorkflowInterceptorChain,
    workflow_sink: Option<Arc<WorkflowSpanSink>>,
    sdk_tracing: bool,
    max_concurrent_tasks: usize,
}

impl WorkerConfig {
    pub fn new(task_queue: &str) -> Self {
        Self {
            task_queue: task_queue.to_owned(),
            activities: ActivityRegistry::new(),
            workflows: WorkflowRegistry::new(),
            interceptors: InterceptorChain::new(),
            workflow_interceptors: WorkflowInterceptorChain::new(),
            workflow_sink: None,
            sdk_tracing: false,
            max_concurrent_tasks: 100,
        }
    }

    pub fn with_activity<A: Activity + 'static>(mut self, name: &str, activity: A) -> Self {
        self.activities.register(name, activity);
        self
    }

    pub fn with_workflow<W: Workflow + 'static>(mut self, name: &str, workflow: W) -> Self {
        self.workflows.register(name, workflow);
        self
    }

    /// Interceptors wrap in registration order: the first one added is the outermost.
    pub fn with_interceptor<I: ActivityInterceptor + 'static>(mut self, interceptor: I) -> Self {
        self.interceptors.push(interceptor);
        self
    }

    /// Same ordering as [`with_interceptor`](Self::with_interceptor), around workflow runs.
    pub fn with_workflow_interceptor<I: WorkflowInterceptor + 'static>(
        mut self,
        interceptor: I,
    ) -> Self {
        self.workflow_interceptors.push(interceptor);
        self
    }

    /// Trace workflow runs through `sink`. This registers an
    /// [`OpenTelemetryWorkflowInterceptor`] at the current position of the workflow chain, and
    /// the worker shuts the sink down when it closes.
    pub fn with_workflow_sink(mut self, sink: WorkflowSpanSink) -> Self {
        let sink = Arc::new(sink);
        self.workflow_interceptors
            .push(OpenTelemetryWorkflowInterceptor::new(sink.clone()));
        self.workflow_sink = Some(sink);
        self
    }

    /// Emit spans for the worker's own dispatch steps.
    pub fn with_sdk_tracing(mut self, enabled: bool) -> Self {
        self.sdk_tracing = enabled;
        self
    }

    pub fn with_max_concurrent_tasks(mut self, max_concurrent_tasks: usize) -> Self {
        self.max_concurrent_tasks = max_concurrent_tasks;
        self
    }

    pub fn task_queue(&self) -> &str {
        &self.task_queue
    }

    pub fn workflow_sink(&self) -> Option<&Arc<WorkflowSpanSink>> {
        self.workflow_sink.as_ref()
    }

    fn validate(&self, receiver: &TaskReceiver) -> Result<(), WorkerConfigError> {
        if self.task_queue.is_empty() {
            return Err(WorkerConfigError::EmptyTaskQueue);
        }
        if receiver.name() != self.task_queue {
            return Err(WorkerConfigError::QueueMismatch {
                configured: self.task_queue.clone(),
                queue: receiver.name().to_owned(),
            });
        }
        if self.max_concurrent_tasks == 0 {
            return Err(WorkerConfigError::ZeroConcurrency);
        }

        let interceptor_requirements = self
            .interceptors
            .iter()
            .map(|i| (i.name().to_owned(), i.required_activities()))
            .chain(
                self.workflow_interceptors
                    .iter()
                    .map(|i| (i.name().to_owned(), i.required_activities())),
            );
        for (interceptor, required) in interceptor_requirements {
            for activity in required {
                if !self.activities.contains(&activity) {
                    return Err(WorkerConfigError::MissingInterceptorActivity {
                        interceptor,
                        activity,
                    });
                }
            }
        }
        for (name, workflow) in self.workflows.iter() {
            for activity in workflow.required_activities() {
                if !self.activities.contains(&activity) {
                    return Err(WorkerConfigError::MissingWorkflowActivity {
                        workflow: name.clone(),
                        activity,
                    });
                }
            }
        }

        Ok(())
    }
}

/// A worker consuming a local task queue with bounded concurrency.
pub struct TaskQueueWorker {
    task_queue: String,
    receiver: Option<TaskReceiver>,
    dispatcher: ActivityDispatcher,
    workflows: WorkflowRegistry,
    workflow_interceptors: WorkflowInterceptorChain,
    sink: Option<Arc<WorkflowSpanSink>>,
    sdk_tracing: bool,
    max_concurrent_tasks: usize,
}

impl TaskQueueWorker {
    pub fn create(config: WorkerConfig, receiver: TaskReceiver) -> Result<Self, WorkerConfigError> {
        config.validate(&receiver)?;

        debug!(
            task_queue = %config.task_queue,
            activities = ?config.activities,
            workflows = ?config.workflows,
            interceptors = ?config.interceptors,
            workflow_interceptors = ?config.workflow_interceptors,
            "worker configured"
        );

        let dispatcher =
            ActivityDispatcher::new(&config.task_queue, config.activities, config.interceptors);

        Ok(Self {
            task_queue: config.task_queue,
            receiver: Some(receiver),
            dispatcher,
            workflows: config.workflows,
            workflow_interceptors: config.workflow_interceptors,
            sink: config.workflow_sink,
            sdk_tracing: config.sdk_tracing,
            max_concurrent_tasks: config.max_concurrent_tasks,
        })
    }

    pub fn task_queue(&self) -> &str {
        &self.task_queue
    }

    fn spawn_task(&self, tasks: &mut JoinSet<()>, permit: OwnedSemaphorePermit, task: Task) {
        let span = if self.sdk_tracing {
            info_span!(
                "process_task",
                task.id = %task.id,
                task_queue = %self.task_queue,
            )
        } else {
            Span::none()
        };

        let dispatcher = self.dispatcher.clone();
        let workflows = self.workflows.clone();
        let workflow_interceptors = self.workflow_interceptors.clone();

        tasks.spawn(
            async move {
                process_task(task, &dispatcher, &workflows, &workflow_interceptors).await;
                drop(permit);
            }
            .instrument(span),
        );
    }

    /// Hand tasks to the pool until shutdown is requested or the queue is closed and empty.
    async fn poll_tasks(
        &self,
        receiver: &mut TaskReceiver,
        semaphore: &Arc<Semaphore>,
        tasks: &mut JoinSet<()>,
        shutdown: &CancellationToken,
    ) -> Result<(), WorkerError> {
        loop {
            reap_finished(tasks);
            report_saturation(semaphore, self.max_concurrent_tasks);

            let permit = tokio::select! {
                biased;
                _ = shutdown.cancelled() => return Ok(()),
                permit = semaphore.clone().acquire_owned() => {
                    permit.map_err(|_| WorkerError::LimiterClosed)?
                }
            };

            let task = loop {
                tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => break None,
                    Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                        log_join_error(joined)
                    }
                    task = receiver.recv() => break task,
                }
            };
            let Some(task) = task else {
                return Ok(());
            };

            debug!(task.id = %task.id, kind = ?task.kind, "received task");
            self.spawn_task(tasks, permit, task);
        }
    }

    /// Flush and release the workflow span sink; later calls do nothing.
    async fn close_sink(&mut self) {
        let Some(sink) = self.sink.take() else {
            return;
        };
        if let Err(e) = sink.shutdown().await {
            warn!("failed to shut down the workflow span sink: {}", e);
        }
    }
}

#[async_trait]
impl Worker for TaskQueueWorker {
    async fn run(&mut self, shutdown: CancellationToken) -> Result<(), WorkerError> {
        let mut receiver = self.receiver.take().ok_or(WorkerError::AlreadyRunning)?;
        let semaphore = Arc::new(Semaphore::new(self.max_concurrent_tasks));
        let mut tasks = JoinSet::new();

        info!(
            task_queue = %self.task_queue,
            max_concurrent_tasks = self.max_concurrent_tasks,
            "worker started"
        );

        let polled = self
            .poll_tasks(&mut receiver, &semaphore, &mut tasks, &shutdown)
            .await;

        if shutdown.is_cancelled() {
            info!(in_flight = tasks.len(), "worker cancelled, draining in-flight tasks");
        } else {
            info!(in_flight = tasks.len(), "task queue closed, draining in-flight tasks");
        }
        receiver.close();
        drop(receiver);

        while let Some(joined) = tasks.join_next().await {
            log_join_error(joined);
        }
        report_saturation(&semaphore, self.max_concurrent_tasks);
        self.close_sink().await;

        info!(task_queue = %self.task_queue, "worker stopped");
        polled
    }

    async fn close(&mut self) {
        self.close_sink().await;
    }
}

/// Collect every task that already finished, without waiting.
fn reap_finished(tasks: &mut JoinSet<()>) -> usize {
    let mut reaped = 0;
    while let Some(joined) = tasks.try_join_next() {
        log_join_error(joined);
        reaped += 1;
    }
    reaped
}

fn report_saturation(semaphore: &Semaphore, max_concurrent_tasks: usize) {
    metrics::gauge!("worker_saturation_percent")
        .set(1f64 - semaphore.available_permits() as f64 / max_concurrent_tasks as f64);
}

fn log_join_error(joined: Result<(), JoinError>) {
    if let Err(e) = joined {
        error!("task did not run to completion: {}", e);
    }
}

async fn process_task(
    mut task: Task,
    dispatcher: &ActivityDispatcher,
    workflows: &WorkflowRegistry,
    workflow_interceptors: &WorkflowInterceptorChain,
) {
    let now = Instant::now();
    let input = std::mem::take(&mut task.input);

    let (kind, outcome): (&str, TaskResult) = match &task.kind {
        TaskKind::Activity { activity_type } => {
            let mut activity_input =
                ActivityInput::new(activity_type, dispatcher.task_queue(), input);
            activity_input.headers = task.headers.clone();

            let result = match AssertUnwindSafe(dispatcher.dispatch(activity_input))
                .catch_unwind()
                .await
            {
                Ok(result) => result,
                Err(payload) => Err(ActivityError::Panicked(panic_message(payload.as_ref()))),
            };
            ("activity", result.map_err(Into::into))
        }
        TaskKind::Workflow {
            workflow_type,
            workflow_id,
        } => {
            let mut workflow_input =
                WorkflowInput::new(workflow_type, workflow_id, dispatcher.task_queue(), input);
            workflow_input.headers = task.headers.clone();

            let result = run_workflow(dispatcher, workflows, workflow_interceptors, workflow_input)
                .await;
            ("workflow", result.map_err(Into::into))
        }
    };

    let labels = [
        ("task_queue", dispatcher.task_queue().to_owned()),
        ("kind", kind.to_owned()),
        (
            "outcome",
            if outcome.is_ok() { "success" } else { "failure" }.to_owned(),
        ),
    ];
    metrics::counter!("worker_tasks_total", &labels).increment(1);
    metrics::histogram!("worker_task_duration_seconds", &labels)
        .record(now.elapsed().as_secs_f64());

    match &outcome {
        Ok(_) => debug!(task.id = %task.id, kind, "task completed"),
        Err(e) => error!(task.id = %task.id, kind, "task failed: {}", e),
    }
    task.complete(outcome);
}

async fn run_workflow(
    dispatcher: &ActivityDispatcher,
    workflows: &WorkflowRegistry,
    interceptors: &WorkflowInterceptorChain,
    mut input: WorkflowInput,
) -> Result<Value, WorkflowError> {
    let workflow = workflows
        .get(&input.workflow_type)
        .ok_or_else(|| WorkflowError::NotRegistered(input.workflow_type.clone()))?;

    input.trace = global::get_text_map_propagator(|propagator| propagator.extract(&input.headers));

    match AssertUnwindSafe(interceptors.execute(workflow.as_ref(), dispatcher, input))
        .catch_unwind()
        .await
    {
        Ok(result) => result,
        Err(payload) => Err(WorkflowError::Panicked(panic_message(payload.as_ref()))),
    }
}
