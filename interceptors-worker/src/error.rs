use std::any::Any;
use std::time;

use thiserror::Error;

/// Errors raised while bringing the tracing pipeline up.
#[derive(Error, Debug)]
pub enum PipelineStartError {
    #[error("{endpoint} is not a valid trace exporter endpoint")]
    InvalidEndpoint {
        endpoint: String,
        #[source]
        error: url::ParseError,
    },
    #[error("failed to initialize the trace exporter: {0}")]
    Exporter(#[from] opentelemetry::trace::TraceError),
    #[error("the tracing pipeline has already been started")]
    AlreadyStarted,
}

/// Errors raised while flushing and tearing the tracing pipeline down.
#[derive(Error, Debug)]
pub enum PipelineShutdownError {
    #[error("the tracing pipeline was never started")]
    NotStarted,
    #[error("timed out after {0:?} while flushing the final span batch")]
    FlushTimeout(time::Duration),
    #[error("failed to flush buffered spans: {0}")]
    Flush(String),
    #[error("the flush task did not complete: {0}")]
    FlushTask(#[from] tokio::task::JoinError),
}

/// Enumeration of reasons a worker refuses its configuration.
#[derive(Error, Debug)]
pub enum WorkerConfigError {
    #[error("the task queue name must not be empty")]
    EmptyTaskQueue,
    #[error("worker is configured for task queue {configured} but was handed queue {queue}")]
    QueueMismatch { configured: String, queue: String },
    #[error("max_concurrent_tasks must be at least 1")]
    ZeroConcurrency,
    #[error("activity {activity} is required by interceptor {interceptor} but is not registered")]
    MissingInterceptorActivity {
        interceptor: String,
        activity: String,
    },
    #[error("activity {activity} is required by workflow {workflow} but is not registered")]
    MissingWorkflowActivity { workflow: String, activity: String },
}

/// Enumeration of errors that stop a running worker.
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("the worker has already consumed its task queue")]
    AlreadyRunning,
    #[error("the task concurrency limiter was closed")]
    LimiterClosed,
    #[error("the worker panicked: {0}")]
    Panicked(String),
}

/// Errors returned by activities, either from their own logic or from argument handling.
#[derive(Error, Debug, Clone)]
pub enum ActivityError {
    #[error("activity {0} is not registered")]
    NotRegistered(String),
    #[error("invalid activity arguments: {0}")]
    InvalidArguments(String),
    #[error("activity failed: {0}")]
    Failed(String),
    #[error("activity panicked: {0}")]
    Panicked(String),
}

impl From<serde_json::Error> for ActivityError {
    fn from(error: serde_json::Error) -> Self {
        ActivityError::InvalidArguments(error.to_string())
    }
}

#[derive(Error, Debug, Clone)]
pub enum WorkflowError {
    #[error("workflow {0} is not registered")]
    NotRegistered(String),
    #[error("invalid workflow arguments: {0}")]
    InvalidArguments(String),
    #[error("workflow activity failed: {0}")]
    Activity(#[from] ActivityError),
    #[error("workflow failed: {0}")]
    Failed(String),
    #[error("workflow panicked: {0}")]
    Panicked(String),
}

impl From<serde_json::Error> for WorkflowError {
    fn from(error: serde_json::Error) -> Self {
        WorkflowError::InvalidArguments(error.to_string())
    }
}

/// Outcome errors reported back to whoever submitted a task.
#[derive(Error, Debug, Clone)]
pub enum TaskError {
    #[error(transparent)]
    Activity(#[from] ActivityError),
    #[error(transparent)]
    Workflow(#[from] WorkflowError),
    #[error("the worker stopped before reporting a result")]
    Abandoned,
}

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("task queue {0} is closed")]
    Closed(String),
}

/// Every failure the coordinator can surface as the primary cause of an unsuccessful run.
#[derive(Error, Debug)]
pub enum LifecycleError {
    #[error("tracing pipeline failed to start: {0}")]
    PipelineStart(#[from] PipelineStartError),
    #[error("worker rejected its configuration: {0}")]
    WorkerConfig(#[from] WorkerConfigError),
    #[error("worker failed: {0}")]
    Worker(#[from] WorkerError),
}

impl LifecycleError {
    /// Startup failures happened before the worker got to run.
    pub fn is_startup(&self) -> bool {
        matches!(
            self,
            LifecycleError::PipelineStart(_) | LifecycleError::WorkerConfig(_)
        )
    }
}

/// Best-effort text of a caught panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_owned()
    }
}
