//! An in-process task queue: clients submit activity and workflow tasks, a single worker
//! consumes them and reports each result back to its submitter.

use std::collections::HashMap;

use opentelemetry::global;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing_opentelemetry::OpenTelemetrySpanExt;
use uuid::Uuid;

use crate::error::{QueueError, TaskError};

pub type TaskResult = Result<Value, TaskError>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskKind {
    Activity {
        activity_type: String,
    },
    Workflow {
        workflow_type: String,
        workflow_id: String,
    },
}

#[derive(Debug)]
pub struct Task {
    pub id: Uuid,
    pub kind: TaskKind,
    pub input: Value,
    /// Trace context of the submitter.
    pub headers: HashMap<String, String>,
    reply: Option<oneshot::Sender<TaskResult>>,
}

impl Task {
    pub fn new(kind: TaskKind, input: Value) -> Self {
        Self {
            id: Uuid::now_v7(),
            kind,
            input,
            headers: HashMap::new(),
            reply: None,
        }
    }

    /// Report the outcome to the submitter, if it is still waiting.
    pub fn complete(&mut self, result: TaskResult) {
        if let Some(reply) = self.reply.take() {
            // The submitter may have stopped listening.
            drop(reply.send(result));
        }
    }
}

pub struct LocalTaskQueue;

impl LocalTaskQueue {
    /// Create a bounded queue named `name`, returning its submitting and consuming halves.
    #[allow(clippy::new_ret_no_self)]
    pub fn new(name: &str, capacity: usize) -> (TaskQueueClient, TaskReceiver) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            TaskQueueClient {
                name: name.to_owned(),
                tx,
            },
            TaskReceiver {
                name: name.to_owned(),
                rx,
            },
        )
    }
}

#[derive(Debug, Clone)]
pub struct TaskQueueClient {
    name: String,
    tx: mpsc::Sender<Task>,
}

impl TaskQueueClient {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn start_workflow(
        &self,
        workflow_type: &str,
        workflow_id: &str,
        input: Value,
    ) -> Result<TaskHandle, QueueError> {
        let kind = TaskKind::Workflow {
            workflow_type: workflow_type.to_owned(),
            workflow_id: workflow_id.to_owned(),
        };
        self.submit(Task::new(kind, input)).await
    }

    pub async fn execute_activity(
        &self,
        activity_type: &str,
        input: Value,
    ) -> Result<TaskHandle, QueueError> {
        let kind = TaskKind::Activity {
            activity_type: activity_type.to_owned(),
        };
        self.submit(Task::new(kind, input)).await
    }

    /// Enqueue a task carrying the current span's trace context.
    pub async fn submit(&self, mut task: Task) -> Result<TaskHandle, QueueError> {
        let cx = tracing::Span::current().context();
        global::get_text_map_propagator(|propagator| {
            propagator.inject_context(&cx, &mut task.headers)
        });

        let (reply, result) = oneshot::channel();
        task.reply = Some(reply);
        let task_id = task.id;

        self.tx
            .send(task)
            .await
            .map_err(|_| QueueError::Closed(self.name.clone()))?;

        Ok(TaskHandle { task_id, result })
    }
}

/// Awaitable outcome of a submitted task.
#[derive(Debug)]
pub struct TaskHandle {
    task_id: Uuid,
    result: oneshot::Receiver<TaskResult>,
}

impl TaskHandle {
    pub fn task_id(&self) -> Uuid {
        self.task_id
    }

    pub async fn result(self) -> TaskResult {
        self.result.await.unwrap_or(Err(TaskError::Abandoned))
    }
}

#[derive(Debug)]
pub struct TaskReceiver {
    name: String,
    rx: mpsc::Receiver<Task>,
}

impl TaskReceiver {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Next task, or `None` once every client has been dropped and the queue is drained.
    pub async fn recv(&mut self) -> Option<Task> {
        self.rx.recv().await
    }

    /// Stop accepting new tasks; already queued tasks can still be received.
    pub fn close(&mut self) {
        self.rx.close();
    }
}
