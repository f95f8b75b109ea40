use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;
use uuid::Uuid;

use crate::error::ActivityError;
use crate::interceptor::InterceptorChain;

/// Everything an activity (and every interceptor wrapped around it) gets to see about one call.
#[derive(Debug, Clone)]
pub struct ActivityInput {
    pub activity_id: Uuid,
    pub activity_type: String,
    pub task_queue: String,
    /// Set when the activity was scheduled by a workflow.
    pub workflow_id: Option<String>,
    /// Propagation headers, e.g. the W3C `traceparent` of whoever scheduled this call.
    pub headers: HashMap<String, String>,
    pub args: Value,
}

impl ActivityInput {
    pub fn new(activity_type: &str, task_queue: &str, args: Value) -> Self {
        Self {
            activity_id: Uuid::now_v7(),
            activity_type: activity_type.to_owned(),
            task_queue: task_queue.to_owned(),
            workflow_id: None,
            headers: HashMap::new(),
            args,
        }
    }

    pub fn decode_args<T: DeserializeOwned>(&self) -> Result<T, ActivityError> {
        Ok(serde_json::from_value(self.args.clone())?)
    }
}

/// A unit of work a worker executes on behalf of a task queue.
#[async_trait]
pub trait Activity: Send + Sync {
    async fn execute(&self, input: ActivityInput) -> Result<Value, ActivityError>;
}

/// Adapter turning an async closure into an [`Activity`].
pub struct FnActivity<F>(pub F);

#[async_trait]
impl<F, Fut> Activity for FnActivity<F>
where
    F: Fn(ActivityInput) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, ActivityError>> + Send + 'static,
{
    async fn execute(&self, input: ActivityInput) -> Result<Value, ActivityError> {
        (self.0)(input).await
    }
}

#[derive(Clone, Default)]
pub struct ActivityRegistry {
    activities: HashMap<String, Arc<dyn Activity>>,
}

impl ActivityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<A: Activity + 'static>(&mut self, name: &str, activity: A) {
        self.activities.insert(name.to_owned(), Arc::new(activity));
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Activity>> {
        self.activities.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.activities.contains_key(name)
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.activities.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl fmt::Debug for ActivityRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

/// Resolves activities by name and runs them through the interceptor chain.
/// Shared by direct activity tasks and by workflows scheduling activities.
#[derive(Clone)]
pub struct ActivityDispatcher {
    task_queue: String,
    activities: ActivityRegistry,
    chain: InterceptorChain,
}

impl ActivityDispatcher {
    pub fn new(task_queue: &str, activities: ActivityRegistry, chain: InterceptorChain) -> Self {
        Self {
            task_queue: task_queue.to_owned(),
            activities,
            chain,
        }
    }

    pub fn task_queue(&self) -> &str {
        &self.task_queue
    }

    pub async fn dispatch(&self, input: ActivityInput) -> Result<Value, ActivityError> {
        let activity = self
            .activities
            .get(&input.activity_type)
            .ok_or_else(|| ActivityError::NotRegistered(input.activity_type.clone()))?;

        self.chain.execute(activity.as_ref(), input).await
    }
}
