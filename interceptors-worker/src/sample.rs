//! The activities and workflows this worker ships with.

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::activity::{Activity, ActivityInput};
use crate::error::{ActivityError, WorkflowError};
use crate::worker::WorkerConfig;
use crate::workflow::{Workflow, WorkflowContext};

pub const GREET_ACTIVITY: &str = "greet";
pub const EXAMPLE_WORKFLOW: &str = "example";

#[derive(Debug, Default, Clone)]
pub struct Greet;

#[async_trait]
impl Activity for Greet {
    async fn execute(&self, input: ActivityInput) -> Result<Value, ActivityError> {
        let name: String = input.decode_args()?;
        Ok(json!(greeting(&name)))
    }
}

fn greeting(name: &str) -> String {
    format!("Hello, {name}!")
}

/// Greets its input through the `greet` activity.
#[derive(Debug, Default, Clone)]
pub struct ExampleWorkflow;

#[async_trait]
impl Workflow for ExampleWorkflow {
    fn required_activities(&self) -> Vec<String> {
        vec![GREET_ACTIVITY.to_owned()]
    }

    async fn run(&self, ctx: WorkflowContext, input: Value) -> Result<Value, WorkflowError> {
        let name: String = serde_json::from_value(input)?;
        let greeting: String = ctx.execute_activity_as(GREET_ACTIVITY, json!(name)).await?;
        Ok(json!(greeting))
    }
}

/// Register the sample activities and workflows.
pub fn register(config: WorkerConfig) -> WorkerConfig {
    config
        .with_activity(GREET_ACTIVITY, Greet)
        .with_workflow(EXAMPLE_WORKFLOW, ExampleWorkflow)
}
