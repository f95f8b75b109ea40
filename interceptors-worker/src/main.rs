//! Run the sample worker: OpenTelemetry activity interceptors, a workflow span sink sharing the
//! pipeline's OTLP exporter, and error spans forwarded to error tracking.
use std::process::ExitCode;

use envconfig::Envconfig;
use serde_json::json;
use tracing::{error, info, info_span, Instrument};
use uuid::Uuid;

use interceptors_worker::config::Config;
use interceptors_worker::coordinator::{Coordinator, ExitStatus};
use interceptors_worker::error_tracking::{ErrorTracker, ErrorTrackingSpanProcessor};
use interceptors_worker::exporter::otlp_exporter;
use interceptors_worker::interceptor::{
    MetricsActivityInterceptor, OpenTelemetryActivityInterceptor,
};
use interceptors_worker::logging;
use interceptors_worker::metrics_server::{serve, setup_metrics_router};
use interceptors_worker::pipeline::OtlpPipeline;
use interceptors_worker::queue::{LocalTaskQueue, TaskQueueClient};
use interceptors_worker::sample::{self, EXAMPLE_WORKFLOW};
use interceptors_worker::signals::wait_for_shutdown_signal;
use interceptors_worker::worker::{TaskQueueWorker, WorkerConfig};
use interceptors_worker::workflow::WorkflowSpanSink;

async fn run_example_workflow(client: TaskQueueClient, name: String) {
    let workflow_id = format!("example-{}", Uuid::now_v7());
    let span = info_span!("start_example_workflow", workflow.id = %workflow_id);

    async move {
        let handle = match client
            .start_workflow(EXAMPLE_WORKFLOW, &workflow_id, json!(name))
            .await
        {
            Ok(handle) => handle,
            Err(e) => {
                error!("failed to start the example workflow: {}", e);
                return;
            }
        };
        match handle.result().await {
            Ok(result) => info!(%result, "example workflow completed"),
            Err(e) => error!("example workflow failed: {}", e),
        }
    }
    .instrument(span)
    .await
}

#[tokio::main]
async fn main() -> ExitCode {
    let config = match Config::init_from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("invalid configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    let layer_tracer = match logging::init(&config.logging_options()) {
        Ok(tracer) => tracer,
        Err(e) => {
            eprintln!("failed to initialize logging: {e}");
            return ExitCode::FAILURE;
        }
    };

    let tracker = ErrorTracker::init(config.error_tracking());
    let identity = config.identity();

    let (client, receiver) = LocalTaskQueue::new(&config.task_queue, config.max_concurrent_tasks);

    let pipeline = OtlpPipeline::new(config.pipeline_options())
        .with_layer_tracer(layer_tracer)
        .with_span_processor(ErrorTrackingSpanProcessor::new(tracker));
    let mut coordinator =
        Coordinator::new(pipeline).with_shutdown_signal(wait_for_shutdown_signal());

    if config.export_prometheus {
        let bind = config.bind();
        let readiness = coordinator.readiness();
        tokio::task::spawn(async move {
            let router = match setup_metrics_router(readiness) {
                Ok(router) => router,
                Err(e) => {
                    error!("failed to install the metrics recorder: {}", e);
                    return;
                }
            };
            if let Err(e) = serve(router, &bind).await {
                error!("failed to serve metrics on {}: {}", bind, e);
            }
        });
    }

    let status = coordinator
        .run(
            &identity,
            || otlp_exporter(&config.otel.url, config.export_timeout()),
            |exporter| {
                let worker_config = sample::register(WorkerConfig::new(&config.task_queue))
                    .with_interceptor(OpenTelemetryActivityInterceptor::new())
                    .with_interceptor(MetricsActivityInterceptor)
                    .with_workflow_sink(WorkflowSpanSink::new(exporter, &identity))
                    .with_sdk_tracing(config.enable_sdk_tracing)
                    .with_max_concurrent_tasks(config.max_concurrent_tasks);
                let worker = TaskQueueWorker::create(worker_config, receiver)?;

                if config.start_example_workflow {
                    tokio::task::spawn(run_example_workflow(
                        client.clone(),
                        config.example_workflow_input.clone(),
                    ));
                }
                Ok(worker)
            },
        )
        .await;
    drop(client);

    match &status {
        ExitStatus::Success => info!("{}", status),
        _ => {
            error!("{}", status);
            eprintln!("{status}");
        }
    }
    ExitCode::from(status.exit_code())
}
