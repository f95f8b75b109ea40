use std::sync::{Arc, Mutex};
use std::time::Duration;

use interceptors_worker::coordinator::{Coordinator, ExitStatus};
use interceptors_worker::error::{
    LifecycleError, PipelineShutdownError, PipelineStartError, WorkerConfigError, WorkerError,
};
use interceptors_worker::exporter::{otlp_exporter, SharedExporter};
use interceptors_worker::identity::ServiceIdentity;
use interceptors_worker::queue::LocalTaskQueue;
use interceptors_worker::worker::{TaskQueueWorker, WorkerConfig};

use crate::common::*;
mod common;

fn identity() -> ServiceIdentity {
    ServiceIdentity::new("interceptors-sample-worker")
}

#[tokio::test]
async fn it_runs_the_worker_between_start_and_shutdown() {
    let log = EventLog::default();
    let mut coordinator = Coordinator::new(FakePipeline::new(&log));

    let status = coordinator
        .run(
            &identity(),
            || Ok(test_exporter("otlp")),
            |_exporter| Ok(FakeWorker::new(&log, Behaviour::Succeed)),
        )
        .await;

    assert!(status.is_success());
    assert_eq!(status.exit_code(), 0);
    assert_eq!(
        log.events(),
        vec![
            Event::PipelineStarted {
                exporter: "otlp".to_owned()
            },
            Event::WorkerCreated,
            Event::WorkerRunning,
            Event::WorkerClosed,
            Event::PipelineShutdown,
        ]
    );
}

#[tokio::test]
async fn it_hands_the_worker_the_exporter_the_pipeline_started_with() {
    let log = EventLog::default();
    let pipeline = FakePipeline::new(&log);
    let started_with = pipeline.started_with.clone();
    let mut coordinator = Coordinator::new(pipeline);
    let handed_to_worker: Arc<Mutex<Option<SharedExporter>>> = Arc::default();

    let status = coordinator
        .run(
            &identity(),
            || Ok(test_exporter("otlp")),
            |exporter| {
                *handed_to_worker.lock().unwrap() = Some(exporter);
                Ok(FakeWorker::new(&log, Behaviour::Succeed))
            },
        )
        .await;

    assert!(status.is_success());
    let started_with = started_with.lock().unwrap().clone().expect("pipeline not started");
    let handed_to_worker = handed_to_worker
        .lock()
        .unwrap()
        .clone()
        .expect("worker not created");
    assert!(started_with.same_as(&handed_to_worker));
}

#[tokio::test]
async fn it_rejects_a_malformed_exporter_endpoint_before_starting_anything() {
    let log = EventLog::default();
    let mut coordinator = Coordinator::new(FakePipeline::new(&log));
    let mut worker_factory_called = false;

    let status = coordinator
        .run(
            &identity(),
            || otlp_exporter("not a url", Duration::from_secs(3)),
            |_exporter| {
                worker_factory_called = true;
                Ok(FakeWorker::new(&log, Behaviour::Succeed))
            },
        )
        .await;

    let ExitStatus::StartupFailure(failure) = &status else {
        panic!("expected a startup failure, got {status:?}");
    };
    assert!(matches!(
        failure.cause,
        LifecycleError::PipelineStart(PipelineStartError::InvalidEndpoint { .. })
    ));
    assert!(failure.suppressed.is_none());
    assert_eq!(status.exit_code(), 1);
    assert!(!worker_factory_called);
    assert!(log.events().is_empty());
}

#[tokio::test]
async fn it_never_creates_the_worker_when_the_pipeline_fails_to_start() {
    let log = EventLog::default();
    let mut coordinator = Coordinator::new(FakePipeline::new(&log).failing_start());

    let status = coordinator
        .run(
            &identity(),
            || Ok(test_exporter("otlp")),
            |_exporter| Ok(FakeWorker::new(&log, Behaviour::Succeed)),
        )
        .await;

    assert!(matches!(status, ExitStatus::StartupFailure(_)));
    assert_eq!(status.exit_code(), 1);
    assert!(log.events().is_empty());
    assert!(!coordinator.readiness().is_ready());
}

#[tokio::test]
async fn it_shuts_the_pipeline_down_when_the_worker_rejects_its_config() {
    let log = EventLog::default();
    let mut coordinator = Coordinator::new(FakePipeline::new(&log));
    let (_client, receiver) = LocalTaskQueue::new("", 1);

    let status = coordinator
        .run(
            &identity(),
            || Ok(test_exporter("otlp")),
            |_exporter| TaskQueueWorker::create(WorkerConfig::new(""), receiver),
        )
        .await;

    let ExitStatus::StartupFailure(failure) = &status else {
        panic!("expected a startup failure, got {status:?}");
    };
    assert!(matches!(
        failure.cause,
        LifecycleError::WorkerConfig(WorkerConfigError::EmptyTaskQueue)
    ));
    assert_eq!(status.exit_code(), 1);
    assert_eq!(log.count(&Event::PipelineShutdown), 1);
}

#[tokio::test]
async fn it_keeps_the_startup_cause_primary_when_shutdown_also_fails() {
    let log = EventLog::default();
    let mut coordinator = Coordinator::new(FakePipeline::new(&log).failing_shutdown());

    let status = coordinator
        .run(
            &identity(),
            || Ok(test_exporter("otlp")),
            |_exporter| Err::<FakeWorker, _>(WorkerConfigError::ZeroConcurrency),
        )
        .await;

    let ExitStatus::StartupFailure(failure) = &status else {
        panic!("expected a startup failure, got {status:?}");
    };
    assert!(matches!(
        failure.cause,
        LifecycleError::WorkerConfig(WorkerConfigError::ZeroConcurrency)
    ));
    assert!(matches!(
        failure.suppressed,
        Some(PipelineShutdownError::Flush(_))
    ));
}

#[tokio::test]
async fn it_shuts_the_pipeline_down_after_a_worker_error() {
    let log = EventLog::default();
    let mut coordinator = Coordinator::new(FakePipeline::new(&log));

    let status = coordinator
        .run(
            &identity(),
            || Ok(test_exporter("otlp")),
            |_exporter| Ok(FakeWorker::new(&log, Behaviour::Fail)),
        )
        .await;

    let ExitStatus::WorkerFailure(failure) = &status else {
        panic!("expected a worker failure, got {status:?}");
    };
    assert!(matches!(
        failure.cause,
        LifecycleError::Worker(WorkerError::LimiterClosed)
    ));
    assert_eq!(status.exit_code(), 1);
    assert_eq!(
        log.events().last(),
        Some(&Event::PipelineShutdown),
        "shutdown must come after the worker stopped"
    );
    assert_eq!(log.count(&Event::PipelineShutdown), 1);
}

#[tokio::test]
async fn it_shuts_the_pipeline_down_after_a_worker_panic() {
    let log = EventLog::default();
    let mut coordinator = Coordinator::new(FakePipeline::new(&log));

    let status = coordinator
        .run(
            &identity(),
            || Ok(test_exporter("otlp")),
            |_exporter| Ok(FakeWorker::new(&log, Behaviour::Panic)),
        )
        .await;

    let ExitStatus::WorkerFailure(failure) = &status else {
        panic!("expected a worker failure, got {status:?}");
    };
    assert!(matches!(
        &failure.cause,
        LifecycleError::Worker(WorkerError::Panicked(message)) if message == "worker exploded"
    ));
    assert_eq!(log.count(&Event::PipelineShutdown), 1);
    assert_eq!(log.count(&Event::PipelineShutdownNow), 0);
    let events = log.events();
    assert!(
        events.ends_with(&[Event::WorkerClosed, Event::PipelineShutdown]),
        "the panicked worker must be closed before the pipeline shuts down: {events:?}"
    );
}

#[tokio::test]
async fn it_reports_ready_only_while_the_worker_runs() {
    let log = EventLog::default();
    let mut coordinator = Coordinator::new(FakePipeline::new(&log));
    let readiness = coordinator.readiness();
    assert!(!readiness.is_ready());

    let status = coordinator
        .run(
            &identity(),
            || Ok(test_exporter("otlp")),
            |_exporter| {
                Ok(FakeWorker::new(&log, Behaviour::Succeed).observing(readiness.clone()))
            },
        )
        .await;

    assert!(status.is_success());
    assert_eq!(log.count(&Event::ReadinessWhileRunning(true)), 1);
    assert!(!readiness.is_ready());
}

#[tokio::test]
async fn it_keeps_the_worker_fault_primary_when_shutdown_also_fails() {
    let log = EventLog::default();
    let mut coordinator = Coordinator::new(FakePipeline::new(&log).failing_shutdown());

    let status = coordinator
        .run(
            &identity(),
            || Ok(test_exporter("otlp")),
            |_exporter| Ok(FakeWorker::new(&log, Behaviour::Fail)),
        )
        .await;

    let ExitStatus::WorkerFailure(failure) = &status else {
        panic!("expected a worker failure, got {status:?}");
    };
    assert!(matches!(failure.cause, LifecycleError::Worker(_)));
    assert!(failure.suppressed.is_some());
}

#[tokio::test]
async fn it_reports_a_failed_final_flush_after_a_clean_stop() {
    let log = EventLog::default();
    let mut coordinator = Coordinator::new(FakePipeline::new(&log).failing_shutdown());

    let status = coordinator
        .run(
            &identity(),
            || Ok(test_exporter("otlp")),
            |_exporter| Ok(FakeWorker::new(&log, Behaviour::Succeed)),
        )
        .await;

    assert!(matches!(
        status,
        ExitStatus::ShutdownFailure(PipelineShutdownError::Flush(_))
    ));
    assert_eq!(status.exit_code(), 1);
}

#[tokio::test]
async fn it_cancels_the_worker_on_the_shutdown_signal() {
    let log = EventLog::default();
    let mut coordinator = Coordinator::new(FakePipeline::new(&log))
        .with_shutdown_signal(tokio::time::sleep(Duration::from_millis(10)));

    let status = coordinator
        .run(
            &identity(),
            || Ok(test_exporter("otlp")),
            |_exporter| Ok(FakeWorker::new(&log, Behaviour::WaitForCancel)),
        )
        .await;

    assert!(status.is_success());
    assert_eq!(
        log.events(),
        vec![
            Event::PipelineStarted {
                exporter: "otlp".to_owned()
            },
            Event::WorkerCreated,
            Event::WorkerRunning,
            Event::WorkerCancelled,
            Event::WorkerClosed,
            Event::PipelineShutdown,
        ]
    );
}

#[tokio::test]
async fn it_falls_back_to_a_background_shutdown_when_dropped_mid_run() {
    let log = EventLog::default();
    let mut coordinator = Coordinator::new(FakePipeline::new(&log));
    let identity = identity();

    let run = coordinator.run(
        &identity,
        || Ok(test_exporter("otlp")),
        |_exporter| Ok(FakeWorker::new(&log, Behaviour::WaitForCancel)),
    );
    let timed_out = tokio::time::timeout(Duration::from_millis(20), run).await;

    assert!(timed_out.is_err());
    assert_eq!(log.count(&Event::PipelineShutdown), 0);
    assert_eq!(log.count(&Event::PipelineShutdownNow), 1);
}
