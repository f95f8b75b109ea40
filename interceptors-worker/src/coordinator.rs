//! Startup and shutdown choreography between the tracing pipeline and the worker.
//!
//! The pipeline is started first and shut down last. Once it has started, a [`StartedPipeline`]
//! guard owns the obligation to shut it down: the coordinator releases it explicitly on every
//! exit path, and dropping an unreleased guard falls back to a synchronous best-effort teardown.

use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;

use futures::future::{self, BoxFuture};
use futures::FutureExt;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::error::{
    panic_message, LifecycleError, PipelineShutdownError, PipelineStartError, WorkerConfigError,
    WorkerError,
};
use crate::exporter::SharedExporter;
use crate::health::Readiness;
use crate::identity::ServiceIdentity;
use crate::pipeline::TracingPipeline;
use crate::worker::Worker;

/// A failed run: the primary cause, plus a pipeline shutdown error that happened afterwards.
#[derive(Debug)]
pub struct Failure {
    pub cause: LifecycleError,
    pub suppressed: Option<PipelineShutdownError>,
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.cause)?;
        if let Some(suppressed) = &self.suppressed {
            write!(f, " (tracing pipeline shutdown also failed: {suppressed})")?;
        }
        Ok(())
    }
}

#[derive(Debug)]
pub enum ExitStatus {
    Success,
    /// The exporter or the pipeline could not start, or the worker rejected its configuration.
    StartupFailure(Failure),
    /// The worker failed or panicked while running.
    WorkerFailure(Failure),
    /// The worker stopped cleanly but the final flush failed.
    ShutdownFailure(PipelineShutdownError),
}

impl ExitStatus {
    fn from_outcome(
        outcome: Result<(), LifecycleError>,
        shutdown: Result<(), PipelineShutdownError>,
    ) -> Self {
        match (outcome, shutdown) {
            (Ok(()), Ok(())) => ExitStatus::Success,
            (Ok(()), Err(e)) => ExitStatus::ShutdownFailure(e),
            (Err(cause), shutdown) => {
                let startup = cause.is_startup();
                let failure = Failure {
                    cause,
                    suppressed: shutdown.err(),
                };
                if startup {
                    ExitStatus::StartupFailure(failure)
                } else {
                    ExitStatus::WorkerFailure(failure)
                }
            }
        }
    }

    fn startup(cause: PipelineStartError) -> Self {
        ExitStatus::StartupFailure(Failure {
            cause: cause.into(),
            suppressed: None,
        })
    }

    /// Process exit code: 0 for success, 1 otherwise.
    pub fn exit_code(&self) -> u8 {
        match self {
            ExitStatus::Success => 0,
            _ => 1,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ExitStatus::Success)
    }

    pub fn failure(&self) -> Option<&Failure> {
        match self {
            ExitStatus::StartupFailure(failure) | ExitStatus::WorkerFailure(failure) => {
                Some(failure)
            }
            _ => None,
        }
    }
}

impl fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitStatus::Success => write!(f, "worker stopped cleanly"),
            ExitStatus::StartupFailure(failure) | ExitStatus::WorkerFailure(failure) => {
                write!(f, "{failure}")
            }
            ExitStatus::ShutdownFailure(e) => write!(f, "tracing pipeline shutdown failed: {e}"),
        }
    }
}

/// Proof that the pipeline has started, and the obligation to shut it down.
struct StartedPipeline<'a, P: TracingPipeline> {
    pipeline: Option<&'a mut P>,
}

impl<'a, P: TracingPipeline> StartedPipeline<'a, P> {
    fn new(pipeline: &'a mut P) -> Self {
        Self {
            pipeline: Some(pipeline),
        }
    }

    async fn release(mut self) -> Result<(), PipelineShutdownError> {
        let Some(pipeline) = self.pipeline.take() else {
            return Err(PipelineShutdownError::NotStarted);
        };
        pipeline.shutdown().await
    }
}

impl<P: TracingPipeline> Drop for StartedPipeline<'_, P> {
    fn drop(&mut self) {
        if let Some(pipeline) = self.pipeline.take() {
            warn!("coordinator interrupted, shutting the tracing pipeline down in the background");
            pipeline.shutdown_now();
        }
    }
}

pub struct Coordinator<P: TracingPipeline> {
    pipeline: P,
    shutdown_signal: Option<BoxFuture<'static, ()>>,
    readiness: Readiness,
}

impl<P: TracingPipeline> Coordinator<P> {
    pub fn new(pipeline: P) -> Self {
        Self {
            pipeline,
            shutdown_signal: None,
            readiness: Readiness::default(),
        }
    }

    /// Stop the worker gracefully once `signal` resolves.
    pub fn with_shutdown_signal<F>(mut self, signal: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.shutdown_signal = Some(Box::pin(signal));
        self
    }

    /// Ready while the worker runs on top of a started pipeline.
    pub fn readiness(&self) -> Readiness {
        self.readiness.clone()
    }

    pub fn pipeline(&self) -> &P {
        &self.pipeline
    }

    /// Start the pipeline, build and run the worker, then shut the pipeline down.
    ///
    /// The worker factory receives the very exporter the pipeline was started with. Neither
    /// factory is called again, and the pipeline is shut down at most once.
    pub async fn run<W, EF, WF>(
        &mut self,
        identity: &ServiceIdentity,
        exporter_factory: EF,
        worker_factory: WF,
    ) -> ExitStatus
    where
        W: Worker,
        EF: FnOnce() -> Result<SharedExporter, PipelineStartError>,
        WF: FnOnce(SharedExporter) -> Result<W, WorkerConfigError>,
    {
        let exporter = match exporter_factory() {
            Ok(exporter) => exporter,
            Err(e) => {
                error!("failed to create the trace exporter: {}", e);
                return ExitStatus::startup(e);
            }
        };

        if let Err(e) = self.pipeline.start(identity, exporter.clone()).await {
            error!("failed to start the tracing pipeline: {}", e);
            return ExitStatus::startup(e);
        }
        info!(
            service = identity.service_name(),
            exporter = exporter.tag(),
            "tracing pipeline ready, starting worker"
        );

        let signal = self.shutdown_signal.take();
        let guard = StartedPipeline::new(&mut self.pipeline);

        let outcome = run_worker(worker_factory, exporter, signal, &self.readiness).await;
        if let Err(e) = &outcome {
            error!("{}", e);
        }

        let shutdown = guard.release().await;
        if let Err(e) = &shutdown {
            error!("failed to shut down the tracing pipeline: {}", e);
        }

        ExitStatus::from_outcome(outcome, shutdown)
    }
}

async fn run_worker<W, WF>(
    worker_factory: WF,
    exporter: SharedExporter,
    signal: Option<BoxFuture<'static, ()>>,
    readiness: &Readiness,
) -> Result<(), LifecycleError>
where
    W: Worker,
    WF: FnOnce(SharedExporter) -> Result<W, WorkerConfigError>,
{
    let mut worker = worker_factory(exporter)?;
    readiness.set_ready(true);

    let result = {
        let token = CancellationToken::new();
        let mut run = AssertUnwindSafe(worker.run(token.clone())).catch_unwind();
        let mut signal = signal.unwrap_or_else(|| Box::pin(future::pending()));

        tokio::select! {
            biased;
            result = &mut run => result,
            _ = &mut signal => {
                info!("shutdown requested, waiting for the worker to stop");
                token.cancel();
                run.await
            }
        }
    };
    readiness.set_ready(false);
    worker.close().await;

    match result {
        Ok(result) => Ok(result?),
        Err(payload) => Err(WorkerError::Panicked(panic_message(payload.as_ref())).into()),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn exit_codes() {
        assert_eq!(ExitStatus::Success.exit_code(), 0);
        assert_eq!(
            ExitStatus::startup(PipelineStartError::AlreadyStarted).exit_code(),
            1
        );
        assert_eq!(
            ExitStatus::ShutdownFailure(PipelineShutdownError::NotStarted).exit_code(),
            1
        );
    }

    #[test]
    fn worker_fault_stays_primary_over_shutdown_fault() {
        let status = ExitStatus::from_outcome(
            Err(WorkerError::Panicked("boom".to_owned()).into()),
            Err(PipelineShutdownError::FlushTimeout(Duration::from_secs(5))),
        );

        let ExitStatus::WorkerFailure(failure) = &status else {
            panic!("expected a worker failure, got {status:?}");
        };
        assert!(matches!(
            failure.cause,
            LifecycleError::Worker(WorkerError::Panicked(_))
        ));
        assert!(matches!(
            failure.suppressed,
            Some(PipelineShutdownError::FlushTimeout(_))
        ));
        assert_eq!(
            status.to_string(),
            "worker failed: the worker panicked: boom \
             (tracing pipeline shutdown also failed: timed out after 5s while flushing the final span batch)"
        );
    }

    #[test]
    fn config_rejection_is_a_startup_failure() {
        let status =
            ExitStatus::from_outcome(Err(WorkerConfigError::EmptyTaskQueue.into()), Ok(()));

        assert!(matches!(status, ExitStatus::StartupFailure(_)));
        assert!(status.failure().is_some_and(|f| f.suppressed.is_none()));
    }

    #[test]
    fn clean_stop_with_failed_flush_is_a_shutdown_failure() {
        let status = ExitStatus::from_outcome(
            Ok(()),
            Err(PipelineShutdownError::Flush("x".to_owned())),
        );

        assert!(matches!(status, ExitStatus::ShutdownFailure(_)));
        assert!(!status.is_success());
        assert!(status.failure().is_none());
    }
}
