use std::thread;
use std::time;

use async_trait::async_trait;
use opentelemetry::global;
use opentelemetry::trace::TracerProvider as _;
use opentelemetry_sdk::propagation::TraceContextPropagator;
use opentelemetry_sdk::runtime;
use opentelemetry_sdk::trace::{RandomIdGenerator, Sampler, TracerProvider};
use tracing::{info, warn};

use crate::error::{PipelineShutdownError, PipelineStartError};
use crate::error_tracking::ErrorTrackingSpanProcessor;
use crate::exporter::SharedExporter;
use crate::identity::ServiceIdentity;
use crate::logging::PipelineTracer;

const TRACER_NAME: &str = "interceptors-worker";

/// The observability pipeline the coordinator starts before the worker and shuts down after it.
#[async_trait]
pub trait TracingPipeline: Send {
    /// Start exporting spans for `identity` through `exporter`. Returns once the pipeline is ready.
    async fn start(
        &mut self,
        identity: &ServiceIdentity,
        exporter: SharedExporter,
    ) -> Result<(), PipelineStartError>;

    /// Flush buffered spans and release the exporter.
    async fn shutdown(&mut self) -> Result<(), PipelineShutdownError>;

    /// Best-effort teardown for contexts that cannot await, e.g. a drop guard.
    fn shutdown_now(&mut self) {}
}

#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub sampling_rate: f64,
    pub flush_timeout: time::Duration,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            sampling_rate: 1.0,
            flush_timeout: time::Duration::from_secs(5),
        }
    }
}

/// OpenTelemetry SDK pipeline: batch span processor over the shared exporter, W3C trace-context
/// propagation, and an optional error-tracking span processor.
pub struct OtlpPipeline {
    options: PipelineOptions,
    layer: Option<PipelineTracer>,
    span_processor: Option<ErrorTrackingSpanProcessor>,
    propagate: bool,
    provider: Option<TracerProvider>,
    exporter: Option<SharedExporter>,
}

impl OtlpPipeline {
    pub fn new(options: PipelineOptions) -> Self {
        Self {
            options,
            layer: None,
            span_processor: None,
            propagate: true,
            provider: None,
            exporter: None,
        }
    }

    /// Export `tracing` spans through the pipeline while it runs.
    pub fn with_layer_tracer(mut self, tracer: PipelineTracer) -> Self {
        self.layer = Some(tracer);
        self
    }

    pub fn with_span_processor(mut self, processor: ErrorTrackingSpanProcessor) -> Self {
        self.span_processor = Some(processor);
        self
    }

    /// Install the W3C trace-context propagator globally on start (default: true).
    pub fn with_propagation(mut self, propagate: bool) -> Self {
        self.propagate = propagate;
        self
    }

    pub fn is_started(&self) -> bool {
        self.provider.is_some()
    }

    fn detach_layer(&self) {
        if let Some(layer) = &self.layer {
            layer.detach();
        }
    }

    fn trace_config(&self, identity: &ServiceIdentity) -> opentelemetry_sdk::trace::Config {
        opentelemetry_sdk::trace::Config::default()
            .with_sampler(Sampler::ParentBased(Box::new(Sampler::TraceIdRatioBased(
                self.options.sampling_rate,
            ))))
            .with_id_generator(RandomIdGenerator::default())
            .with_resource(identity.resource())
    }
}

#[async_trait]
impl TracingPipeline for OtlpPipeline {
    async fn start(
        &mut self,
        identity: &ServiceIdentity,
        exporter: SharedExporter,
    ) -> Result<(), PipelineStartError> {
        if self.provider.is_some() {
            return Err(PipelineStartError::AlreadyStarted);
        }

        let mut builder = TracerProvider::builder()
            .with_config(self.trace_config(identity))
            .with_batch_exporter(exporter.clone(), runtime::Tokio);
        if let Some(processor) = self.span_processor.take() {
            builder = builder.with_span_processor(processor);
        }
        let provider = builder.build();

        if let Some(layer) = &self.layer {
            layer.attach(provider.tracer(TRACER_NAME));
        }
        if self.propagate {
            global::set_text_map_propagator(TraceContextPropagator::new());
        }
        drop(global::set_tracer_provider(provider.clone()));

        info!(
            service = identity.service_name(),
            exporter = exporter.tag(),
            sampling_rate = self.options.sampling_rate,
            "tracing pipeline started"
        );

        self.provider = Some(provider);
        self.exporter = Some(exporter);
        Ok(())
    }

    async fn shutdown(&mut self) -> Result<(), PipelineShutdownError> {
        let provider = self
            .provider
            .take()
            .ok_or(PipelineShutdownError::NotStarted)?;
        let exporter = self.exporter.take();
        self.detach_layer();

        // Flushing blocks on the batch processor, keep it off the async workers.
        let flush = tokio::task::spawn_blocking(move || {
            let results = provider.force_flush();
            drop(provider);
            global::shutdown_tracer_provider();
            results
        });

        let timeout = self.options.flush_timeout;
        let outcome = match tokio::time::timeout(timeout, flush).await {
            Err(_) => Err(PipelineShutdownError::FlushTimeout(timeout)),
            Ok(joined) => {
                let errors: Vec<String> = joined?
                    .into_iter()
                    .filter_map(|result| result.err())
                    .map(|error| error.to_string())
                    .collect();
                if errors.is_empty() {
                    Ok(())
                } else {
                    Err(PipelineShutdownError::Flush(errors.join("; ")))
                }
            }
        };

        if let Some(exporter) = exporter {
            exporter.close();
        }
        match &outcome {
            Ok(()) => info!("tracing pipeline shut down"),
            Err(e) => warn!("tracing pipeline shut down with errors: {}", e),
        }
        outcome
    }

    fn shutdown_now(&mut self) {
        let Some(provider) = self.provider.take() else {
            return;
        };
        let exporter = self.exporter.take();
        self.detach_layer();

        // Never block the caller: this runs from drop paths that may be on a runtime thread.
        let spawned = thread::Builder::new()
            .name("tracing-pipeline-shutdown".into())
            .spawn(move || {
                drop(provider.force_flush());
                drop(provider);
                global::shutdown_tracer_provider();
                if let Some(exporter) = exporter {
                    exporter.close();
                }
            });
        if let Err(e) = spawned {
            warn!("failed to spawn the pipeline shutdown thread: {}", e);
        }
    }
}
