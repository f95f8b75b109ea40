use std::sync::{Arc, RwLock};

use opentelemetry::trace::{SpanBuilder, SpanId, TraceId, TracerProvider as _};
use opentelemetry::Context;
use opentelemetry_sdk::trace::{Config, Sampler, Tracer, TracerProvider};
use tracing::level_filters::LevelFilter;
use tracing::Level;
use tracing_opentelemetry::{OpenTelemetryLayer, OtelData, PreSampledTracer};
use tracing_subscriber::filter::ParseError;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::{SubscriberInitExt, TryInitError};
use tracing_subscriber::{fmt, EnvFilter, Layer};

/// Target prefix of the worker runtime's own diagnostics (poll loop, dispatch).
pub const WORKER_RUNTIME_TARGET: &str = "interceptors_worker::worker";

const DETACHED_TRACER_NAME: &str = "interceptors-worker/detached";

/// The tracer behind the process-wide OpenTelemetry layer.
///
/// Until the tracing pipeline attaches its own tracer, spans are built by a provider that samples
/// nothing, so trace context still propagates but nothing is exported.
#[derive(Clone, Debug)]
pub struct PipelineTracer {
    current: Arc<RwLock<Slot>>,
}

#[derive(Debug)]
struct Slot {
    tracer: Tracer,
    // Keeps the detached tracer's provider alive.
    _provider: Option<TracerProvider>,
}

impl Slot {
    fn detached() -> Self {
        let provider = TracerProvider::builder()
            .with_config(Config::default().with_sampler(Sampler::AlwaysOff))
            .build();
        Self {
            tracer: provider.tracer(DETACHED_TRACER_NAME),
            _provider: Some(provider),
        }
    }
}

impl Default for PipelineTracer {
    fn default() -> Self {
        Self {
            current: Arc::new(RwLock::new(Slot::detached())),
        }
    }
}

impl PipelineTracer {
    /// Route spans to `tracer` from now on.
    pub fn attach(&self, tracer: Tracer) {
        self.replace(Slot {
            tracer,
            _provider: None,
        });
    }

    /// Stop exporting spans.
    pub fn detach(&self) {
        self.replace(Slot::detached());
    }

    fn replace(&self, slot: Slot) {
        let previous = match self.current.write() {
            Ok(mut current) => std::mem::replace(&mut *current, slot),
            Err(poisoned) => std::mem::replace(&mut *poisoned.into_inner(), slot),
        };
        drop(previous);
    }

    fn tracer(&self) -> Tracer {
        match self.current.read() {
            Ok(current) => current.tracer.clone(),
            Err(poisoned) => poisoned.into_inner().tracer.clone(),
        }
    }
}

impl opentelemetry::trace::Tracer for PipelineTracer {
    type Span = opentelemetry_sdk::trace::Span;

    fn build_with_context(&self, builder: SpanBuilder, parent_cx: &Context) -> Self::Span {
        opentelemetry::trace::Tracer::build_with_context(&self.tracer(), builder, parent_cx)
    }
}

impl PreSampledTracer for PipelineTracer {
    fn sampled_context(&self, data: &mut OtelData) -> Context {
        self.tracer().sampled_context(data)
    }

    fn new_trace_id(&self) -> TraceId {
        self.tracer().new_trace_id()
    }

    fn new_span_id(&self) -> SpanId {
        self.tracer().new_span_id()
    }
}

#[derive(Debug, Clone)]
pub struct LoggingOptions {
    /// Pretty, colored output instead of JSON.
    pub debug: bool,
    /// Minimum level forwarded to the OpenTelemetry layer.
    pub otel_level: Level,
    /// Ceiling for the worker runtime's own log output.
    pub worker_level: Level,
}

#[derive(Debug, thiserror::Error)]
pub enum LoggingError {
    #[error("invalid log filter directive: {0}")]
    Directive(#[from] ParseError),
    #[error("a global subscriber is already installed: {0}")]
    AlreadyInstalled(#[from] TryInitError),
}

fn env_filter(worker_level: Level) -> Result<EnvFilter, ParseError> {
    Ok(EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy()
        .add_directive(format!("{WORKER_RUNTIME_TARGET}={worker_level}").parse()?))
}

/// Install the process-wide subscriber:
///   - stdout with a level configured by the RUST_LOG envvar (default=INFO), with the worker
///     runtime capped at `worker_level`
///   - OpenTelemetry for levels `otel_level` and higher, exported once the pipeline attaches
pub fn init(options: &LoggingOptions) -> Result<PipelineTracer, LoggingError> {
    let filter = env_filter(options.worker_level)?;
    let tracer = PipelineTracer::default();

    let otel_layer = OpenTelemetryLayer::new(tracer.clone())
        .with_filter(LevelFilter::from_level(options.otel_level));

    let log_layer = {
        let base_layer = fmt::layer()
            .with_target(true)
            .with_thread_ids(true)
            .with_level(true);

        if options.debug {
            base_layer.with_ansi(true).with_filter(filter).boxed()
        } else {
            base_layer.json().with_filter(filter).boxed()
        }
    };

    tracing_subscriber::registry()
        .with(otel_layer)
        .with(log_layer)
        .try_init()?;

    Ok(tracer)
}

#[cfg(test)]
mod tests {
    use opentelemetry::trace::{TraceContextExt, Tracer as _, TracerProvider as _};

    use super::*;

    #[test]
    fn worker_level_becomes_a_directive() {
        let filter = env_filter(Level::WARN).expect("directive should parse");

        assert!(filter
            .to_string()
            .to_lowercase()
            .contains("interceptors_worker::worker=warn"));
    }

    #[test]
    fn detached_tracer_samples_nothing() {
        let tracer = PipelineTracer::default();

        let span = tracer.start("detached");
        let cx = Context::current_with_span(span);

        assert!(!cx.span().span_context().is_sampled());
    }

    #[test]
    fn attached_tracer_takes_over_until_detached() {
        let slot = PipelineTracer::default();
        let provider = TracerProvider::builder()
            .with_config(Config::default().with_sampler(Sampler::AlwaysOn))
            .build();

        slot.attach(provider.tracer("attached"));
        let attached = Context::current_with_span(slot.start("attached"));
        assert!(attached.span().span_context().is_sampled());

        slot.detach();
        let detached = Context::current_with_span(slot.start("detached"));
        assert!(!detached.span().span_context().is_sampled());
    }
}
