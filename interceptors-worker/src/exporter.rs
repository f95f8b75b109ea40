//! The trace exporter handle shared between the tracing pipeline and the worker.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time;

use futures::future::BoxFuture;
use opentelemetry::trace::TraceError;
use opentelemetry_otlp::{SpanExporterBuilder, WithExportConfig};
use opentelemetry_sdk::export::trace::{ExportResult, SpanData, SpanExporter};
use tracing::{debug, warn};

use crate::error::PipelineStartError;

/// A cloneable handle to a single span exporter.
///
/// Every clone writes into the same underlying exporter, so spans produced by the
/// tracing pipeline and by the worker's workflow sink land in one export stream.
/// The inner exporter is only shut down by [`SharedExporter::close`]: processors
/// calling [`SpanExporter::shutdown`] on their own clone leave it open for the others.
#[derive(Clone)]
pub struct SharedExporter {
    inner: Arc<SharedInner>,
}

struct SharedInner {
    tag: String,
    exporter: Mutex<Box<dyn SpanExporter>>,
    closed: AtomicBool,
}

impl SharedExporter {
    pub fn new<E>(tag: impl Into<String>, exporter: E) -> Self
    where
        E: SpanExporter + 'static,
    {
        Self {
            inner: Arc::new(SharedInner {
                tag: tag.into(),
                exporter: Mutex::new(Box::new(exporter)),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// A label identifying the underlying exporter, for logs and assertions.
    pub fn tag(&self) -> &str {
        &self.inner.tag
    }

    /// Whether both handles point at the very same exporter instance.
    pub fn same_as(&self, other: &SharedExporter) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Shut the underlying exporter down. Only the first call has an effect.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        match self.inner.exporter.lock() {
            Ok(mut exporter) => exporter.shutdown(),
            Err(_) => warn!(exporter = %self.inner.tag, "poisoned span exporter mutex"),
        }
    }
}

impl fmt::Debug for SharedExporter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedExporter")
            .field("tag", &self.inner.tag)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl SpanExporter for SharedExporter {
    fn export(&mut self, batch: Vec<SpanData>) -> BoxFuture<'static, ExportResult> {
        if self.is_closed() {
            return Box::pin(std::future::ready(Err(TraceError::from(
                "span exporter is closed",
            ))));
        }
        match self.inner.exporter.lock() {
            Ok(mut exporter) => exporter.export(batch),
            Err(_) => Box::pin(std::future::ready(Err(TraceError::from(
                "poisoned span exporter mutex",
            )))),
        }
    }

    fn shutdown(&mut self) {
        debug!(exporter = %self.inner.tag, "span processor released its exporter handle");
    }
}

/// Build the OTLP exporter used in production, after checking the endpoint is a usable URL.
pub fn otlp_exporter(
    endpoint: &str,
    timeout: time::Duration,
) -> Result<SharedExporter, PipelineStartError> {
    if let Err(error) = url::Url::parse(endpoint) {
        return Err(PipelineStartError::InvalidEndpoint {
            endpoint: endpoint.to_owned(),
            error,
        });
    }

    let builder = opentelemetry_otlp::new_exporter()
        .tonic()
        .with_endpoint(endpoint)
        .with_timeout(timeout);
    let exporter = SpanExporterBuilder::from(builder).build_span_exporter()?;

    Ok(SharedExporter::new(format!("otlp:{endpoint}"), exporter))
}
