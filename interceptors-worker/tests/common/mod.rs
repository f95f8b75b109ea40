#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::future::BoxFuture;
use opentelemetry::trace::{SpanId, TraceId};
use opentelemetry::Key;
use opentelemetry_sdk::export::trace::{ExportResult, SpanData, SpanExporter};
use tokio_util::sync::CancellationToken;

use interceptors_worker::error::{PipelineShutdownError, PipelineStartError, WorkerError};
use interceptors_worker::exporter::SharedExporter;
use interceptors_worker::health::Readiness;
use interceptors_worker::identity::ServiceIdentity;
use interceptors_worker::pipeline::TracingPipeline;
use interceptors_worker::worker::Worker;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    PipelineStarted { exporter: String },
    PipelineShutdown,
    PipelineShutdownNow,
    WorkerCreated,
    WorkerRunning,
    WorkerCancelled,
    WorkerClosed,
    ReadinessWhileRunning(bool),
}

#[derive(Debug, Clone, Default)]
pub struct EventLog(Arc<Mutex<Vec<Event>>>);

impl EventLog {
    pub fn push(&self, event: Event) {
        self.0.lock().unwrap().push(event);
    }

    pub fn events(&self) -> Vec<Event> {
        self.0.lock().unwrap().clone()
    }

    pub fn count(&self, event: &Event) -> usize {
        self.0.lock().unwrap().iter().filter(|e| *e == event).count()
    }
}

#[derive(Debug, Clone)]
pub struct RecordedSpan {
    pub name: String,
    pub service: Option<String>,
    pub trace_id: TraceId,
    pub span_id: SpanId,
    pub parent_span_id: SpanId,
}

/// Exporter that keeps what it is handed.
#[derive(Debug, Clone, Default)]
pub struct RecordingExporter {
    pub spans: Arc<Mutex<Vec<RecordedSpan>>>,
    pub shutdowns: Arc<AtomicUsize>,
}

impl RecordingExporter {
    pub fn span_names(&self) -> Vec<String> {
        self.spans
            .lock()
            .unwrap()
            .iter()
            .map(|span| span.name.clone())
            .collect()
    }

    /// The first recorded span called `name`.
    pub fn span(&self, name: &str) -> Option<RecordedSpan> {
        self.spans
            .lock()
            .unwrap()
            .iter()
            .find(|span| span.name == name)
            .cloned()
    }

    pub fn shutdown_count(&self) -> usize {
        self.shutdowns.load(Ordering::SeqCst)
    }
}

impl SpanExporter for RecordingExporter {
    fn export(&mut self, batch: Vec<SpanData>) -> BoxFuture<'static, ExportResult> {
        let mut spans = self.spans.lock().unwrap();
        for span in batch {
            let service = span
                .resource
                .get(Key::new("service.name"))
                .map(|value| value.to_string());
            spans.push(RecordedSpan {
                name: span.name.to_string(),
                service,
                trace_id: span.span_context.trace_id(),
                span_id: span.span_context.span_id(),
                parent_span_id: span.parent_span_id,
            });
        }
        Box::pin(std::future::ready(Ok(())))
    }

    fn shutdown(&mut self) {
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
    }
}

pub fn test_exporter(tag: &str) -> SharedExporter {
    SharedExporter::new(tag, RecordingExporter::default())
}

/// Pipeline double recording its lifecycle calls.
#[derive(Default)]
pub struct FakePipeline {
    pub log: EventLog,
    pub fail_start: bool,
    pub fail_shutdown: bool,
    pub started_with: Arc<Mutex<Option<SharedExporter>>>,
}

impl FakePipeline {
    pub fn new(log: &EventLog) -> Self {
        Self {
            log: log.clone(),
            ..Default::default()
        }
    }

    pub fn failing_start(mut self) -> Self {
        self.fail_start = true;
        self
    }

    pub fn failing_shutdown(mut self) -> Self {
        self.fail_shutdown = true;
        self
    }
}

#[async_trait]
impl TracingPipeline for FakePipeline {
    async fn start(
        &mut self,
        _identity: &ServiceIdentity,
        exporter: SharedExporter,
    ) -> Result<(), PipelineStartError> {
        if self.fail_start {
            return Err(PipelineStartError::AlreadyStarted);
        }
        self.log.push(Event::PipelineStarted {
            exporter: exporter.tag().to_owned(),
        });
        *self.started_with.lock().unwrap() = Some(exporter);
        Ok(())
    }

    async fn shutdown(&mut self) -> Result<(), PipelineShutdownError> {
        self.log.push(Event::PipelineShutdown);
        if self.fail_shutdown {
            Err(PipelineShutdownError::Flush("collector unreachable".to_owned()))
        } else {
            Ok(())
        }
    }

    fn shutdown_now(&mut self) {
        self.log.push(Event::PipelineShutdownNow);
    }
}

#[derive(Debug, Clone, Copy)]
pub enum Behaviour {
    Succeed,
    Fail,
    Panic,
    WaitForCancel,
}

pub struct FakeWorker {
    pub log: EventLog,
    pub behaviour: Behaviour,
    pub readiness: Option<Readiness>,
}

impl FakeWorker {
    pub fn new(log: &EventLog, behaviour: Behaviour) -> Self {
        log.push(Event::WorkerCreated);
        Self {
            log: log.clone(),
            behaviour,
            readiness: None,
        }
    }

    /// Record the readiness flag as seen from inside `run`.
    pub fn observing(mut self, readiness: Readiness) -> Self {
        self.readiness = Some(readiness);
        self
    }
}

#[async_trait]
impl Worker for FakeWorker {
    async fn run(&mut self, shutdown: CancellationToken) -> Result<(), WorkerError> {
        self.log.push(Event::WorkerRunning);
        if let Some(readiness) = &self.readiness {
            self.log.push(Event::ReadinessWhileRunning(readiness.is_ready()));
        }
        match self.behaviour {
            Behaviour::Succeed => Ok(()),
            Behaviour::Fail => Err(WorkerError::LimiterClosed),
            Behaviour::Panic => panic!("worker exploded"),
            Behaviour::WaitForCancel => {
                shutdown.cancelled().await;
                self.log.push(Event::WorkerCancelled);
                Ok(())
            }
        }
    }

    async fn close(&mut self) {
        self.log.push(Event::WorkerClosed);
    }
}
