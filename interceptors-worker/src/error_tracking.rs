//! Error tracking: a fire-and-forget client for `$exception` events, and a span processor
//! forwarding failed spans to it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use opentelemetry::trace::{Status, TraceResult};
use opentelemetry::Context;
use opentelemetry_sdk::export::trace::SpanData;
use opentelemetry_sdk::trace::{Span, SpanProcessor};
use rand::Rng;
use reqwest::header;
use serde::Serialize;
use thiserror::Error;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct ErrorTrackingConfig {
    /// Capture endpoint receiving events. Tracking is disabled when unset.
    pub endpoint: Option<String>,
    pub api_key: String,
    pub environment: String,
    pub sample_rate: f64,
    /// Log every captured event locally, sampled or not.
    pub debug: bool,
    pub distinct_id: String,
    pub request_timeout: Duration,
}

impl Default for ErrorTrackingConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            api_key: String::new(),
            environment: "development".to_owned(),
            sample_rate: 1.0,
            debug: false,
            distinct_id: "interceptors-worker".to_owned(),
            request_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Error, Debug)]
pub enum ErrorTrackingError {
    #[error("error tracking is disabled")]
    Disabled,
    #[error("failed to deliver exception event: {0}")]
    Request(#[from] reqwest::Error),
}

/// A failure worth reporting, decoupled from where it was observed.
#[derive(Debug, Clone, PartialEq)]
pub struct ExceptionEvent {
    pub exception_type: String,
    pub message: String,
    pub trace_id: Option<String>,
    pub span_id: Option<String>,
    pub tags: HashMap<String, String>,
}

impl ExceptionEvent {
    pub fn new(exception_type: &str, message: &str) -> Self {
        Self {
            exception_type: exception_type.to_owned(),
            message: message.to_owned(),
            trace_id: None,
            span_id: None,
            tags: HashMap::new(),
        }
    }

    /// Build an event from an ended span, if that span failed.
    pub fn from_span(span: &SpanData) -> Option<Self> {
        let Status::Error { description } = &span.status else {
            return None;
        };
        let message = if description.is_empty() {
            format!("span {} ended with an error", span.name)
        } else {
            description.to_string()
        };
        let mut event = Self::new(&span.name, &message);
        event.trace_id = Some(span.span_context.trace_id().to_string());
        event.span_id = Some(span.span_context.span_id().to_string());
        Some(event)
    }
}

#[derive(Debug, Serialize)]
struct ExceptionPayload<'a> {
    api_key: &'a str,
    event: &'static str,
    distinct_id: &'a str,
    properties: ExceptionProperties<'a>,
    timestamp: String,
}

#[derive(Debug, Serialize)]
struct ExceptionProperties<'a> {
    #[serde(rename = "$exception_list")]
    exception_list: Vec<ExceptionEntry<'a>>,
    #[serde(rename = "$exception_level")]
    exception_level: &'static str,
    environment: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    trace_id: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    span_id: Option<&'a str>,
    #[serde(flatten)]
    tags: &'a HashMap<String, String>,
}

#[derive(Debug, Serialize)]
struct ExceptionEntry<'a> {
    #[serde(rename = "type")]
    exception_type: &'a str,
    value: &'a str,
    mechanism: Mechanism,
}

#[derive(Debug, Serialize)]
struct Mechanism {
    handled: bool,
    #[serde(rename = "type")]
    mechanism_type: &'static str,
}

/// Process-wide error-tracking client. Cheap to clone; all clones share one HTTP client.
#[derive(Clone)]
pub struct ErrorTracker {
    inner: Arc<TrackerInner>,
}

struct TrackerInner {
    config: ErrorTrackingConfig,
    endpoint: Option<url::Url>,
    client: reqwest::Client,
    runtime: Option<tokio::runtime::Handle>,
}

impl ErrorTracker {
    /// Register the client. Never fails: a missing or unusable endpoint disables delivery.
    pub fn init(mut config: ErrorTrackingConfig) -> Self {
        config.sample_rate = config.sample_rate.clamp(0.0, 1.0);

        let endpoint = match config.endpoint.as_deref() {
            None | Some("") => None,
            Some(raw) => match url::Url::parse(raw) {
                Ok(url) => Some(url),
                Err(e) => {
                    warn!("invalid error tracking endpoint {}, disabling delivery: {}", raw, e);
                    None
                }
            },
        };

        let mut headers = header::HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            header::HeaderValue::from_static("application/json"),
        );
        let client = match reqwest::Client::builder()
            .default_headers(headers)
            .user_agent("interceptors-worker error tracking")
            .timeout(config.request_timeout)
            .build()
        {
            Ok(client) => client,
            Err(e) => {
                warn!("failed to build error tracking client, using defaults: {}", e);
                reqwest::Client::new()
            }
        };

        if config.debug {
            info!(
                enabled = endpoint.is_some(),
                environment = %config.environment,
                sample_rate = config.sample_rate,
                "error tracking initialized"
            );
        }

        Self {
            inner: Arc::new(TrackerInner {
                config,
                endpoint,
                client,
                runtime: tokio::runtime::Handle::try_current().ok(),
            }),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.endpoint.is_some()
    }

    pub fn config(&self) -> &ErrorTrackingConfig {
        &self.inner.config
    }

    /// Report an exception without waiting for delivery.
    pub fn capture_exception(&self, event: ExceptionEvent) {
        if self.inner.config.debug {
            info!(
                exception_type = %event.exception_type,
                message = %event.message,
                trace_id = event.trace_id.as_deref(),
                "captured exception"
            );
        }
        if !self.is_enabled() {
            return;
        }
        if !should_sample(self.inner.config.sample_rate, rand::thread_rng().gen::<f64>()) {
            debug!(exception_type = %event.exception_type, "exception dropped by sampling");
            return;
        }

        let runtime = self
            .inner
            .runtime
            .clone()
            .or_else(|| tokio::runtime::Handle::try_current().ok());
        let Some(runtime) = runtime else {
            warn!("no async runtime available, dropping exception event");
            return;
        };

        let tracker = self.clone();
        drop(runtime.spawn(async move {
            if let Err(e) = tracker.send(&event).await {
                warn!("failed to report exception: {}", e);
            }
        }));
    }

    /// Deliver one event and wait for the endpoint to accept it.
    pub async fn send(&self, event: &ExceptionEvent) -> Result<(), ErrorTrackingError> {
        let endpoint = self
            .inner
            .endpoint
            .as_ref()
            .ok_or(ErrorTrackingError::Disabled)?;
        let payload = self.payload(event);

        self.inner
            .client
            .post(endpoint.clone())
            .json(&payload)
            .send()
            .await?
            .error_for_status()?;

        Ok(())
    }

    fn payload<'a>(&'a self, event: &'a ExceptionEvent) -> ExceptionPayload<'a> {
        let timestamp = OffsetDateTime::now_utc()
            .format(&Rfc3339)
            .unwrap_or_default();

        ExceptionPayload {
            api_key: &self.inner.config.api_key,
            event: "$exception",
            distinct_id: &self.inner.config.distinct_id,
            properties: ExceptionProperties {
                exception_list: vec![ExceptionEntry {
                    exception_type: &event.exception_type,
                    value: &event.message,
                    mechanism: Mechanism {
                        handled: true,
                        mechanism_type: "generic",
                    },
                }],
                exception_level: "error",
                environment: &self.inner.config.environment,
                trace_id: event.trace_id.as_deref(),
                span_id: event.span_id.as_deref(),
                tags: &event.tags,
            },
            timestamp,
        }
    }
}

fn should_sample(rate: f64, roll: f64) -> bool {
    roll < rate
}

/// Span processor forwarding every span that ends with an error status to the tracker.
#[derive(Clone)]
pub struct ErrorTrackingSpanProcessor {
    tracker: ErrorTracker,
}

impl ErrorTrackingSpanProcessor {
    pub fn new(tracker: ErrorTracker) -> Self {
        Self { tracker }
    }
}

impl std::fmt::Debug for ErrorTrackingSpanProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ErrorTrackingSpanProcessor")
            .field("enabled", &self.tracker.is_enabled())
            .finish()
    }
}

impl SpanProcessor for ErrorTrackingSpanProcessor {
    fn on_start(&self, _span: &mut Span, _cx: &Context) {}

    fn on_end(&self, span: SpanData) {
        if let Some(event) = ExceptionEvent::from_span(&span) {
            self.tracker.capture_exception(event);
        }
    }

    fn force_flush(&self) -> TraceResult<()> {
        Ok(())
    }

    fn shutdown(&mut self) -> TraceResult<()> {
        Ok(())
    }
}
