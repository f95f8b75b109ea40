use std::str::FromStr;
use std::time;

use envconfig::Envconfig;
use tracing::Level;

use crate::error_tracking::ErrorTrackingConfig;
use crate::identity::ServiceIdentity;
use crate::logging::LoggingOptions;
use crate::pipeline::PipelineOptions;

#[derive(Envconfig, Clone)]
pub struct Config {
    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "3301")]
    pub port: u16,

    #[envconfig(default = "true")]
    pub export_prometheus: bool,

    #[envconfig(default = "false")]
    pub debug: bool,

    #[envconfig(default = "interceptors-opentelemetry-example")]
    pub task_queue: String,

    #[envconfig(default = "100")]
    pub max_concurrent_tasks: usize,

    #[envconfig(default = "warn")]
    pub worker_log_level: Level,

    #[envconfig(default = "false")]
    pub enable_sdk_tracing: bool,

    #[envconfig(default = "interceptors-sample-worker")]
    pub service_name: NonEmptyString,

    pub service_version: Option<String>,

    #[envconfig(default = "development")]
    pub environment: String,

    #[envconfig(nested = true)]
    pub otel: OtelConfig,

    #[envconfig(nested = true)]
    pub error_tracking: ErrorTrackingEnvConfig,

    #[envconfig(default = "true")]
    pub start_example_workflow: bool,

    #[envconfig(default = "Temporal")]
    pub example_workflow_input: String,
}

#[derive(Envconfig, Clone)]
pub struct OtelConfig {
    #[envconfig(from = "OTEL_URL", default = "http://localhost:4317")]
    pub url: String,

    #[envconfig(from = "OTEL_SAMPLING_RATE", default = "1.0")]
    pub sampling_rate: f64,

    #[envconfig(from = "OTEL_EXPORT_TIMEOUT_SECS", default = "3")]
    pub export_timeout_secs: u64,

    #[envconfig(from = "OTEL_LOG_LEVEL", default = "info")]
    pub log_level: Level,

    #[envconfig(from = "SHUTDOWN_FLUSH_TIMEOUT_MS", default = "5000")]
    pub flush_timeout: EnvMsDuration,
}

#[derive(Envconfig, Clone)]
pub struct ErrorTrackingEnvConfig {
    #[envconfig(from = "ERROR_TRACKING_ENDPOINT")]
    pub endpoint: Option<String>,

    #[envconfig(from = "ERROR_TRACKING_API_KEY", default = "")]
    pub api_key: String,

    #[envconfig(from = "ERROR_TRACKING_SAMPLE_RATE", default = "1.0")]
    pub sample_rate: f64,

    #[envconfig(from = "ERROR_TRACKING_DEBUG", default = "true")]
    pub debug: bool,

    #[envconfig(from = "ERROR_TRACKING_REQUEST_TIMEOUT_MS", default = "5000")]
    pub request_timeout: EnvMsDuration,
}

impl Config {
    /// Produce a host:port address for binding a TcpListener.
    pub fn bind(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn identity(&self) -> ServiceIdentity {
        let identity =
            ServiceIdentity::new(self.service_name.as_str()).with_environment(&self.environment);
        match &self.service_version {
            Some(version) => identity.with_version(version),
            None => identity,
        }
    }

    pub fn export_timeout(&self) -> time::Duration {
        time::Duration::from_secs(self.otel.export_timeout_secs)
    }

    pub fn logging_options(&self) -> LoggingOptions {
        LoggingOptions {
            debug: self.debug,
            otel_level: self.otel.log_level,
            worker_level: self.worker_log_level,
        }
    }

    pub fn pipeline_options(&self) -> PipelineOptions {
        PipelineOptions {
            sampling_rate: self.otel.sampling_rate,
            flush_timeout: self.otel.flush_timeout.0,
        }
    }

    pub fn error_tracking(&self) -> ErrorTrackingConfig {
        ErrorTrackingConfig {
            endpoint: self.error_tracking.endpoint.clone(),
            api_key: self.error_tracking.api_key.clone(),
            environment: self.environment.clone(),
            sample_rate: self.error_tracking.sample_rate,
            debug: self.error_tracking.debug,
            distinct_id: self.service_name.0.clone(),
            request_timeout: self.error_tracking.request_timeout.0,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct EnvMsDuration(pub time::Duration);

#[derive(Debug, PartialEq, Eq)]
pub struct ParseEnvMsDurationError;

impl FromStr for EnvMsDuration {
    type Err = ParseEnvMsDurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ms = s.parse::<u64>().map_err(|_| ParseEnvMsDurationError)?;

        Ok(EnvMsDuration(time::Duration::from_millis(ms)))
    }
}

#[derive(Debug, Clone)]
pub struct NonEmptyString(pub String);

impl NonEmptyString {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct StringIsEmptyError;

impl FromStr for NonEmptyString {
    type Err = StringIsEmptyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            Err(StringIsEmptyError)
        } else {
            Ok(NonEmptyString(s.to_owned()))
        }
    }
}
