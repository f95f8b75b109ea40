//! Liveness and readiness handlers served next to the metrics endpoint.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;

/// Whether the worker is polling its task queue on top of a started tracing pipeline.
/// Cloned handles share one flag.
#[derive(Debug, Clone, Default)]
pub struct Readiness {
    ready: Arc<AtomicBool>,
}

impl Readiness {
    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }
}

pub async fn liveness() -> &'static str {
    "ok"
}

pub async fn readiness(State(readiness): State<Readiness>) -> Result<&'static str, StatusCode> {
    if readiness.is_ready() {
        Ok("ok")
    } else {
        Err(StatusCode::SERVICE_UNAVAILABLE)
    }
}
