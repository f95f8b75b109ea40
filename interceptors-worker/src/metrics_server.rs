//! Management endpoint of the worker: Prometheus metrics, liveness and readiness.
use std::time::Instant;

use axum::{
    body::Body, extract::MatchedPath, http::Request, middleware::Next, response::IntoResponse,
    routing::get, Router,
};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

use crate::health::{liveness, readiness, Readiness};

/// Bind `bind` and serve the management router until the listener fails.
pub async fn serve(router: Router, bind: &str) -> Result<(), std::io::Error> {
    let listener = tokio::net::TcpListener::bind(bind).await?;

    axum::serve(listener, router).await?;

    Ok(())
}

/// Install the global Prometheus recorder and build the management router around it.
pub fn setup_metrics_router(worker_readiness: Readiness) -> Result<Router, BuildError> {
    Ok(management_router(worker_readiness, setup_metrics_recorder()?))
}

/// `/_readiness` answers 503 until the coordinator reports the worker ready.
pub fn management_router(worker_readiness: Readiness, recorder: PrometheusHandle) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/_liveness", get(liveness))
        .route("/_readiness", get(readiness))
        .route("/metrics", get(move || std::future::ready(recorder.render())))
        .layer(axum::middleware::from_fn(track_requests))
        .with_state(worker_readiness)
}

pub fn setup_metrics_recorder() -> Result<PrometheusHandle, BuildError> {
    const TASK_DURATION_SECONDS: &[f64] = &[
        0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0,
    ];

    PrometheusBuilder::new()
        .set_buckets(TASK_DURATION_SECONDS)?
        .install_recorder()
}

async fn index() -> &'static str {
    "interceptors worker"
}

/// Count management requests per route and status.
async fn track_requests(req: Request<Body>, next: Next) -> impl IntoResponse {
    let start = Instant::now();
    let route = req
        .extensions()
        .get::<MatchedPath>()
        .map_or_else(|| req.uri().path().to_owned(), |p| p.as_str().to_owned());

    let response = next.run(req).await;

    let labels = [
        ("route", route),
        ("status", response.status().as_u16().to_string()),
    ];
    metrics::counter!("management_requests_total", &labels).increment(1);
    metrics::histogram!("management_request_duration_seconds", &labels)
        .record(start.elapsed().as_secs_f64());

    response
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use reqwest::StatusCode;
    use tokio::net::TcpListener;

    use super::*;

    async fn status_of(client: &reqwest::Client, addr: SocketAddr, path: &str) -> StatusCode {
        client
            .get(format!("http://{addr}{path}"))
            .send()
            .await
            .expect("request failed")
            .status()
    }

    #[tokio::test]
    async fn readiness_route_tracks_the_worker() {
        let worker_readiness = Readiness::default();
        let recorder = PrometheusBuilder::new().build_recorder().handle();
        let router = management_router(worker_readiness.clone(), recorder);

        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind");
        let addr = listener.local_addr().expect("no local address");
        let server = tokio::spawn(async move { axum::serve(listener, router).await });

        let client = reqwest::Client::builder()
            .no_proxy()
            .build()
            .expect("failed to build client");

        assert_eq!(status_of(&client, addr, "/_liveness").await, StatusCode::OK);
        assert_eq!(
            status_of(&client, addr, "/_readiness").await,
            StatusCode::SERVICE_UNAVAILABLE
        );
        worker_readiness.set_ready(true);
        assert_eq!(status_of(&client, addr, "/_readiness").await, StatusCode::OK);
        assert_eq!(status_of(&client, addr, "/metrics").await, StatusCode::OK);

        server.abort();
    }
}
