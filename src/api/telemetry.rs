//! Request and command metrics for the metadata HTTP surface.

use axum::body::Body;
use axum::extract::MatchedPath;
use axum::http::{Method, Request, StatusCode};
use axum::middleware::Next;
use axum::response::Response;
use opentelemetry::metrics::{Counter, Histogram};
use opentelemetry::{global, KeyValue};
use std::sync::OnceLock;
use std::time::Instant;
use tracing::Instrument;

struct ApiMetrics {
    requests: Counter<u64>,
    latency: Histogram<f64>,
    failures: Counter<u64>,
    commands: Counter<u64>,
}

impl ApiMetrics {
    fn get() -> &'static ApiMetrics {
        static METRICS: OnceLock<ApiMetrics> = OnceLock::new();
        METRICS.get_or_init(|| {
            let meter = global::meter("metasync.api");
            ApiMetrics {
                requests: meter
                    .u64_counter("metasync.api.requests")
                    .with_description("Requests served, by route and status")
                    .init(),
                latency: meter
                    .f64_histogram("metasync.api.request.duration")
                    .with_description("Time to answer a request; snapshot fetches include the long-poll hold")
                    .with_unit("s")
                    .init(),
                failures: meter
                    .u64_counter("metasync.api.request.failures")
                    .with_description("Requests answered with a 4xx or 5xx status")
                    .init(),
                commands: meter
                    .u64_counter("metasync.api.commands")
                    .with_description("Commands posted to /execute, by kind and outcome")
                    .init(),
            }
        })
    }

    fn observe(&self, method: &Method, route: &str, status: StatusCode, started: Instant) {
        let labels = [
            KeyValue::new("method", method.to_string()),
            KeyValue::new("route", route.to_string()),
            KeyValue::new("status", i64::from(status.as_u16())),
        ];
        self.requests.add(1, &labels);
        self.latency.record(started.elapsed().as_secs_f64(), &labels);
        if status.is_client_error() || status.is_server_error() {
            self.failures.add(1, &labels);
        }
    }
}

/// Wraps every request in an `http.request` span and records its outcome
/// under the matched route.
pub async fn http_observability_middleware(req: Request<Body>, next: Next) -> Response {
    let started = Instant::now();
    let method = req.method().clone();
    let route = match req.extensions().get::<MatchedPath>() {
        Some(matched) => matched.as_str().to_string(),
        None => req.uri().path().to_string(),
    };

    let span = tracing::info_span!("http.request", %method, %route);
    let response = next.run(req).instrument(span).await;
    ApiMetrics::get().observe(&method, &route, response.status(), started);
    response
}

pub fn record_command(kind: &'static str, accepted: bool) {
    let outcome = if accepted { "accepted" } else { "rejected" };
    ApiMetrics::get()
        .commands
        .add(1, &[KeyValue::new("command", kind), KeyValue::new("outcome", outcome)]);
}
