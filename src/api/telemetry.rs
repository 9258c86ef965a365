//! API-level telemetry for the RPC and status surfaces.

use axum::extract::MatchedPath;
use axum::http::Request;
use axum::middleware::Next;
use axum::response::Response;
use opentelemetry::global;
use opentelemetry::metrics::{Counter, Histogram};
use opentelemetry::KeyValue;
use std::sync::OnceLock;
use std::time::Instant;
use tracing::{info_span, Instrument};

struct HttpInstruments {
    request_count: Counter<u64>,
    request_duration_seconds: Histogram<f64>,
    request_errors: Counter<u64>,
}

struct RpcInstruments {
    call_count: Counter<u64>,
    call_duration_seconds: Histogram<f64>,
}

fn http_instruments() -> &'static HttpInstruments {
    static INSTRUMENTS: OnceLock<HttpInstruments> = OnceLock::new();
    INSTRUMENTS.get_or_init(|| {
        let meter = global::meter("patternserve.api.http");
        HttpInstruments {
            request_count: meter
                .u64_counter("http.server.request.count")
                .with_description("Total number of HTTP requests handled by the pattern server")
                .init(),
            request_duration_seconds: meter
                .f64_histogram("http.server.request.duration")
                .with_description("HTTP request duration")
                .with_unit("s")
                .init(),
            request_errors: meter
                .u64_counter("http.server.request.errors")
                .with_description("HTTP requests with 4xx/5xx status codes")
                .init(),
        }
    })
}

fn rpc_instruments() -> &'static RpcInstruments {
    static INSTRUMENTS: OnceLock<RpcInstruments> = OnceLock::new();
    INSTRUMENTS.get_or_init(|| {
        let meter = global::meter("patternserve.api.rpc");
        RpcInstruments {
            call_count: meter
                .u64_counter("rpc.server.call.count")
                .with_description("Pattern service calls by method and outcome")
                .init(),
            call_duration_seconds: meter
                .f64_histogram("rpc.server.duration")
                .with_description("Pattern service call duration")
                .with_unit("s")
                .init(),
        }
    })
}

fn http_attributes(method: &str, route: &str, status: u16) -> Vec<KeyValue> {
    vec![
        KeyValue::new("http.request.method", method.to_string()),
        KeyValue::new("http.route", route.to_string()),
        KeyValue::new("http.response.status_code", status as i64),
    ]
}

/// HTTP middleware that records request count, duration, and status-class errors.
pub async fn http_observability_middleware(req: Request<axum::body::Body>, next: Next) -> Response {
    let start = Instant::now();
    let method = req.method().as_str().to_string();
    let route = req
        .extensions()
        .get::<MatchedPath>()
        .map(|matched| matched.as_str().to_string())
        .unwrap_or_else(|| req.uri().path().to_string());

    let span = info_span!(
        "http.request",
        otel.kind = "server",
        http.request.method = %method,
        http.route = %route
    );
    let response = next.run(req).instrument(span).await;
    let status = response.status().as_u16();
    let elapsed = start.elapsed().as_secs_f64();
    let attrs = http_attributes(&method, &route, status);
    let instruments = http_instruments();

    instruments.request_count.add(1, &attrs);
    instruments.request_duration_seconds.record(elapsed, &attrs);
    if status >= 400 {
        instruments.request_errors.add(1, &attrs);
    }

    response
}

/// Record one pattern service call. `outcome` is one of `ok`, `ignored`,
/// `error` or `rejected`.
pub fn record_rpc_call(method: &str, outcome: &'static str, duration_seconds: f64) {
    let attrs = [
        KeyValue::new("rpc.system", "jsonrpc"),
        KeyValue::new("rpc.method", method.to_string()),
        KeyValue::new("outcome", outcome),
    ];
    let instruments = rpc_instruments();
    instruments.call_count.add(1, &attrs);
    instruments
        .call_duration_seconds
        .record(duration_seconds, &attrs);
}
