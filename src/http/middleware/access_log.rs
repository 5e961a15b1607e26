//! One access-log line per request.

use std::time::Instant;

use axum::{body::Body, http::Request, middleware::Next, response::Response};

use crate::observability::{metrics, ACCESS_TARGET};

pub async fn access_log(request: Request<Body>, next: Next) -> Response {
    let start = Instant::now();
    let method = request.method().to_string();
    let path = request.uri().path().to_string();
    let protocol = format!("{:?}", request.version());

    let response = next.run(request).await;

    let status = response.status().as_u16();
    tracing::info!(
        target: ACCESS_TARGET,
        method = %method,
        path = %path,
        protocol = %protocol,
        status,
        elapsed_ms = start.elapsed().as_millis() as u64,
        "request"
    );
    metrics::record_request(&method, status, start);
    response
}
