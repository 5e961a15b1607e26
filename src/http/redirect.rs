//! Plain-HTTP listener that sends every request to the public HTTPS host.

use std::time::Duration;

use axum::{
    http::{header, StatusCode, Uri},
    response::{IntoResponse, Response},
    Router,
};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tower_http::timeout::TimeoutLayer;

/// Every path answers 301 to `app_host_url` plus the original path and query.
#[allow(deprecated)]
pub fn redirect_router(app_host_url: &str, timeout: Duration) -> Router {
    let base = app_host_url.trim_end_matches('/').to_string();
    Router::new()
        .fallback(move |uri: Uri| {
            let base = base.clone();
            async move { redirect(&base, &uri) }
        })
        .layer(TimeoutLayer::new(timeout))
}

fn redirect(base: &str, uri: &Uri) -> Response {
    let target = uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    (
        StatusCode::MOVED_PERMANENTLY,
        [(header::LOCATION, format!("{base}{target}"))],
    )
        .into_response()
}

pub async fn run_redirector(
    listener: TcpListener,
    app_host_url: String,
    timeout: Duration,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<(), std::io::Error> {
    let addr = listener.local_addr()?;
    tracing::info!(address = %addr, target_host = %app_host_url, "Redirector starting");

    axum::serve(listener, redirect_router(&app_host_url, timeout))
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
        })
        .await?;

    tracing::info!("Redirector stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    #[tokio::test]
    async fn test_redirect_keeps_path_and_query() {
        let response = redirect_router("https://app.test/", Duration::from_secs(5))
            .oneshot(Request::get("/app/page?x=1").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::MOVED_PERMANENTLY);
        assert_eq!(
            response.headers()[header::LOCATION],
            "https://app.test/app/page?x=1"
        );
    }
}
