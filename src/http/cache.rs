//! Per-user HTTP response cache with conditional GET.
//!
//! # Responsibilities
//! - Serve cached GET (and STORE) responses keyed by user and URL
//! - Answer `If-Modified-Since` with 304 when nothing changed
//! - Drop a user's cached entries after a write to a tagged resource
//!
//! # Design Decisions
//! - Keys start with the user sub, so one user's entries are never visible
//!   to another whatever the role check decides
//! - The body and its `Last-Modified` live under two keys; an entry counts
//!   only when both are present
//! - Backend errors degrade to a pass-through, never a failed request

use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::{to_bytes, Body},
    extract::State,
    http::{header, HeaderMap, HeaderValue, Method, Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use chrono::{DateTime, SecondsFormat, Utc};

use crate::kv::KeyValueStore;
use crate::observability::metrics;
use crate::routing::{EndpointState, HandlerOptions};
use crate::session::ConcurrentUserSession;

pub const X_CACHE_STATUS: &str = "x-cache-status";

const HIT: &str = "HIT";
const MISS: &str = "MISS";
const UNMODIFIED: &str = "UNMODIFIED";

const HTTP_DATE: &str = "%a, %d %b %Y %H:%M:%S GMT";

/// `userSub` followed by the request path and query minus the API prefix.
pub fn cache_key(user_sub: &str, path_and_query: &str, api_path: &str) -> String {
    let url = path_and_query.strip_prefix(api_path).unwrap_or(path_and_query);
    format!("{user_sub}{url}")
}

fn mod_key(key: &str) -> String {
    format!("{key}:mod")
}

/// True when the entry is no newer than the client's copy, compared at
/// whole seconds.
pub fn is_unmodified(last_modified: DateTime<Utc>, if_modified_since: DateTime<Utc>) -> bool {
    last_modified.timestamp() <= if_modified_since.timestamp()
}

fn http_date(at: DateTime<Utc>) -> String {
    at.format(HTTP_DATE).to_string()
}

fn parse_http_date(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc2822(value)
        .ok()
        .map(|at| at.with_timezone(&Utc))
}

pub async fn response_cache(
    State(ctx): State<EndpointState>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let options = &ctx.endpoint.options;
    if options.should_skip_cache() {
        return next.run(request).await;
    }
    let Some(user_sub) = request
        .extensions()
        .get::<Arc<ConcurrentUserSession>>()
        .map(|s| s.user_sub())
    else {
        return next.run(request).await;
    };

    let kv = ctx.app.kv.clone();
    let path_and_query = request
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| request.uri().path().to_string());
    let key = cache_key(&user_sub, &path_and_query, &ctx.app.config.cache.api_path);

    if request.method() != Method::GET && !options.should_store() {
        let response = next.run(request).await;
        invalidate(kv.as_ref(), &user_sub, &key, &options.invalidations).await;
        return response;
    }

    if let Some((body, last_modified)) = lookup(kv.as_ref(), &key).await {
        return serve_cached(options, request.headers(), body, last_modified);
    }

    metrics::record_cache(MISS);
    let now = Utc::now();
    let mut response = next.run(request).await;
    set_header(response.headers_mut(), X_CACHE_STATUS, MISS);
    set_header(response.headers_mut(), header::LAST_MODIFIED.as_str(), &http_date(now));

    if !response.status().is_success() {
        return response;
    }

    let (parts, body) = response.into_parts();
    let bytes = match to_bytes(body, usize::MAX).await {
        Ok(bytes) => bytes,
        Err(e) => {
            tracing::error!(key = %key, error = %e, "Failed to buffer response for cache");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    if !bytes.is_empty() {
        let ttl = if options.should_store() {
            None
        } else {
            let secs = if options.cache_duration > 0 {
                options.cache_duration
            } else {
                ctx.app.config.cache.default_duration_secs
            };
            Some(Duration::from_secs(secs))
        };
        let stamp = now.to_rfc3339_opts(SecondsFormat::Nanos, true);
        if let Err(e) = kv.set(&key, bytes.to_vec(), ttl).await {
            tracing::warn!(key = %key, error = %e, "Cache write failed");
        } else if let Err(e) = kv.set(&mod_key(&key), stamp.into_bytes(), ttl).await {
            tracing::warn!(key = %key, error = %e, "Cache timestamp write failed");
        }
    }

    Response::from_parts(parts, Body::from(bytes))
}

async fn lookup(kv: &dyn KeyValueStore, key: &str) -> Option<(Vec<u8>, DateTime<Utc>)> {
    let body = match kv.get(key).await {
        Ok(Some(body)) if !body.is_empty() => body,
        Ok(_) => return None,
        Err(e) => {
            tracing::warn!(key, error = %e, "Cache read failed");
            return None;
        }
    };
    let stamp = kv.get(&mod_key(key)).await.ok().flatten()?;
    let last_modified = std::str::from_utf8(&stamp)
        .ok()
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())?
        .with_timezone(&Utc);
    Some((body, last_modified))
}

fn serve_cached(
    options: &HandlerOptions,
    request_headers: &HeaderMap,
    body: Vec<u8>,
    last_modified: DateTime<Utc>,
) -> Response {
    let if_modified_since = request_headers
        .get(header::IF_MODIFIED_SINCE)
        .and_then(|v| v.to_str().ok())
        .and_then(parse_http_date);

    let mut response = match if_modified_since {
        Some(since) if is_unmodified(last_modified, since) => {
            metrics::record_cache(UNMODIFIED);
            let mut response = StatusCode::NOT_MODIFIED.into_response();
            set_header(response.headers_mut(), X_CACHE_STATUS, UNMODIFIED);
            response
        }
        _ => {
            metrics::record_cache(HIT);
            let content_type = if options.multipart_response {
                "application/octet-stream"
            } else {
                "application/json"
            };
            let length = body.len().to_string();
            let mut response = Body::from(body).into_response();
            set_header(response.headers_mut(), header::CONTENT_TYPE.as_str(), content_type);
            set_header(response.headers_mut(), header::CONTENT_LENGTH.as_str(), &length);
            set_header(response.headers_mut(), X_CACHE_STATUS, HIT);
            response
        }
    };
    set_header(
        response.headers_mut(),
        header::LAST_MODIFIED.as_str(),
        &http_date(last_modified),
    );
    response
}

async fn invalidate(kv: &dyn KeyValueStore, user_sub: &str, key: &str, tags: &[String]) {
    for stale in [key.to_string(), mod_key(key)] {
        if let Err(e) = kv.delete(&stale).await {
            tracing::warn!(key = %stale, error = %e, "Cache delete failed");
        }
    }
    for tag in tags {
        let resource = format!("{user_sub}/v1/{tag}");
        for exact in [resource.clone(), mod_key(&resource)] {
            if let Err(e) = kv.delete(&exact).await {
                tracing::warn!(key = %exact, error = %e, "Cache delete failed");
            }
        }
        // Nested paths and query variants only, never sibling resources.
        for prefix in [format!("{resource}/"), format!("{resource}?")] {
            match kv.delete_prefix(&prefix).await {
                Ok(removed) if removed > 0 => tracing::debug!(prefix = %prefix, removed, "Cache invalidated"),
                Ok(_) => {}
                Err(e) => tracing::warn!(prefix = %prefix, error = %e, "Cache invalidation failed"),
            }
        }
    }
}

fn set_header(headers: &mut HeaderMap, name: &str, value: &str) {
    if let (Ok(name), Ok(value)) = (
        header::HeaderName::from_bytes(name.as_bytes()),
        HeaderValue::from_str(value),
    ) {
        headers.insert(name, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryKv;
    use chrono::TimeZone;

    #[test]
    fn test_cache_key_drops_api_prefix() {
        assert_eq!(cache_key("u1", "/api/v1/things?x=1", "/api"), "u1/v1/things?x=1");
        assert_eq!(cache_key("u1", "/other", "/api"), "u1/other");
    }

    #[test]
    fn test_unmodified_compares_whole_seconds() {
        let since = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 10).unwrap();
        let same_second = since + chrono::Duration::milliseconds(900);
        assert!(is_unmodified(same_second, since));
        assert!(!is_unmodified(since + chrono::Duration::seconds(1), since));
    }

    #[test]
    fn test_http_date_roundtrip() {
        let at = Utc.with_ymd_and_hms(2026, 3, 4, 5, 6, 7).unwrap();
        let text = http_date(at);
        assert_eq!(text, "Wed, 04 Mar 2026 05:06:07 GMT");
        assert_eq!(parse_http_date(&text), Some(at));
    }

    #[tokio::test]
    async fn test_lookup_needs_both_keys() {
        let kv = MemoryKv::new();
        kv.set("u1/v1/a", b"{}".to_vec(), None).await.unwrap();
        assert!(lookup(&kv, "u1/v1/a").await.is_none());

        let stamp = Utc::now().to_rfc3339_opts(SecondsFormat::Nanos, true);
        kv.set("u1/v1/a:mod", stamp.into_bytes(), None).await.unwrap();
        let (body, _) = lookup(&kv, "u1/v1/a").await.unwrap();
        assert_eq!(body, b"{}".to_vec());
    }

    #[tokio::test]
    async fn test_invalidate_is_scoped_to_user() {
        let kv = MemoryKv::new();
        for key in ["u1/v1/things?p=1", "u1/v1/things/2", "u2/v1/things?p=1", "u1/v1/other"] {
            kv.set(key, b"x".to_vec(), None).await.unwrap();
        }
        invalidate(&kv, "u1", "u1/v1/things/2", &["things".to_string()]).await;

        assert!(kv.get("u1/v1/things?p=1").await.unwrap().is_none());
        assert!(kv.get("u1/v1/things/2").await.unwrap().is_none());
        assert!(kv.get("u2/v1/things?p=1").await.unwrap().is_some());
        assert!(kv.get("u1/v1/other").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_invalidate_spares_sibling_resources() {
        let kv = MemoryKv::new();
        for key in [
            "u1/v1/things",
            "u1/v1/things:mod",
            "u1/v1/thingsArchive?p=1",
            "u1/v1/things-old/3",
        ] {
            kv.set(key, b"x".to_vec(), None).await.unwrap();
        }
        invalidate(&kv, "u1", "u1/v1/other", &["things".to_string()]).await;

        assert!(kv.get("u1/v1/things").await.unwrap().is_none());
        assert!(kv.get("u1/v1/things:mod").await.unwrap().is_none());
        assert!(kv.get("u1/v1/thingsArchive?p=1").await.unwrap().is_some());
        assert!(kv.get("u1/v1/things-old/3").await.unwrap().is_some());
    }
}
