//! Handler dispatch.
//!
//! # Responsibilities
//! - Decode the request into the handler's JSON input (body, path, query)
//! - Open the request executor and release it according to the outcome
//! - Contain handler panics and turn every failure into a request error
//!   tagged with a fresh request id
//! - Bump the group version after a successful group-resetting call
//!
//! # Data Flow
//! ```text
//! session (extensions) → throttle → path/query → body (JSON | multipart)
//!     → executor open → handler (panic guard) → commit | rollback
//!     → reset group → encode output
//! ```

use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{FromRequest, FromRequestParts, Multipart, Path, Query, State};
use axum::http::request::Parts;
use axum::http::{header, Request, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use futures_util::FutureExt;
use serde_json::{json, Map, Value};
use uuid::Uuid;

use crate::db::{DbHandle, DbScope, ExecutorKind, ReqInfo};
use crate::error::ApiError;
use crate::routing::handler::HandlerOutput;
use crate::routing::options::HandlerOptions;
use crate::routing::registry::EndpointState;
use crate::session::ConcurrentUserSession;

/// Largest JSON request body.
pub const JSON_BODY_LIMIT: usize = 1024 * 1024;

/// Largest multipart request body.
pub const MULTIPART_BODY_LIMIT: usize = 32 * 1024 * 1024;

/// Limiter name for an endpoint's per-user throttle.
pub fn throttle_limiter(options: &HandlerOptions) -> String {
    format!("throttle:{}", options.pattern)
}

pub async fn dispatch(State(ctx): State<EndpointState>, request: Request<Body>) -> Response {
    let request_id = Uuid::new_v4();
    let options = &ctx.endpoint.options;

    let Some(handler) = ctx.endpoint.handler.clone() else {
        return ApiError::NotImplemented.into_response();
    };

    let (mut parts, body) = request.into_parts();
    let Some(session) = parts.extensions.get::<Arc<ConcurrentUserSession>>().cloned() else {
        return ApiError::Unauthorized.into_response();
    };

    if options.throttle > 0 && ctx.app.limiters.limit(&throttle_limiter(options), &session.user_sub()) {
        return ApiError::TooManyRequests.into_response();
    }

    let (path_params, query) = match read_params(options, &mut parts).await {
        Ok(params) => params,
        Err(e) => return fail(options, &request_id, &Value::Null, e),
    };
    let method = parts.method.clone();
    let uri = parts.uri.clone();
    let headers = parts.headers.clone();

    let mut input = match read_body(options, parts, body).await {
        Ok(input) => input,
        Err(e) => return fail(options, &request_id, &Value::Null, e),
    };
    if let Value::Object(fields) = &mut input {
        apply_params(fields, options, &query, &path_params);
    }
    let echo = redact(&input, &options.no_log_fields);

    let kind = if options.use_tx {
        ExecutorKind::Tx
    } else {
        ExecutorKind::Batch
    };
    let scope = session.read(DbScope::from_session);
    let db = match DbHandle::open(&ctx.app.database, kind, scope).await {
        Ok(db) => db,
        Err(e) => return fail(options, &request_id, &echo, e.into()),
    };

    let mut info = ReqInfo {
        request_id,
        method,
        uri,
        headers,
        path_params,
        query,
        session: session.clone(),
        db,
    };

    let result = match AssertUnwindSafe(handler.call(&mut info, input))
        .catch_unwind()
        .await
    {
        Ok(result) => result,
        Err(panic) => Err(ApiError::Internal(format!(
            "handler panicked: {}",
            panic_message(panic.as_ref())
        ))),
    };

    let released = info.db.release(result.is_ok()).await;
    let result = result.and_then(|output| released.map(|_| output).map_err(ApiError::from));

    let output = match result {
        Ok(output) => output,
        Err(e) => return fail(options, &request_id, &echo, e),
    };

    if options.resets_group {
        let group_id = session.group_id();
        if !group_id.is_empty() {
            if let Err(e) = ctx.app.sessions.reset_group_session(&group_id).await {
                tracing::error!(%request_id, group_id = %group_id, error = %e, "Group reset failed");
            }
        }
    }

    encode_output(options, output, &request_id)
}

fn fail(options: &HandlerOptions, request_id: &Uuid, echo: &Value, err: ApiError) -> Response {
    tracing::error!(
        %request_id,
        service_method = %options.service_method_name,
        request = %echo,
        error = %err,
        "Request failed"
    );
    err.into_request_response(request_id)
}

async fn read_params(
    options: &HandlerOptions,
    parts: &mut Parts,
) -> Result<(HashMap<String, String>, HashMap<String, String>), ApiError> {
    let path_params = if options.has_path_params {
        Path::<HashMap<String, String>>::from_request_parts(parts, &())
            .await
            .map(|Path(params)| params)
            .map_err(|e| ApiError::BadRequest(e.body_text()))?
    } else {
        HashMap::new()
    };

    let query = if options.has_query_params {
        Query::<HashMap<String, String>>::try_from_uri(&parts.uri)
            .map(|Query(query)| query)
            .map_err(|e| ApiError::BadRequest(e.body_text()))?
    } else {
        HashMap::new()
    };

    Ok((path_params, query))
}

async fn read_body(options: &HandlerOptions, parts: Parts, body: Body) -> Result<Value, ApiError> {
    if options.multipart_request {
        let request = Request::from_parts(parts, body);
        let multipart = Multipart::from_request(request, &())
            .await
            .map_err(|e| ApiError::BadRequest(e.body_text()))?;
        return read_multipart(multipart).await;
    }

    let bytes = axum::body::to_bytes(body, JSON_BODY_LIMIT)
        .await
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;
    if bytes.is_empty() {
        return Ok(Value::Object(Map::new()));
    }
    match serde_json::from_slice(&bytes) {
        Ok(value @ Value::Object(_)) => Ok(value),
        Ok(_) => Err(ApiError::BadRequest("expected a JSON object".to_string())),
        Err(e) => Err(ApiError::BadRequest(e.to_string())),
    }
}

/// Files become `contents[]` entries; plain fields are copied as strings.
async fn read_multipart(mut multipart: Multipart) -> Result<Value, ApiError> {
    let mut fields = Map::new();
    let mut contents = Vec::new();
    let mut total_length = 0usize;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::BadRequest(e.body_text()))?
    {
        let field_name = field.name().unwrap_or_default().to_string();
        match field.file_name().map(str::to_string) {
            Some(file_name) => {
                let mime_type = field
                    .content_type()
                    .unwrap_or("application/octet-stream")
                    .to_string();
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| ApiError::BadRequest(e.body_text()))?;
                total_length += bytes.len();
                contents.push(json!({
                    "name": file_name,
                    "mimeType": mime_type,
                    "content": STANDARD.encode(&bytes),
                    "contentLength": bytes.len(),
                }));
            }
            None => {
                let text = field
                    .text()
                    .await
                    .map_err(|e| ApiError::BadRequest(e.body_text()))?;
                fields.insert(field_name, Value::String(text));
            }
        }
    }

    fields.insert("contents".to_string(), Value::Array(contents));
    fields.insert("totalLength".to_string(), json!(total_length));
    Ok(Value::Object(fields))
}

/// Query values fill declared input fields; path values always win.
fn apply_params(
    input: &mut Map<String, Value>,
    options: &HandlerOptions,
    query: &HashMap<String, String>,
    path_params: &HashMap<String, String>,
) {
    for field in &options.query_fields {
        if let Some(value) = query.get(field) {
            input.insert(field.clone(), Value::String(value.clone()));
        }
    }
    for (name, value) in path_params {
        input.insert(name.clone(), Value::String(value.clone()));
    }
}

/// Copy of `input` without the no-log fields, for error logs.
fn redact(input: &Value, no_log_fields: &[String]) -> Value {
    match input {
        Value::Object(fields) => Value::Object(
            fields
                .iter()
                .filter(|(name, _)| !no_log_fields.contains(name))
                .map(|(name, value)| (name.clone(), value.clone()))
                .collect(),
        ),
        other => other.clone(),
    }
}

fn encode_output(options: &HandlerOptions, output: HandlerOutput, request_id: &Uuid) -> Response {
    match output {
        HandlerOutput::Bytes(bytes) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "application/octet-stream")],
            bytes,
        )
            .into_response(),
        HandlerOutput::Json(_) if options.multipart_response => fail(
            options,
            request_id,
            &Value::Null,
            ApiError::internal("handler returned JSON for a byte response"),
        ),
        HandlerOutput::Json(value) => (StatusCode::OK, Json(value)).into_response(),
    }
}

pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routing::descriptor::ServiceSchema;

    fn options() -> HandlerOptions {
        let schema = ServiceSchema::from_json(
            r#"{"services":[{"name":"S","methods":[{"name":"GetThing",
                "input":{"name":"In","fields":[{"name":"id"},{"name":"q"},{"name":"pin","noLog":true}]},
                "output":{"name":"Out"},
                "http":{"method":"GET","path":"/v1/things/{id}"}}]}]}"#,
        )
        .unwrap();
        HandlerOptions::from_descriptor(&schema.services[0].methods[0], "/api").unwrap()
    }

    #[test]
    fn test_params_merge_into_input() {
        let mut input = Map::new();
        input.insert("id".into(), json!("from-body"));
        let query = HashMap::from([("q".to_string(), "x".to_string()), ("zz".to_string(), "y".to_string())]);
        let path = HashMap::from([("id".to_string(), "42".to_string())]);

        apply_params(&mut input, &options(), &query, &path);
        assert_eq!(input["id"], json!("42"));
        assert_eq!(input["q"], json!("x"));
        assert!(!input.contains_key("zz"));
    }

    #[test]
    fn test_redact_drops_no_log_fields() {
        let echo = redact(&json!({"id": "1", "pin": "1234"}), &options().no_log_fields);
        assert_eq!(echo, json!({"id": "1"}));
    }

    #[test]
    fn test_panic_message() {
        let boxed: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(boxed.as_ref()), "boom");
        let boxed: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(boxed.as_ref()), "bang");
    }

    #[tokio::test]
    async fn test_empty_body_is_empty_object() {
        let parts = Request::new(()).into_parts().0;
        let value = read_body(&options(), parts, Body::empty()).await.unwrap();
        assert_eq!(value, json!({}));
    }

    #[tokio::test]
    async fn test_non_object_body_is_rejected() {
        let parts = Request::new(()).into_parts().0;
        let err = read_body(&options(), parts, Body::from("[1,2]")).await.unwrap_err();
        assert!(matches!(err, ApiError::BadRequest(_)));
    }
}
