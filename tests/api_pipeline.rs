//! End-to-end tests for login, the request pipeline, and the response cache.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use futures_util::FutureExt;
use reqwest::header::{IF_MODIFIED_SINCE, LAST_MODIFIED, SET_COOKIE, USER_AGENT};
use reqwest::StatusCode;
use serde_json::{json, Value};

use slotgate::config::LimiterConfig;
use slotgate::lifecycle::Services;
use slotgate::routing::{handler_fn, HandlerOutput, HandlerRegistry};

mod common;

use common::{schema_file, test_config, TestGateway};

fn method(name: &str, verb: &str, path: &str, options: Value) -> Value {
    json!({
        "name": name,
        "input": {"name": format!("{name}Request")},
        "output": {"name": format!("{name}Response")},
        "http": {"method": verb, "path": path},
        "options": options,
    })
}

fn schema() -> Value {
    json!({"services": [{
        "name": "BookingService",
        "methods": [
            method("GetBookings", "GET", "/v1/bookings", json!({"siteRole": "APP_GROUP_BOOKINGS", "cacheDuration": 180})),
            method("PostBooking", "POST", "/v1/bookings", json!({"siteRole": "APP_GROUP_BOOKINGS", "invalidations": ["bookings"]})),
            method("GetSettings", "GET", "/v1/settings", json!({"siteRole": "APP_GROUP_ADMIN"})),
            method("GetReports", "GET", "/v1/reports", json!({})),
            method("GetExplode", "GET", "/v1/explode", json!({"cache": "SKIP"})),
            method("GetGroup", "GET", "/v1/group", json!({"cache": "SKIP"})),
            method("ResetGroup", "POST", "/v1/group/reset", json!({"resetsGroup": true})),
            method("GetLimited", "GET", "/v1/limited", json!({"cache": "SKIP", "throttle": 1})),
        ],
    }]})
}

fn services(calls: Arc<AtomicUsize>) -> Services {
    let mut handlers = HandlerRegistry::new();
    handlers.register(
        "GetBookings",
        handler_fn(move |_, _| {
            let calls = calls.clone();
            async move {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                Ok(HandlerOutput::Json(json!({ "calls": n })))
            }
            .boxed()
        }),
    );
    handlers.register(
        "PostBooking",
        handler_fn(|info, input| {
            async move {
                info.tx()?
                    .execute("INSERT INTO bookings (name) VALUES ($1)", &[input["name"].clone()])
                    .await?;
                Ok(HandlerOutput::Json(json!({ "ok": true })))
            }
            .boxed()
        }),
    );
    handlers.register(
        "GetSettings",
        handler_fn(|_, _| async { Ok(HandlerOutput::Json(json!({}))) }.boxed()),
    );
    handlers.register(
        "GetExplode",
        handler_fn(|info, _| {
            async move {
                if !info.session().user_sub.is_empty() {
                    panic!("handler exploded");
                }
                Ok(HandlerOutput::Json(json!({})))
            }
            .boxed()
        }),
    );
    handlers.register(
        "GetGroup",
        handler_fn(|info, _| {
            async move {
                let (id, name) = info.session.read(|s| (s.group_id.clone(), s.group_name.clone()));
                Ok(HandlerOutput::Json(json!({ "groupId": id, "groupName": name })))
            }
            .boxed()
        }),
    );
    handlers.register(
        "ResetGroup",
        handler_fn(|_, _| async { Ok(HandlerOutput::Json(json!({}))) }.boxed()),
    );
    handlers.register(
        "GetLimited",
        handler_fn(|_, _| async { Ok(HandlerOutput::Json(json!({}))) }.boxed()),
    );
    Services {
        handlers,
        ..Services::default()
    }
}

async fn gateway() -> (TestGateway, Arc<AtomicUsize>, tempfile::TempDir) {
    let (dir, path) = schema_file(&schema());
    let calls = Arc::new(AtomicUsize::new(0));
    let gateway = TestGateway::spawn(test_config(Some(path)), services(calls.clone())).await;
    gateway
        .provider
        .add_user("code-ann", "ann", &["/acme/bookers"], &["APP_GROUP_BOOKINGS"]);
    (gateway, calls, dir)
}

#[tokio::test]
async fn test_login_sets_session_cookie() {
    let (gateway, _, _dir) = gateway().await;

    let status = gateway.get("/auth/status", None).await;
    assert_eq!(status.status(), StatusCode::UNAUTHORIZED);

    let cookie = gateway.login("code-ann").await;
    let status = gateway.get("/auth/status", Some(&cookie)).await;
    assert_eq!(status.status(), StatusCode::OK);
    let body: Value = status.json().await.unwrap();
    assert_eq!(body["authenticated"], true);
    assert_eq!(gateway.provider.exchanges.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_pkce_login_round_trip() {
    let (gateway, _, _dir) = gateway().await;
    let response = gateway
        .client
        .get(gateway.url("/auth/login?tz=America/Los_Angeles"))
        .header(USER_AGENT, "test/1.0")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FOUND);

    let location = url::Url::parse(response.headers()["location"].to_str().unwrap()).unwrap();
    assert_eq!(location.path(), "/realms/tenants/protocol/openid-connect/auth");
    let pairs: HashMap<String, String> = location.query_pairs().into_owned().collect();
    assert_eq!(pairs["response_type"], "code");
    assert_eq!(pairs["code_challenge_method"], "S256");
    assert_eq!(pairs["client_id"], common::CLIENT_ID);
    assert_eq!(pairs["redirect_uri"], "https://app.test/auth/callback");
    assert_eq!(pairs["scope"], "openid profile email groups");
    assert_eq!(pairs["code_challenge"].len(), 43);

    let callback = format!("/auth/callback?code=code-ann&state={}", pairs["state"]);
    let response = gateway.get(&callback, None).await;
    assert_eq!(response.status(), StatusCode::FOUND);
    assert_eq!(response.headers()["location"], "/app/");
    let cookie = response.headers()[SET_COOKIE].to_str().unwrap();
    assert!(cookie.starts_with("session_id="));
    for attribute in ["HttpOnly", "Secure", "SameSite=Strict", "Max-Age=3600"] {
        assert!(cookie.contains(attribute), "missing {attribute} in {cookie}");
    }

    let replay = gateway.get(&callback, None).await;
    assert_eq!(replay.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_login_without_timezone_is_rejected() {
    let (gateway, _, _dir) = gateway().await;
    let response = gateway
        .client
        .get(gateway.url("/auth/login"))
        .header(USER_AGENT, "integration-test")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_callback_with_unknown_state_is_rejected() {
    let (gateway, _, _dir) = gateway().await;
    let response = gateway.get("/auth/callback?code=code-ann&state=forged", None).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(gateway.provider.exchanges.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_logout_clears_cookie_and_session() {
    let (gateway, _, _dir) = gateway().await;
    let cookie = gateway.login("code-ann").await;

    let response = gateway.get("/auth/logout", Some(&cookie)).await;
    assert_eq!(response.status(), StatusCode::OK);
    let cleared = response.headers()[SET_COOKIE].to_str().unwrap();
    assert!(cleared.starts_with("session_id=;"));
    assert!(cleared.contains("Max-Age=0"));

    let status = gateway.get("/auth/status", Some(&cookie)).await;
    assert_eq!(status.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_tampered_cookie_is_unauthorized() {
    let (gateway, _, _dir) = gateway().await;
    let cookie = gateway.login("code-ann").await;
    let tampered = format!("{cookie}x");
    let response = gateway.get("/api/v1/bookings", Some(&tampered)).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_site_role_is_enforced() {
    let (gateway, calls, _dir) = gateway().await;
    let cookie = gateway.login("code-ann").await;

    let allowed = gateway.get("/api/v1/bookings", Some(&cookie)).await;
    assert_eq!(allowed.status(), StatusCode::OK);

    let denied = gateway.get("/api/v1/settings", Some(&cookie)).await;
    assert_eq!(denied.status(), StatusCode::FORBIDDEN);

    gateway
        .provider
        .add_user("code-cal", "cal", &["/acme/bookers"], &["APP_ROLE_CALL"]);
    let caller = gateway.login("code-cal").await;
    let denied = gateway.get("/api/v1/bookings", Some(&caller)).await;
    assert_eq!(denied.status(), StatusCode::FORBIDDEN);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_unimplemented_method_answers_501() {
    let (gateway, _, _dir) = gateway().await;
    let cookie = gateway.login("code-ann").await;
    let response = gateway.get("/api/v1/reports", Some(&cookie)).await;
    assert_eq!(response.status(), StatusCode::NOT_IMPLEMENTED);
}

#[tokio::test]
async fn test_handler_panic_becomes_500_with_request_id() {
    let (gateway, _, _dir) = gateway().await;
    let cookie = gateway.login("code-ann").await;

    let response = gateway.get("/api/v1/explode", Some(&cookie)).await;
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let body = response.text().await.unwrap();
    assert!(body.starts_with("Request Id: "));
    assert!(!body.contains("exploded"));
    assert_eq!(gateway.database.rollbacks(), 1);

    let again = gateway.get("/auth/status", Some(&cookie)).await;
    assert_eq!(again.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_session_is_bound_to_its_group() {
    let (gateway, _, _dir) = gateway().await;
    let cookie = gateway.login("code-ann").await;
    let body: Value = gateway.get("/api/v1/group", Some(&cookie)).await.json().await.unwrap();
    assert_eq!(body["groupId"], "g1");
}

#[tokio::test]
async fn test_write_commits_scoped_transaction() {
    let (gateway, _, _dir) = gateway().await;
    let cookie = gateway.login("code-ann").await;

    let response = gateway.post("/api/v1/bookings", &cookie, json!({"name": "haircut"})).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(gateway.database.commits(), 1);

    let statements = gateway.database.statements();
    assert_eq!(statements.len(), 1);
    assert_eq!(statements[0].scope.user_sub, "ann");
    assert_eq!(statements[0].scope.group_id, "g1");
}

#[tokio::test]
async fn test_malformed_body_is_bad_request() {
    let (gateway, _, _dir) = gateway().await;
    let cookie = gateway.login("code-ann").await;
    let response = gateway
        .client
        .post(gateway.url("/api/v1/bookings"))
        .header("cookie", &cookie)
        .body("{not json")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert!(response.text().await.unwrap().starts_with("Request Id: "));
}

#[tokio::test]
async fn test_cache_hit_unmodified_and_invalidation() {
    let (gateway, calls, _dir) = gateway().await;
    let cookie = gateway.login("code-ann").await;

    let first = gateway.get("/api/v1/bookings", Some(&cookie)).await;
    assert_eq!(first.headers()["x-cache-status"], "MISS");
    let last_modified = first.headers()[LAST_MODIFIED].to_str().unwrap().to_string();
    let body: Value = first.json().await.unwrap();
    assert_eq!(body["calls"], 1);

    let second = gateway.get("/api/v1/bookings", Some(&cookie)).await;
    assert_eq!(second.headers()["x-cache-status"], "HIT");
    let body: Value = second.json().await.unwrap();
    assert_eq!(body["calls"], 1);

    let conditional = gateway
        .client
        .get(gateway.url("/api/v1/bookings"))
        .header("cookie", &cookie)
        .header(IF_MODIFIED_SINCE, &last_modified)
        .send()
        .await
        .unwrap();
    assert_eq!(conditional.status(), StatusCode::NOT_MODIFIED);
    assert_eq!(conditional.headers()["x-cache-status"], "UNMODIFIED");

    let write = gateway.post("/api/v1/bookings", &cookie, json!({"name": "trim"})).await;
    assert_eq!(write.status(), StatusCode::OK);

    let after = gateway.get("/api/v1/bookings", Some(&cookie)).await;
    assert_eq!(after.headers()["x-cache-status"], "MISS");
    let body: Value = after.json().await.unwrap();
    assert_eq!(body["calls"], 2);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_cache_is_per_user() {
    let (gateway, calls, _dir) = gateway().await;
    gateway
        .provider
        .add_user("code-bob", "bob", &["/acme/bookers"], &["APP_GROUP_BOOKINGS"]);
    let ann = gateway.login("code-ann").await;
    let bob = gateway.login("code-bob").await;

    gateway.get("/api/v1/bookings", Some(&ann)).await;
    let response = gateway.get("/api/v1/bookings", Some(&bob)).await;
    assert_eq!(response.headers()["x-cache-status"], "MISS");
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_endpoint_throttle_is_per_user() {
    let (gateway, _, _dir) = gateway().await;
    let cookie = gateway.login("code-ann").await;

    let first = gateway.get("/api/v1/limited", Some(&cookie)).await;
    assert_eq!(first.status(), StatusCode::OK);
    let second = gateway.get("/api/v1/limited", Some(&cookie)).await;
    assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);
}

#[tokio::test]
async fn test_ip_rate_limit_denies_past_burst() {
    let (_dir, path) = schema_file(&schema());
    let mut config = test_config(Some(path));
    config.rate_limit.api = LimiterConfig { rate: 0.001, burst: 3 };
    let gateway = TestGateway::spawn(config, Services::default()).await;

    for _ in 0..3 {
        let response = gateway.get("/auth/status", None).await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }
    let response = gateway.get("/auth/status", None).await;
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
}

#[tokio::test]
async fn test_expiring_session_is_refreshed() {
    let (gateway, _, _dir) = gateway().await;
    gateway.provider.expires_in.store(5, Ordering::SeqCst);
    let cookie = gateway.login("code-ann").await;

    let response = gateway.get("/auth/status", Some(&cookie)).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert!(gateway.provider.refreshes.load(Ordering::SeqCst) >= 1);
}

#[tokio::test]
async fn test_failed_refresh_ends_only_that_session() {
    let (gateway, _, _dir) = gateway().await;
    gateway
        .provider
        .add_user("code-bob", "bob", &["/acme/bookers"], &["APP_GROUP_BOOKINGS"]);
    let bob = gateway.login("code-bob").await;

    gateway.provider.expires_in.store(5, Ordering::SeqCst);
    let ann = gateway.login("code-ann").await;
    gateway.provider.fail_refresh.store(true, Ordering::SeqCst);

    let response = gateway.get("/auth/status", Some(&ann)).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let response = gateway.get("/auth/status", Some(&ann)).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = gateway.get("/auth/status", Some(&bob)).await;
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_group_reset_refreshes_members() {
    let (gateway, _, _dir) = gateway().await;
    gateway
        .provider
        .add_user("code-bob", "bob", &["/acme/bookers"], &["APP_GROUP_BOOKINGS"]);
    let ann = gateway.login("code-ann").await;
    let bob = gateway.login("code-bob").await;

    let body: Value = gateway.get("/api/v1/group", Some(&bob)).await.json().await.unwrap();
    assert_eq!(body["groupName"], "acme");

    gateway.groups.rename_group("/acme", "Acme Studio");
    let before = gateway.provider.refreshes.load(Ordering::SeqCst);
    let response = gateway.post("/api/v1/group/reset", &ann, json!({})).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert!(gateway.provider.refreshes.load(Ordering::SeqCst) >= before + 2);

    let body: Value = gateway.get("/api/v1/group", Some(&bob)).await.json().await.unwrap();
    assert_eq!(body["groupId"], "g1");
    assert_eq!(body["groupName"], "Acme Studio");
}
