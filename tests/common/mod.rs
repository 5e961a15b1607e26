//! Shared harness for the integration suites: an RSA key pair, a stub
//! identity provider, in-process backends, and a gateway bound to an
//! ephemeral port.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use reqwest::header::{COOKIE, LOCATION, SET_COOKIE, USER_AGENT};
use reqwest::StatusCode;
use rsa::{pkcs1::EncodeRsaPrivateKey, pkcs8::EncodePublicKey, RsaPrivateKey};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

use slotgate::auth::{IdentityProvider, OidcTokens, ProviderError, ProviderGroup, TokenValidator};
use slotgate::config::AppConfig;
use slotgate::db::MemoryDatabase;
use slotgate::lifecycle::{Application, Backends, Services, Shutdown};
use slotgate::session::{CachedGroup, StaticGroupSource};
use slotgate::socket::{Codec, SocketMessage};

pub const CLIENT_ID: &str = "slotgate";
pub const SIGNING_KEY: &str = "integration-signing-key";

pub struct TestKeys {
    private_pem: String,
    public_pem: String,
}

impl TestKeys {
    pub fn get() -> &'static TestKeys {
        static KEYS: OnceLock<TestKeys> = OnceLock::new();
        KEYS.get_or_init(|| {
            let mut rng = rand::thread_rng();
            let private_key = RsaPrivateKey::new(&mut rng, 2048).expect("Failed to generate RSA key");
            let private_pem = private_key
                .to_pkcs1_pem(rsa::pkcs1::LineEnding::LF)
                .expect("Failed to convert private key to PEM")
                .to_string();
            let public_pem = private_key
                .to_public_key()
                .to_public_key_pem(rsa::pkcs8::LineEnding::LF)
                .expect("Failed to convert public key to PEM");
            TestKeys { private_pem, public_pem }
        })
    }

    pub fn validator(&self) -> TokenValidator {
        TokenValidator::from_rsa_pem(self.public_pem.as_bytes()).expect("valid public key")
    }

    pub fn mint(&self, sub: &str, groups: &[String], roles: &[String], expires_in: i64) -> String {
        let claims = json!({
            "sub": sub,
            "email": format!("{sub}@example.test"),
            "groups": groups,
            "azp": CLIENT_ID,
            "resource_access": { CLIENT_ID: { "roles": roles } },
            "exp": chrono::Utc::now().timestamp() + expires_in,
        });
        let key = EncodingKey::from_rsa_pem(self.private_pem.as_bytes()).expect("valid private key");
        encode(&Header::new(Algorithm::RS256), &claims, &key).expect("token encodes")
    }
}

#[derive(Clone)]
struct StubUser {
    groups: Vec<String>,
    roles: Vec<String>,
}

/// Identity provider that mints tokens for registered users and counts calls.
pub struct StubProvider {
    codes: DashMap<String, String>,
    users: DashMap<String, StubUser>,
    pub exchanges: AtomicUsize,
    pub refreshes: AtomicUsize,
    pub fail_refresh: AtomicBool,
    pub expires_in: AtomicI64,
}

impl StubProvider {
    pub fn new() -> Self {
        Self {
            codes: DashMap::new(),
            users: DashMap::new(),
            exchanges: AtomicUsize::new(0),
            refreshes: AtomicUsize::new(0),
            fail_refresh: AtomicBool::new(false),
            expires_in: AtomicI64::new(300),
        }
    }

    pub fn add_user(&self, code: &str, sub: &str, groups: &[&str], roles: &[&str]) {
        self.codes.insert(code.to_string(), sub.to_string());
        self.users.insert(
            sub.to_string(),
            StubUser {
                groups: groups.iter().map(|g| g.to_string()).collect(),
                roles: roles.iter().map(|r| r.to_string()).collect(),
            },
        );
    }

    fn tokens_for(&self, sub: &str) -> Result<OidcTokens, ProviderError> {
        let user = self
            .users
            .get(sub)
            .map(|u| u.clone())
            .ok_or_else(|| ProviderError::Rejected { status: 400, body: "unknown user".into() })?;
        let expires_in = self.expires_in.load(Ordering::SeqCst);
        Ok(OidcTokens {
            id_token: "id".into(),
            access_token: TestKeys::get().mint(sub, &user.groups, &user.roles, expires_in),
            refresh_token: format!("refresh:{sub}"),
            expires_in,
            refresh_expires_in: 3600,
        })
    }
}

#[async_trait]
impl IdentityProvider for StubProvider {
    fn authorization_endpoint(&self) -> String {
        "https://idp.test/realms/tenants/protocol/openid-connect/auth".into()
    }

    async fn exchange_code(&self, code: &str, code_verifier: &str) -> Result<OidcTokens, ProviderError> {
        self.exchanges.fetch_add(1, Ordering::SeqCst);
        if code_verifier.len() < 43 {
            return Err(ProviderError::Rejected { status: 400, body: "bad verifier".into() });
        }
        let sub = self
            .codes
            .get(code)
            .map(|s| s.clone())
            .ok_or_else(|| ProviderError::Rejected { status: 400, body: "bad code".into() })?;
        self.tokens_for(&sub)
    }

    async fn refresh(&self, refresh_token: &str) -> Result<OidcTokens, ProviderError> {
        self.refreshes.fetch_add(1, Ordering::SeqCst);
        if self.fail_refresh.load(Ordering::SeqCst) {
            return Err(ProviderError::Rejected { status: 400, body: "invalid_grant".into() });
        }
        let sub = refresh_token.strip_prefix("refresh:").unwrap_or_default();
        self.tokens_for(sub)
    }

    async fn sub_groups(&self, _group_external_id: &str) -> Result<Vec<ProviderGroup>, ProviderError> {
        Ok(Vec::new())
    }
}

pub fn group(id: &str, path: &str) -> CachedGroup {
    CachedGroup {
        id: id.to_string(),
        path: path.to_string(),
        external_id: format!("ext-{id}"),
        sub: format!("system-{id}"),
        name: path.trim_start_matches('/').to_string(),
        code: format!("code-{id}"),
        ai: false,
        sub_group_paths: Vec::new(),
    }
}

/// Config for a gateway on loopback with no side listeners.
pub fn test_config(schema_path: Option<String>) -> AppConfig {
    let mut config = AppConfig::default();
    config.listener.bind_address = "127.0.0.1:0".to_string();
    config.auth.client_id = CLIENT_ID.to_string();
    config.auth.app_host_url = "https://app.test".to_string();
    config.auth.signing_key = SIGNING_KEY.to_string();
    config.schema_path = schema_path;
    config
}

/// Write `schema` to a temp file that lives as long as the returned guard.
pub fn schema_file(schema: &Value) -> (tempfile::TempDir, String) {
    let dir = tempfile::tempdir().expect("temp dir");
    let path = dir.path().join("schema.json");
    std::fs::write(&path, schema.to_string()).expect("schema written");
    let path = path.to_string_lossy().into_owned();
    (dir, path)
}

pub struct TestGateway {
    pub addr: SocketAddr,
    pub provider: Arc<StubProvider>,
    pub groups: Arc<StaticGroupSource>,
    pub database: MemoryDatabase,
    pub shutdown: Arc<Shutdown>,
    pub client: reqwest::Client,
}

impl TestGateway {
    /// Build the application around stub backends and serve it on an
    /// ephemeral port.
    pub async fn spawn(config: AppConfig, services: Services) -> TestGateway {
        let provider = Arc::new(StubProvider::new());
        let groups = Arc::new(StaticGroupSource::new());
        groups.put_group(group("g1", "/acme"), &[("bookers", "ext-bookers"), ("admins", "ext-admins")]);
        let database = MemoryDatabase::new();

        let backends = Backends {
            database: Arc::new(database.clone()),
            groups: groups.clone(),
            ..Backends::in_process(provider.clone(), Arc::new(TestKeys::get().validator()))
        };

        let app = Application::build(config, backends, services).expect("application builds");
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr");

        let shutdown = Arc::new(Shutdown::new());
        let running = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = app.run(listener, &running).await {
                panic!("gateway failed: {e}");
            }
        });

        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .expect("client builds");

        TestGateway {
            addr,
            provider,
            groups,
            database,
            shutdown,
            client,
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub async fn get(&self, path: &str, cookie: Option<&str>) -> reqwest::Response {
        let mut request = self.client.get(self.url(path));
        if let Some(cookie) = cookie {
            request = request.header(COOKIE, cookie);
        }
        request.send().await.expect("request sent")
    }

    pub async fn post(&self, path: &str, cookie: &str, body: Value) -> reqwest::Response {
        self.client
            .post(self.url(path))
            .header(COOKIE, cookie)
            .json(&body)
            .send()
            .await
            .expect("request sent")
    }

    /// Run the login and callback round trip for `code`; returns the
    /// `session_id=<signed>` pair to send back as a cookie.
    pub async fn login(&self, code: &str) -> String {
        let response = self
            .client
            .get(self.url("/auth/login?tz=Europe%2FLondon"))
            .header(USER_AGENT, "integration-test")
            .send()
            .await
            .expect("login sent");
        assert_eq!(response.status(), StatusCode::FOUND);
        let location = response.headers()[LOCATION].to_str().expect("ascii location").to_string();
        let location = url::Url::parse(&location).expect("absolute location");
        let state = location
            .query_pairs()
            .find(|(k, _)| k == "state")
            .map(|(_, v)| v.into_owned())
            .expect("state in redirect");

        let callback = url::form_urlencoded::Serializer::new(String::new())
            .append_pair("code", code)
            .append_pair("state", &state)
            .finish();
        let response = self.get(&format!("/auth/callback?{callback}"), None).await;
        assert_eq!(response.status(), StatusCode::FOUND);
        session_cookie(&response).expect("session cookie set")
    }

    /// Fetch a socket ticket and open a WebSocket with it.
    pub async fn connect_socket(&self, cookie: &str) -> TestSocket {
        let ticket = self.ticket(cookie).await;
        let (stream, _) = connect_async(self.socket_url(&ticket))
            .await
            .expect("socket upgrade");
        TestSocket {
            stream,
            codec: Codec::new(5, 64 * 1024),
        }
    }

    pub async fn ticket(&self, cookie: &str) -> String {
        let body: Value = self
            .get("/api/v1/sock/ticket", Some(cookie))
            .await
            .json()
            .await
            .expect("ticket json");
        body["ticket"].as_str().expect("ticket string").to_string()
    }

    pub fn socket_url(&self, ticket: &str) -> String {
        let query = url::form_urlencoded::Serializer::new(String::new())
            .append_pair("ticket", ticket)
            .finish();
        format!("ws://{}/sock?{query}", self.addr)
    }
}

impl Drop for TestGateway {
    fn drop(&mut self) {
        self.shutdown.trigger();
    }
}

pub fn session_cookie(response: &reqwest::Response) -> Option<String> {
    response
        .headers()
        .get_all(SET_COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .find(|v| v.starts_with("session_id="))
        .and_then(|v| v.split(';').next())
        .map(str::to_string)
}

pub struct TestSocket {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    codec: Codec,
}

impl TestSocket {
    pub async fn send(&mut self, message: &SocketMessage) {
        let frame = self.codec.encode(message).expect("frame encodes");
        self.stream.send(Message::text(frame)).await.expect("frame sent");
    }

    /// Next decoded frame, skipping control frames. Panics after two seconds.
    pub async fn recv(&mut self) -> SocketMessage {
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                match self.stream.next().await {
                    Some(Ok(Message::Text(text))) => {
                        return self.codec.decode(text.as_str().as_bytes()).expect("frame decodes")
                    }
                    Some(Ok(_)) => continue,
                    other => panic!("socket ended: {other:?}"),
                }
            }
        })
        .await
        .expect("frame within deadline")
    }

    pub async fn close(mut self) {
        self.stream.close(None).await.expect("socket closed");
    }

    /// True when nothing but control frames arrives for `wait`.
    pub async fn is_quiet(&mut self, wait: Duration) -> bool {
        tokio::time::timeout(wait, async {
            loop {
                match self.stream.next().await {
                    Some(Ok(Message::Text(_))) | Some(Ok(Message::Binary(_))) => return,
                    Some(Ok(_)) => continue,
                    _ => std::future::pending::<()>().await,
                }
            }
        })
        .await
        .is_err()
    }
}
