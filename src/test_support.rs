//! Fixtures shared by unit tests: an RSA key pair, a token minter, and an
//! in-memory identity provider.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::OnceLock;

use async_trait::async_trait;
use dashmap::DashMap;
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use rsa::{pkcs1::EncodeRsaPrivateKey, pkcs8::EncodePublicKey, RsaPrivateKey};
use serde_json::json;

use crate::auth::{IdentityProvider, OidcTokens, ProviderError, ProviderGroup, TokenValidator};
use crate::session::CachedGroup;

pub const CLIENT_ID: &str = "slotgate";

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
        let exp = chrono::Utc::now().timestamp() + expires_in;
        let claims = json!({
            "sub": sub,
            "email": format!("{sub}@example.test"),
            "groups": groups,
            "azp": CLIENT_ID,
            "resource_access": { CLIENT_ID: { "roles": roles } },
            "exp": exp,
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

/// Provider that mints tokens for registered users.
pub struct StubProvider {
    codes: DashMap<String, String>,
    users: DashMap<String, StubUser>,
    pub refreshes: AtomicUsize,
    pub fail_refresh: AtomicBool,
    pub expires_in: AtomicI64,
}

impl StubProvider {
    pub fn new() -> Self {
        Self {
            codes: DashMap::new(),
            users: DashMap::new(),
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
        "https://idp.test/auth".into()
    }

    async fn exchange_code(&self, code: &str, _code_verifier: &str) -> Result<OidcTokens, ProviderError> {
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

pub fn stub_group(id: &str, path: &str) -> CachedGroup {
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
