//! Identity provider client.
//!
//! # Responsibilities
//! - Exchange an authorization code (plus PKCE verifier) for tokens
//! - Refresh a token bundle
//! - Enumerate a group's sub-groups through the admin API
//! - Fetch the realm public key used to verify access tokens
//!
//! # Design Decisions
//! - The manager only sees the [`IdentityProvider`] trait; tests swap in stubs
//! - Admin calls use a client-credentials token cached until shortly before
//!   it expires

use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::Mutex;

use crate::auth::token::OidcTokens;
use crate::config::AuthConfig;

#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    #[error("provider request failed: {0}")]
    Http(String),

    #[error("provider rejected request ({status}): {body}")]
    Rejected { status: u16, body: String },

    #[error("unexpected provider response: {0}")]
    Decode(String),
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            ProviderError::Decode(err.to_string())
        } else {
            ProviderError::Http(err.to_string())
        }
    }
}

/// A sub-group as the provider reports it.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ProviderGroup {
    pub id: String,
    pub name: String,
    pub path: String,
}

#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Authorization endpoint that `/auth/login` redirects to.
    fn authorization_endpoint(&self) -> String;

    async fn exchange_code(&self, code: &str, code_verifier: &str) -> Result<OidcTokens, ProviderError>;

    async fn refresh(&self, refresh_token: &str) -> Result<OidcTokens, ProviderError>;

    async fn sub_groups(&self, group_external_id: &str) -> Result<Vec<ProviderGroup>, ProviderError>;
}

#[derive(Debug, Deserialize)]
struct RealmInfo {
    public_key: String,
}

#[derive(Debug, Deserialize)]
struct ClientCredentials {
    access_token: String,
    #[serde(default)]
    expires_in: u64,
}

struct AdminToken {
    token: String,
    expires: Instant,
}

/// Keycloak over HTTP.
pub struct KeycloakProvider {
    config: AuthConfig,
    client: reqwest::Client,
    admin_token: Mutex<Option<AdminToken>>,
}

impl KeycloakProvider {
    pub fn new(config: AuthConfig) -> Result<Self, ProviderError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            config,
            client,
            admin_token: Mutex::new(None),
        })
    }

    /// Fetch the realm's bare base64 public key.
    pub async fn realm_public_key(&self) -> Result<String, ProviderError> {
        let response = self.client.get(self.config.realm_url()).send().await?;
        let info: RealmInfo = Self::check(response).await?.json().await?;
        Ok(info.public_key)
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response, ProviderError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(ProviderError::Rejected {
            status: status.as_u16(),
            body,
        })
    }

    async fn token_request(&self, form: &[(&str, &str)]) -> Result<OidcTokens, ProviderError> {
        let response = self
            .client
            .post(&self.config.token_url)
            .form(form)
            .send()
            .await?;
        Ok(Self::check(response).await?.json().await?)
    }

    async fn admin_token(&self) -> Result<String, ProviderError> {
        let mut cached = self.admin_token.lock().await;
        if let Some(token) = cached.as_ref() {
            if token.expires > Instant::now() {
                return Ok(token.token.clone());
            }
        }

        let response = self
            .client
            .post(&self.config.token_url)
            .form(&[
                ("grant_type", "client_credentials"),
                ("client_id", self.config.client_id.as_str()),
                ("client_secret", self.config.client_secret.as_str()),
            ])
            .send()
            .await?;
        let creds: ClientCredentials = Self::check(response).await?.json().await?;

        let lifetime = Duration::from_secs(creds.expires_in.saturating_sub(10));
        *cached = Some(AdminToken {
            token: creds.access_token.clone(),
            expires: Instant::now() + lifetime,
        });
        Ok(creds.access_token)
    }
}

#[async_trait]
impl IdentityProvider for KeycloakProvider {
    fn authorization_endpoint(&self) -> String {
        self.config.auth_url.clone()
    }

    async fn exchange_code(&self, code: &str, code_verifier: &str) -> Result<OidcTokens, ProviderError> {
        let redirect_uri = self.config.redirect_uri();
        self.token_request(&[
            ("grant_type", "authorization_code"),
            ("client_id", self.config.client_id.as_str()),
            ("client_secret", self.config.client_secret.as_str()),
            ("redirect_uri", redirect_uri.as_str()),
            ("code", code),
            ("code_verifier", code_verifier),
        ])
        .await
    }

    async fn refresh(&self, refresh_token: &str) -> Result<OidcTokens, ProviderError> {
        self.token_request(&[
            ("grant_type", "refresh_token"),
            ("client_id", self.config.client_id.as_str()),
            ("client_secret", self.config.client_secret.as_str()),
            ("refresh_token", refresh_token),
        ])
        .await
    }

    async fn sub_groups(&self, group_external_id: &str) -> Result<Vec<ProviderGroup>, ProviderError> {
        let token = self.admin_token().await?;
        let url = format!(
            "{}/admin/realms/{}/groups/{}/children",
            self.config.internal_url.trim_end_matches('/'),
            self.config.realm,
            group_external_id
        );
        let response = self.client.get(url).bearer_auth(token).send().await?;
        Ok(Self::check(response).await?.json().await?)
    }
}
