//! Access-token validation.
//!
//! The provider signs access tokens with its realm RSA key. Validation accepts
//! RS256 only, enforces expiry with zero leeway, and folds the client roles
//! granted under `resource_access[azp]` into the session's role mask.

use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::security::roles::role_bits;
use crate::session::types::{now_nanos, UserSession};

/// Upper bound on an encoded access token.
pub const MAX_TOKEN_SIZE: usize = 30 * 1024;

const NANOS_PER_SEC: i64 = 1_000_000_000;

/// Token bundle returned by the provider's token endpoint.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OidcTokens {
    #[serde(default)]
    pub id_token: String,
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: String,
    #[serde(default)]
    pub expires_in: i64,
    #[serde(default)]
    pub refresh_expires_in: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TokenError {
    #[error("token exceeds {} bytes", MAX_TOKEN_SIZE)]
    TooLarge,

    #[error("malformed token: {0}")]
    Malformed(String),

    #[error("invalid token signature")]
    InvalidSignature,

    #[error("unexpected token algorithm")]
    WrongAlgorithm,

    #[error("token expired")]
    Expired,

    #[error("invalid public key: {0}")]
    InvalidKey(String),
}

#[derive(Debug, Default, Deserialize)]
struct ClientRoles {
    #[serde(default)]
    roles: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct AccessClaims {
    sub: String,
    #[serde(default)]
    email: String,
    #[serde(default)]
    groups: Vec<String>,
    #[serde(default)]
    azp: String,
    #[serde(default)]
    resource_access: HashMap<String, ClientRoles>,
}

/// Verifies access tokens against the realm public key.
///
/// The key sits behind an [`ArcSwap`] so a rotated realm key can be installed
/// without rebuilding the session manager.
pub struct TokenValidator {
    key: ArcSwap<DecodingKey>,
    validation: Validation,
}

impl TokenValidator {
    pub fn new(key: DecodingKey) -> Self {
        let mut validation = Validation::new(Algorithm::RS256);
        validation.leeway = 0;
        validation.validate_aud = false;
        validation.set_required_spec_claims(&["exp", "sub"]);

        Self {
            key: ArcSwap::from_pointee(key),
            validation,
        }
    }

    /// Build from a PEM-encoded RSA public key.
    pub fn from_rsa_pem(pem: &[u8]) -> Result<Self, TokenError> {
        let key = DecodingKey::from_rsa_pem(pem).map_err(|e| TokenError::InvalidKey(e.to_string()))?;
        Ok(Self::new(key))
    }

    /// Build from the bare base64 key published at the realm endpoint.
    pub fn from_realm_key(public_key: &str) -> Result<Self, TokenError> {
        Self::from_rsa_pem(realm_key_pem(public_key).as_bytes())
    }

    pub fn rotate(&self, key: DecodingKey) {
        self.key.store(Arc::new(key));
    }

    /// Validate the access token and build a session from the bundle.
    pub fn validate(
        &self,
        tokens: &OidcTokens,
        user_agent: &str,
        timezone: &str,
        anon_ip: &str,
    ) -> Result<UserSession, TokenError> {
        let token = tokens.access_token.as_str();
        if token.len() > MAX_TOKEN_SIZE {
            return Err(TokenError::TooLarge);
        }
        if token.split('.').count() != 3 {
            return Err(TokenError::Malformed("expected three segments".to_string()));
        }

        let header = decode_header(token).map_err(|e| TokenError::Malformed(e.to_string()))?;
        if header.alg != Algorithm::RS256 {
            return Err(TokenError::WrongAlgorithm);
        }

        let key = self.key.load();
        let data = decode::<AccessClaims>(token, &key, &self.validation).map_err(|e| {
            match e.kind() {
                ErrorKind::ExpiredSignature => TokenError::Expired,
                ErrorKind::InvalidSignature => TokenError::InvalidSignature,
                ErrorKind::InvalidAlgorithm => TokenError::WrongAlgorithm,
                _ => TokenError::Malformed(e.to_string()),
            }
        })?;
        let claims = data.claims;

        let roles = claims
            .resource_access
            .get(&claims.azp)
            .map(|client| role_bits(&client.roles))
            .unwrap_or(0);

        let now = now_nanos();
        Ok(UserSession {
            user_sub: claims.sub,
            user_email: claims.email,
            id_token: tokens.id_token.clone(),
            access_token: tokens.access_token.clone(),
            access_expires_at: now.saturating_add(tokens.expires_in.saturating_mul(NANOS_PER_SEC)),
            refresh_token: tokens.refresh_token.clone(),
            refresh_expires_at: now
                .saturating_add(tokens.refresh_expires_in.saturating_mul(NANOS_PER_SEC)),
            anon_ip: anon_ip.to_string(),
            timezone: timezone.to_string(),
            user_agent: user_agent.to_string(),
            sub_group_paths: claims.groups,
            role_bits: roles,
            ..Default::default()
        })
    }
}

/// Wrap a bare base64 SubjectPublicKeyInfo in PEM armor.
pub fn realm_key_pem(public_key: &str) -> String {
    format!("-----BEGIN PUBLIC KEY-----\n{public_key}\n-----END PUBLIC KEY-----\n")
}
