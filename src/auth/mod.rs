//! Authentication subsystem.
//!
//! # Data Flow
//! ```text
//! GET /auth/login
//!     → pkce.rs (verifier, challenge, state)
//!     → redirect to provider authorization endpoint
//!
//! GET /auth/callback
//!     → provider.rs (code + verifier → tokens)
//!     → token.rs (RS256 verify, role mask)
//!     → session manager (store, signed cookie)
//! ```

pub mod pkce;
pub mod provider;
pub mod routes;
pub mod token;

pub use provider::{IdentityProvider, KeycloakProvider, ProviderError, ProviderGroup};
pub use token::{OidcTokens, TokenError, TokenValidator};
