//! Validation of the bearer token carried in request headers.

use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};

use crate::error::{Result, TransportError};

/// Claims of a validated token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenClaims {
    /// Subject, the authenticated user.
    pub sub: String,
    /// Expiry, seconds since the epoch.
    pub exp: u64,
}

/// Checks a request token before any data moves.
pub trait TokenValidator: Send + Sync {
    /// Returns the claims of a valid token or an `AuthenticationFailure`.
    fn validate(&self, token: &str) -> Result<TokenClaims>;
}

/// Accepts every token, for agents running without security.
#[derive(Debug, Default, Clone, Copy)]
pub struct AcceptAnyToken;

impl TokenValidator for AcceptAnyToken {
    fn validate(&self, _token: &str) -> Result<TokenClaims> {
        Ok(TokenClaims {
            sub: "anonymous".to_string(),
            exp: 0,
        })
    }
}

/// HS256 JWT validation with a shared secret.
pub struct JwtTokenValidator {
    key: DecodingKey,
    validation: Validation,
}

impl JwtTokenValidator {
    /// Validator for tokens signed with `secret`.
    pub fn new(secret: &[u8]) -> Self {
        Self {
            key: DecodingKey::from_secret(secret),
            validation: Validation::new(Algorithm::HS256),
        }
    }
}

impl std::fmt::Debug for JwtTokenValidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JwtTokenValidator").finish_non_exhaustive()
    }
}

impl TokenValidator for JwtTokenValidator {
    fn validate(&self, token: &str) -> Result<TokenClaims> {
        if token.is_empty() {
            return Err(TransportError::AuthenticationFailure {
                reason: "missing token".to_string(),
            });
        }
        decode::<TokenClaims>(token, &self.key, &self.validation)
            .map(|data| data.claims)
            .map_err(|e| TransportError::AuthenticationFailure {
                reason: e.to_string(),
            })
    }
}
