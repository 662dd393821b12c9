use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::{ChatRelayError, Result};

/// JWT claims carried by a bearer token
#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    /// Subject (user ID)
    pub sub: String,
    /// Expiration time (UTC timestamp)
    pub exp: usize,
    /// Issued at (UTC timestamp)
    pub iat: usize,
}

impl Claims {
    /// Claims for a user, valid for the given number of seconds
    pub fn new(user_id: String, ttl_secs: usize) -> Self {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as usize)
            .unwrap_or(0);
        Self {
            sub: user_id,
            exp: now + ttl_secs,
            iat: now,
        }
    }
}

/// Verifies a bearer token and resolves the authenticated principal.
/// Every failure mode (expired, bad signature, malformed) collapses into
/// one `AuthError`; the engine rejects the handshake identically for all.
pub trait TokenVerifier {
    fn verify(&self, token: &str) -> Result<String>;
}

/// HS256 token issue/verify on a shared secret
pub struct TokenManager {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
}

impl TokenManager {
    pub fn new(secret: &str) -> Self {
        Self {
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            validation: Validation::default(),
        }
    }

    /// Issue a signed token for a user. Used by the login layer and tests.
    pub fn issue(&self, user_id: &str, ttl_secs: usize) -> Result<String> {
        let claims = Claims::new(user_id.to_string(), ttl_secs);
        encode(&Header::default(), &claims, &self.encoding_key)
            .map_err(|e| ChatRelayError::AuthError(format!("Failed to issue token: {}", e)))
    }
}

impl TokenVerifier for TokenManager {
    fn verify(&self, token: &str) -> Result<String> {
        decode::<Claims>(token, &self.decoding_key, &self.validation)
            .map(|data| data.claims.sub)
            .map_err(|e| ChatRelayError::AuthError(format!("Invalid token: {}", e)))
    }
}
