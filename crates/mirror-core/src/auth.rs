//! Bearer token verification.
//!
//! Tokens are HS256 JWTs issued elsewhere. Verification is stateless: the
//! signature and expiry are checked and the subject is extracted. There is no
//! revocation lookup.

use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

use crate::identity::Identity;

/// Credential verification failures.
///
/// Every variant means the connection must be closed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    /// No credential was presented.
    #[error("Missing credential")]
    Missing,

    /// The token is malformed, unsigned, wrongly signed, or lacks a subject.
    #[error("Invalid token: {0}")]
    Invalid(String),

    /// The token has expired.
    #[error("Token expired")]
    Expired,
}

#[derive(Debug, Deserialize)]
struct Claims {
    #[serde(default)]
    sub: Option<Value>,
    #[serde(default)]
    id: Option<Value>,
    #[serde(default, rename = "_id")]
    object_id: Option<Value>,
}

impl Claims {
    /// The first usable subject among `sub`, `id`, `_id`.
    fn subject(self) -> Option<String> {
        [self.sub, self.id, self.object_id]
            .into_iter()
            .flatten()
            .find_map(|value| match value {
                Value::String(s) if !s.is_empty() => Some(s),
                Value::Number(n) => Some(n.to_string()),
                _ => None,
            })
    }
}

/// Verifies bearer tokens and extracts the caller's identity.
#[derive(Clone)]
pub struct TokenVerifier {
    key: DecodingKey,
    validation: Validation,
}

impl TokenVerifier {
    /// Create a verifier for tokens signed with `secret`.
    #[must_use]
    pub fn new(secret: impl AsRef<[u8]>) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_aud = false;
        validation.set_required_spec_claims(&["exp"]);

        Self {
            key: DecodingKey::from_secret(secret.as_ref()),
            validation,
        }
    }

    /// Allow `secs` of clock skew when checking expiry.
    #[must_use]
    pub fn with_leeway(mut self, secs: u64) -> Self {
        self.validation.leeway = secs;
        self
    }

    /// Verify a token and return the identity it was issued to.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::Missing`] for an empty token,
    /// [`AuthError::Expired`] past expiry, and [`AuthError::Invalid`] for
    /// anything else that does not verify.
    pub fn verify(&self, token: &str) -> Result<Identity, AuthError> {
        let token = token.trim();
        if token.is_empty() {
            return Err(AuthError::Missing);
        }

        let data = decode::<Claims>(token, &self.key, &self.validation).map_err(|e| {
            match e.kind() {
                ErrorKind::ExpiredSignature => AuthError::Expired,
                _ => AuthError::Invalid(e.to_string()),
            }
        })?;

        data.claims
            .subject()
            .map(Identity::new)
            .ok_or_else(|| AuthError::Invalid("token has no subject".to_string()))
    }
}

impl std::fmt::Debug for TokenVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenVerifier")
            .field("leeway", &self.validation.leeway)
            .finish_non_exhaustive()
    }
}

/// Extract the token from an `Authorization: Bearer <token>` header value.
#[must_use]
pub fn bearer_token(header: &str) -> Option<&str> {
    let (scheme, token) = header.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    (!token.is_empty()).then_some(token)
}
