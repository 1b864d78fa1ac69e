//! Signed, time-bound credentials.
//!
//! Credentials are HS256 JWTs carrying the user's id, username and email.
//! Every service that validates them shares the same secret.

use chrono::{Duration, Utc};
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Lifetime of an issued credential, in seconds.
pub const DEFAULT_CREDENTIAL_LIFETIME_SECS: i64 = 24 * 60 * 60;

/// Clock skew tolerated when checking `exp`, in seconds.
const LEEWAY_SECS: u64 = 5;

/// Errors from issuing or verifying a credential.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CredentialError {
    /// Signature was fine but `exp` has passed.
    #[error("credential expired")]
    Expired,

    /// Malformed token, bad signature or unexpected algorithm.
    #[error("invalid credential: {0}")]
    Invalid(String),

    #[error("failed to sign credential: {0}")]
    Signing(String),
}

/// Claims embedded in a credential.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    pub id: String,
    pub username: String,
    pub email: String,
    pub iat: i64,
    pub exp: i64,
}

/// The identity a request acts as once its credential checks out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub id: String,
    pub username: String,
    pub email: String,
}

impl From<Claims> for Identity {
    fn from(claims: Claims) -> Self {
        Self {
            id: claims.id,
            username: claims.username,
            email: claims.email,
        }
    }
}

/// Issues and verifies credentials with a shared HMAC secret.
#[derive(Clone)]
pub struct CredentialCodec {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
    lifetime: Duration,
}

impl std::fmt::Debug for CredentialCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialCodec")
            .field("lifetime", &self.lifetime)
            .finish_non_exhaustive()
    }
}

impl CredentialCodec {
    #[must_use]
    pub fn new(secret: &[u8]) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        validation.leeway = LEEWAY_SECS;
        validation.set_required_spec_claims(&["exp"]);

        Self {
            encoding_key: EncodingKey::from_secret(secret),
            decoding_key: DecodingKey::from_secret(secret),
            validation,
            lifetime: Duration::seconds(DEFAULT_CREDENTIAL_LIFETIME_SECS),
        }
    }

    #[must_use]
    pub fn with_lifetime(mut self, lifetime: Duration) -> Self {
        self.lifetime = lifetime;
        self
    }

    #[must_use]
    pub fn lifetime(&self) -> Duration {
        self.lifetime
    }

    /// Signs a credential for `identity`, valid from now for the configured
    /// lifetime.
    ///
    /// # Errors
    ///
    /// Returns [`CredentialError::Signing`] if encoding fails.
    pub fn issue(&self, identity: &Identity) -> Result<String, CredentialError> {
        let now = Utc::now();
        let claims = Claims {
            id: identity.id.clone(),
            username: identity.username.clone(),
            email: identity.email.clone(),
            iat: now.timestamp(),
            exp: (now + self.lifetime).timestamp(),
        };
        self.sign(&claims)
    }

    /// Signs arbitrary claims. Used to mint credentials with chosen
    /// timestamps.
    ///
    /// # Errors
    ///
    /// Returns [`CredentialError::Signing`] if encoding fails.
    pub fn sign(&self, claims: &Claims) -> Result<String, CredentialError> {
        encode(&Header::new(Algorithm::HS256), claims, &self.encoding_key)
            .map_err(|e| CredentialError::Signing(e.to_string()))
    }

    /// Checks signature and expiry, returning the embedded claims.
    ///
    /// # Errors
    ///
    /// [`CredentialError::Expired`] when `exp` has passed (beyond leeway),
    /// [`CredentialError::Invalid`] for anything else.
    pub fn verify(&self, token: &str) -> Result<Claims, CredentialError> {
        decode::<Claims>(token, &self.decoding_key, &self.validation)
            .map(|data| data.claims)
            .map_err(|e| match e.kind() {
                ErrorKind::ExpiredSignature => CredentialError::Expired,
                _ => CredentialError::Invalid(e.to_string()),
            })
    }
}
