//! Producer and consumer authentication for the broker.
//!
//! Producers sign the raw body of every publish request with an Ed25519 key
//! and send two headers:
//!
//! - `X-Source-ID`: the producer's registered identifier
//! - `X-Signature`: base64 Ed25519 signature of the request body
//!
//! The broker holds the matching public keys in a [`ProducerKeys`] registry
//! built from `AUTHBUS_PRODUCER_KEYS`. Keys are decoded once at startup so a
//! malformed key fails configuration, not the first publish.
//!
//! Consumers present a shared bearer token, compared in constant time.
//!
//! # Example
//!
//! ```rust
//! use authbus_bus::auth::{validate_consumer_token, AuthError};
//!
//! assert!(validate_consumer_token("secret", Some("secret")).is_ok());
//! assert_eq!(
//!     validate_consumer_token("secret", None),
//!     Err(AuthError::MissingToken)
//! );
//! ```

use std::collections::HashMap;

use base64::prelude::*;
use ed25519_dalek::{Signature, VerifyingKey, PUBLIC_KEY_LENGTH, SIGNATURE_LENGTH};
use subtle::ConstantTimeEq;
use thiserror::Error;

/// Errors raised while authenticating a producer or consumer.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthError {
    /// The source is not registered.
    #[error("unknown source: {0}")]
    UnknownSource(String),

    /// The signature did not verify against the registered key.
    #[error("invalid signature")]
    InvalidSignature,

    /// Base64 decoding failed for the named field.
    #[error("invalid base64 encoding for {0}")]
    InvalidBase64(String),

    /// The decoded public key is not a valid Ed25519 point.
    #[error("invalid public key for source {0}")]
    InvalidPublicKey(String),

    /// No bearer token was presented.
    #[error("missing consumer token")]
    MissingToken,

    /// The bearer token does not match.
    #[error("invalid consumer token")]
    InvalidToken,
}

impl AuthError {
    pub fn unknown_source(source_id: impl Into<String>) -> Self {
        Self::UnknownSource(source_id.into())
    }

    pub fn invalid_base64(field: impl Into<String>) -> Self {
        Self::InvalidBase64(field.into())
    }

    /// Machine-readable code for broker error bodies.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::UnknownSource(_) => "unknown_source",
            Self::InvalidSignature | Self::InvalidBase64(_) => "invalid_signature",
            Self::InvalidPublicKey(_) => "invalid_public_key",
            Self::MissingToken => "missing_token",
            Self::InvalidToken => "invalid_token",
        }
    }
}

/// Registry of producer public keys, indexed by source id.
#[derive(Debug, Clone, Default)]
pub struct ProducerKeys {
    keys: HashMap<String, VerifyingKey>,
}

impl ProducerKeys {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Decodes a map of source id to base64 public key.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::InvalidBase64`] or [`AuthError::InvalidPublicKey`]
    /// for the first key that fails to decode.
    pub fn from_base64_map(entries: &HashMap<String, String>) -> Result<Self, AuthError> {
        let mut registry = Self::new();
        for (source_id, encoded) in entries {
            registry.insert_base64(source_id, encoded)?;
        }
        Ok(registry)
    }

    /// Registers a base64-encoded public key.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::InvalidBase64`] or [`AuthError::InvalidPublicKey`].
    pub fn insert_base64(&mut self, source_id: &str, encoded: &str) -> Result<(), AuthError> {
        let bytes = BASE64_STANDARD
            .decode(encoded.trim())
            .map_err(|_| AuthError::invalid_base64(format!("public key of {source_id}")))?;
        let array: [u8; PUBLIC_KEY_LENGTH] = bytes
            .try_into()
            .map_err(|_| AuthError::InvalidPublicKey(source_id.to_string()))?;
        let key = VerifyingKey::from_bytes(&array)
            .map_err(|_| AuthError::InvalidPublicKey(source_id.to_string()))?;

        self.keys.insert(source_id.to_string(), key);
        Ok(())
    }

    /// Registers an already decoded key.
    pub fn insert(&mut self, source_id: impl Into<String>, key: VerifyingKey) {
        self.keys.insert(source_id.into(), key);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Verifies `signature_base64` over `message` for `source_id`.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::UnknownSource`], [`AuthError::InvalidBase64`] or
    /// [`AuthError::InvalidSignature`].
    pub fn verify(
        &self,
        source_id: &str,
        signature_base64: &str,
        message: &[u8],
    ) -> Result<(), AuthError> {
        let key = self
            .keys
            .get(source_id)
            .ok_or_else(|| AuthError::unknown_source(source_id))?;

        let bytes = BASE64_STANDARD
            .decode(signature_base64.trim())
            .map_err(|_| AuthError::invalid_base64("signature"))?;
        let array: [u8; SIGNATURE_LENGTH] =
            bytes.try_into().map_err(|_| AuthError::InvalidSignature)?;

        key.verify_strict(message, &Signature::from_bytes(&array))
            .map_err(|_| AuthError::InvalidSignature)
    }
}

/// Checks a presented consumer token against the configured one.
///
/// # Errors
///
/// Returns [`AuthError::MissingToken`] when `presented` is absent or empty and
/// [`AuthError::InvalidToken`] on mismatch.
pub fn validate_consumer_token(expected: &str, presented: Option<&str>) -> Result<(), AuthError> {
    let presented = match presented {
        Some(token) if !token.is_empty() => token,
        _ => return Err(AuthError::MissingToken),
    };

    if bool::from(presented.as_bytes().ct_eq(expected.as_bytes())) {
        Ok(())
    } else {
        Err(AuthError::InvalidToken)
    }
}

/// Extracts the token from an `Authorization: Bearer <token>` header value.
#[must_use]
pub fn bearer_token(header: &str) -> Option<&str> {
    let (scheme, token) = header.trim().split_once(' ')?;
    scheme
        .eq_ignore_ascii_case("bearer")
        .then(|| token.trim())
        .filter(|t| !t.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::{Signer, SigningKey, SECRET_KEY_LENGTH};

    fn keypair(seed: u8) -> (SigningKey, String) {
        let mut bytes = [0u8; SECRET_KEY_LENGTH];
        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = seed.wrapping_add(i as u8);
        }
        let signing_key = SigningKey::from_bytes(&bytes);
        let public = BASE64_STANDARD.encode(signing_key.verifying_key().to_bytes());
        (signing_key, public)
    }

    fn registry(source: &str, public: &str) -> ProducerKeys {
        let mut keys = ProducerKeys::new();
        keys.insert_base64(source, public).unwrap();
        keys
    }

    #[test]
    fn valid_signature_verifies() {
        let (signing_key, public) = keypair(1);
        let keys = registry("auth-service", &public);

        let body = br#"{"value":{"type":"LOGIN"}}"#;
        let signature = BASE64_STANDARD.encode(signing_key.sign(body).to_bytes());

        assert!(keys.verify("auth-service", &signature, body).is_ok());
    }

    #[test]
    fn tampered_body_fails() {
        let (signing_key, public) = keypair(1);
        let keys = registry("auth-service", &public);
        let signature = BASE64_STANDARD.encode(signing_key.sign(b"original").to_bytes());

        assert_eq!(
            keys.verify("auth-service", &signature, b"tampered"),
            Err(AuthError::InvalidSignature)
        );
    }

    #[test]
    fn signature_from_other_key_fails() {
        let (other_key, _) = keypair(100);
        let (_, public) = keypair(1);
        let keys = registry("auth-service", &public);
        let signature = BASE64_STANDARD.encode(other_key.sign(b"body").to_bytes());

        assert_eq!(
            keys.verify("auth-service", &signature, b"body"),
            Err(AuthError::InvalidSignature)
        );
    }

    #[test]
    fn unknown_source_is_reported() {
        let keys = ProducerKeys::new();
        let err = keys.verify("ghost", "AAAA", b"x").unwrap_err();
        assert_eq!(err, AuthError::UnknownSource("ghost".to_string()));
        assert_eq!(err.code(), "unknown_source");
    }

    #[test]
    fn malformed_signature_is_rejected() {
        let (_, public) = keypair(1);
        let keys = registry("auth-service", &public);

        assert!(matches!(
            keys.verify("auth-service", "not base64!!", b"x"),
            Err(AuthError::InvalidBase64(_))
        ));
        // Valid base64, wrong length.
        assert_eq!(
            keys.verify("auth-service", "c2hvcnQ=", b"x"),
            Err(AuthError::InvalidSignature)
        );
    }

    #[test]
    fn bad_public_keys_fail_registration() {
        let mut keys = ProducerKeys::new();
        assert!(matches!(
            keys.insert_base64("a", "%%%"),
            Err(AuthError::InvalidBase64(_))
        ));
        assert_eq!(
            keys.insert_base64("a", "c2hvcnQ="),
            Err(AuthError::InvalidPublicKey("a".to_string()))
        );
        assert!(keys.is_empty());
    }

    #[test]
    fn from_base64_map_loads_all_entries() {
        let (_, a) = keypair(1);
        let (_, b) = keypair(2);
        let map = HashMap::from([("a".to_string(), a), ("b".to_string(), b)]);

        let keys = ProducerKeys::from_base64_map(&map).unwrap();
        assert_eq!(keys.len(), 2);
    }

    #[test]
    fn consumer_token_checks() {
        assert!(validate_consumer_token("s3cret", Some("s3cret")).is_ok());
        assert_eq!(
            validate_consumer_token("s3cret", Some("s3cre")),
            Err(AuthError::InvalidToken)
        );
        assert_eq!(
            validate_consumer_token("s3cret", Some("")),
            Err(AuthError::MissingToken)
        );
        assert_eq!(
            validate_consumer_token("s3cret", None),
            Err(AuthError::MissingToken)
        );
    }

    #[test]
    fn bearer_token_parsing() {
        assert_eq!(bearer_token("Bearer abc"), Some("abc"));
        assert_eq!(bearer_token("bearer   abc  "), Some("abc"));
        assert_eq!(bearer_token("Basic abc"), None);
        assert_eq!(bearer_token("Bearer"), None);
        assert_eq!(bearer_token("Bearer "), None);
    }
}
