//! Ed25519 signing of publish requests.
//!
//! A producer's private key is a raw 32-byte seed, supplied base64-encoded
//! through `AUTHBUS_SIGNING_KEY`. The broker checks the resulting signatures
//! against the public keys in `AUTHBUS_PRODUCER_KEYS`.

use base64::prelude::*;
use ed25519_dalek::{Signer, SigningKey};
use rand::Rng;
use thiserror::Error;
use zeroize::Zeroize;

/// Environment variable holding the base64 signing seed.
pub const ENV_SIGNING_KEY: &str = "AUTHBUS_SIGNING_KEY";

/// Length of an Ed25519 seed.
const SEED_LENGTH: usize = 32;

/// Errors raised while loading a signing key.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SignerError {
    #[error("invalid signing key: {0}")]
    InvalidKey(String),

    #[error("base64 decode error: {0}")]
    Base64(String),
}

/// Signs request bodies on behalf of one producer.
pub struct ProducerSigner {
    signing_key: SigningKey,
}

impl ProducerSigner {
    /// Generates a fresh key.
    #[must_use]
    pub fn generate() -> Self {
        let mut seed = [0u8; SEED_LENGTH];
        rand::rng().fill(&mut seed);
        let signing_key = SigningKey::from_bytes(&seed);
        seed.zeroize();
        Self { signing_key }
    }

    /// Builds a signer from a base64-encoded seed.
    ///
    /// # Errors
    ///
    /// Returns [`SignerError`] if the value is not base64 or not 32 bytes.
    pub fn from_base64(encoded: &str) -> Result<Self, SignerError> {
        let mut decoded = BASE64_STANDARD
            .decode(encoded.trim())
            .map_err(|e| SignerError::Base64(e.to_string()))?;

        if decoded.len() != SEED_LENGTH {
            let len = decoded.len();
            decoded.zeroize();
            return Err(SignerError::InvalidKey(format!(
                "expected {SEED_LENGTH} bytes, got {len}"
            )));
        }

        let mut seed = [0u8; SEED_LENGTH];
        seed.copy_from_slice(&decoded);
        decoded.zeroize();
        let signing_key = SigningKey::from_bytes(&seed);
        seed.zeroize();

        Ok(Self { signing_key })
    }

    /// Loads the signer from [`ENV_SIGNING_KEY`]. Returns `Ok(None)` when the
    /// variable is unset or blank.
    ///
    /// # Errors
    ///
    /// Returns [`SignerError`] if the variable is set but malformed.
    pub fn from_env() -> Result<Option<Self>, SignerError> {
        match std::env::var(ENV_SIGNING_KEY) {
            Ok(value) if !value.trim().is_empty() => Self::from_base64(&value).map(Some),
            _ => Ok(None),
        }
    }

    /// Base64 signature of `message`.
    #[must_use]
    pub fn sign(&self, message: &[u8]) -> String {
        BASE64_STANDARD.encode(self.signing_key.sign(message).to_bytes())
    }

    /// Base64 public key, the form `AUTHBUS_PRODUCER_KEYS` expects.
    #[must_use]
    pub fn public_key_base64(&self) -> String {
        BASE64_STANDARD.encode(self.signing_key.verifying_key().to_bytes())
    }
}

impl std::fmt::Debug for ProducerSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProducerSigner")
            .field("public_key", &self.public_key_base64())
            .finish_non_exhaustive()
    }
}
