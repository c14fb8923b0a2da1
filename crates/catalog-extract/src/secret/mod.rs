//! Secret-aware deferred values.
//!
//! [`maybe_decrypt`] wraps a deferred string so that, when a key reference is
//! configured, the underlying value is treated as base64 ciphertext and
//! decrypted through a [`KeyManagementClient`] on first resolution. The mode
//! (plain or encrypted) is chosen once, when the value is constructed.

mod kms;

pub use kms::{CloudKmsClient, DEFAULT_KMS_ENDPOINT};

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use base64::prelude::BASE64_STANDARD;
use base64::Engine;
use secrecy::{ExposeSecret, SecretString};
use tracing::debug;

use crate::deferred::{DeferredValue, ValueSource};
use crate::error::{BoxError, ExtractError, Result};

/// Reference to a key-management key, e.g.
/// `projects/p/locations/global/keyRings/r/cryptoKeys/k`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyReference(String);

impl KeyReference {
    /// Returns `None` for an empty or blank reference, which selects plain mode.
    pub fn new(reference: impl AsRef<str>) -> Option<Self> {
        let reference = reference.as_ref().trim();
        if reference.is_empty() {
            None
        } else {
            Some(Self(reference.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for KeyReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// External key-management decrypt operation.
///
/// Implementations handle their own transport retries; callers of this crate
/// never retry a failed decrypt.
#[async_trait]
pub trait KeyManagementClient: Send + Sync + fmt::Debug {
    async fn decrypt(
        &self,
        key: &KeyReference,
        ciphertext: &[u8],
    ) -> std::result::Result<SecretString, BoxError>;
}

/// Resolution strategy that decrypts the output of an inner strategy.
pub struct EncryptedValue {
    ciphertext: Arc<dyn ValueSource<String>>,
    key: KeyReference,
    kms: Arc<dyn KeyManagementClient>,
}

impl EncryptedValue {
    pub fn new(
        ciphertext: &DeferredValue<String>,
        key: KeyReference,
        kms: Arc<dyn KeyManagementClient>,
    ) -> Self {
        Self {
            ciphertext: ciphertext.source(),
            key,
            kms,
        }
    }

    fn decryption_failed(&self, source: impl Into<BoxError>) -> ExtractError {
        ExtractError::DecryptionFailed {
            key: self.key.to_string(),
            source: source.into(),
        }
    }
}

impl fmt::Debug for EncryptedValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncryptedValue")
            .field("ciphertext", &self.ciphertext.describe())
            .field("key", &self.key)
            .finish()
    }
}

#[async_trait]
impl ValueSource<String> for EncryptedValue {
    async fn produce(&self) -> Result<String> {
        let encoded = self.ciphertext.produce().await?;
        let ciphertext = BASE64_STANDARD
            .decode(encoded.trim())
            .map_err(|e| self.decryption_failed(format!("ciphertext is not valid base64: {}", e)))?;

        debug!("Decrypting {} with key {}", self.ciphertext.describe(), self.key);
        let plaintext = self
            .kms
            .decrypt(&self.key, &ciphertext)
            .await
            .map_err(|e| self.decryption_failed(e))?;

        Ok(plaintext.expose_secret().to_string())
    }

    fn check_available(&self) -> Result<()> {
        self.ciphertext.check_available()
    }

    fn describe(&self) -> String {
        format!("decrypt({})", self.ciphertext.describe())
    }
}

/// Wrap `value` for transparent decryption when `key` is present.
///
/// With no key the value is returned unchanged and resolves as plaintext
/// without any key-management call.
pub fn maybe_decrypt(
    value: DeferredValue<String>,
    key: Option<&KeyReference>,
    kms: &Arc<dyn KeyManagementClient>,
) -> DeferredValue<String> {
    match key {
        Some(key) => {
            DeferredValue::from_source(EncryptedValue::new(&value, key.clone(), kms.clone()))
        }
        None => value,
    }
}
