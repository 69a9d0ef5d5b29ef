use aes_gcm::{
    aead::{Aead, KeyInit, Payload},
    Aes256Gcm, Nonce,
};
use async_trait::async_trait;
use rand::{rngs::OsRng, RngCore};
use scanvault_core::VaultError;
use thiserror::Error;
use zeroize::Zeroizing;

/// Size of a key-encryption key and of every DEK.
pub const KEY_LEN: usize = 32;
pub(crate) const NONCE_LEN: usize = 12;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum KmsError {
    /// Missing master secret, bad key-service settings, or a key policy that
    /// forbids wrapping. Fatal at startup.
    #[error("configuration error: {0}")]
    Configuration(String),
    /// Key service unreachable or failing; retryable.
    #[error("key service unavailable: {0}")]
    Unavailable(String),
    /// Wrapped key failed authentication.
    #[error("key unwrap failed: {0}")]
    Integrity(String),
    #[error("decode error: {0}")]
    Decode(String),
}

impl From<KmsError> for VaultError {
    fn from(err: KmsError) -> Self {
        match err {
            KmsError::Configuration(reason) => VaultError::Configuration { reason },
            KmsError::Unavailable(reason) => VaultError::ProviderUnavailable {
                provider: "kms".to_string(),
                reason,
            },
            KmsError::Integrity(reason) | KmsError::Decode(reason) => VaultError::integrity(reason),
        }
    }
}

/// Wraps and unwraps DEKs under a key-encryption key the caller never sees.
///
/// `key_id` and `aad` are bound to the wrapped key: unwrapping with any other
/// value fails with [`KmsError::Integrity`].
#[async_trait]
pub trait KeyManagementProvider: Send + Sync {
    /// Name recorded in every package this provider wraps.
    fn name(&self) -> &'static str;

    /// Provider-side KEK reference, if the provider has one.
    fn key_ref(&self) -> Option<String> {
        None
    }

    async fn encrypt_dek(
        &self,
        plaintext_key: &[u8],
        key_id: &str,
        aad: &[u8],
    ) -> Result<Vec<u8>, KmsError>;

    async fn decrypt_dek(
        &self,
        ciphertext: &[u8],
        key_id: &str,
        aad: &[u8],
    ) -> Result<Zeroizing<Vec<u8>>, KmsError>;

    async fn is_available(&self) -> bool;
}

/// Associated data for a wrap: the key id, a separator, then caller context.
pub(crate) fn binding(key_id: &str, aad: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(key_id.len() + 1 + aad.len());
    out.extend_from_slice(key_id.as_bytes());
    out.push(0);
    out.extend_from_slice(aad);
    out
}

/// AES-256-GCM wrap: `nonce || ciphertext || tag`.
pub(crate) fn seal(kek: &[u8; KEY_LEN], plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>, KmsError> {
    let cipher = Aes256Gcm::new_from_slice(kek)
        .map_err(|e| KmsError::Configuration(format!("cipher init failed: {e}")))?;
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);
    let ciphertext = cipher
        .encrypt(
            Nonce::from_slice(&nonce),
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|e| KmsError::Configuration(format!("wrap failed: {e}")))?;

    let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

pub(crate) fn open(
    kek: &[u8; KEY_LEN],
    wrapped: &[u8],
    aad: &[u8],
) -> Result<Zeroizing<Vec<u8>>, KmsError> {
    if wrapped.len() <= NONCE_LEN {
        return Err(KmsError::Decode(format!(
            "wrapped key too short: {} bytes",
            wrapped.len()
        )));
    }
    let (nonce, ciphertext) = wrapped.split_at(NONCE_LEN);
    let cipher = Aes256Gcm::new_from_slice(kek)
        .map_err(|e| KmsError::Configuration(format!("cipher init failed: {e}")))?;
    cipher
        .decrypt(
            Nonce::from_slice(nonce),
            Payload {
                msg: ciphertext,
                aad,
            },
        )
        .map(Zeroizing::new)
        .map_err(|_| KmsError::Integrity("authentication tag mismatch".to_string()))
}

pub(crate) fn random_key() -> Zeroizing<[u8; KEY_LEN]> {
    let mut bytes = Zeroizing::new([0u8; KEY_LEN]);
    OsRng.fill_bytes(&mut *bytes);
    bytes
}
