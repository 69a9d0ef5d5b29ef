use async_trait::async_trait;
use hkdf::Hkdf;
use sha2::Sha256;
use zeroize::Zeroizing;

use crate::{
    provider::{binding, open, random_key, seal, KeyManagementProvider, KmsError, KEY_LEN},
    secret::MasterSecret,
};

const KEK_INFO: &[u8] = b"scanvault/kek/v1";

/// Local provider: the KEK is derived with HKDF-SHA256 from the master secret
/// and a deployment-specific salt, and lives only in memory.
pub struct LocalKeyProvider {
    kek: Zeroizing<[u8; KEY_LEN]>,
}

impl LocalKeyProvider {
    pub fn from_master_secret(secret: &MasterSecret, salt: &str) -> Result<Self, KmsError> {
        if salt.trim().is_empty() {
            return Err(KmsError::Configuration(
                "local key provider requires a deployment salt".to_string(),
            ));
        }
        let hk = Hkdf::<Sha256>::new(Some(salt.as_bytes()), secret.expose());
        let mut kek = Zeroizing::new([0u8; KEY_LEN]);
        hk.expand(KEK_INFO, &mut *kek)
            .map_err(|e| KmsError::Configuration(format!("kek derivation failed: {e}")))?;
        Ok(Self { kek })
    }

    /// Provider with a random KEK that disappears with the process. Keys it
    /// wraps cannot be recovered after restart.
    pub fn ephemeral() -> Self {
        Self { kek: random_key() }
    }
}

#[async_trait]
impl KeyManagementProvider for LocalKeyProvider {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn encrypt_dek(
        &self,
        plaintext_key: &[u8],
        key_id: &str,
        aad: &[u8],
    ) -> Result<Vec<u8>, KmsError> {
        seal(&self.kek, plaintext_key, &binding(key_id, aad))
    }

    async fn decrypt_dek(
        &self,
        ciphertext: &[u8],
        key_id: &str,
        aad: &[u8],
    ) -> Result<Zeroizing<Vec<u8>>, KmsError> {
        open(&self.kek, ciphertext, &binding(key_id, aad))
    }

    async fn is_available(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secret() -> MasterSecret {
        MasterSecret::from_bytes(vec![42u8; 32]).expect("secret")
    }

    #[tokio::test]
    async fn same_secret_and_salt_derive_same_kek() {
        let first = LocalKeyProvider::from_master_secret(&secret(), "deploy-a").unwrap();
        let second = LocalKeyProvider::from_master_secret(&secret(), "deploy-a").unwrap();

        let wrapped = first.encrypt_dek(&[9u8; 32], "dek_1", b"acme").await.unwrap();
        let unwrapped = second.decrypt_dek(&wrapped, "dek_1", b"acme").await.unwrap();
        assert_eq!(unwrapped.as_slice(), &[9u8; 32]);
    }

    #[tokio::test]
    async fn different_salt_cannot_unwrap() {
        let first = LocalKeyProvider::from_master_secret(&secret(), "deploy-a").unwrap();
        let other = LocalKeyProvider::from_master_secret(&secret(), "deploy-b").unwrap();

        let wrapped = first.encrypt_dek(&[9u8; 32], "dek_1", b"acme").await.unwrap();
        let err = other
            .decrypt_dek(&wrapped, "dek_1", b"acme")
            .await
            .expect_err("wrong kek");
        assert!(matches!(err, KmsError::Integrity(_)));
    }

    #[tokio::test]
    async fn key_id_and_aad_are_bound() {
        let provider = LocalKeyProvider::ephemeral();
        let wrapped = provider.encrypt_dek(&[1u8; 32], "dek_1", b"acme").await.unwrap();

        assert!(provider.decrypt_dek(&wrapped, "dek_2", b"acme").await.is_err());
        assert!(provider.decrypt_dek(&wrapped, "dek_1", b"globex").await.is_err());
    }

    #[test]
    fn empty_salt_is_rejected() {
        let err = LocalKeyProvider::from_master_secret(&secret(), " ")
            .err()
            .expect("empty salt");
        assert!(matches!(err, KmsError::Configuration(_)));
    }
}
