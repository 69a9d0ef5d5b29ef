use std::fmt;

use base64::{engine::general_purpose, Engine as _};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use zeroize::Zeroizing;

use crate::provider::{random_key, KmsError};

/// Shortest master secret accepted, in bytes.
pub const MIN_SECRET_LEN: usize = 32;
pub const DEFAULT_SECRET_ENV: &str = "SCANVAULT_MASTER_SECRET";

/// Operator-supplied master secret. Never printed.
#[derive(Clone)]
pub struct MasterSecret(Zeroizing<Vec<u8>>);

impl MasterSecret {
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Result<Self, KmsError> {
        let bytes = Zeroizing::new(bytes.into());
        if bytes.len() < MIN_SECRET_LEN {
            return Err(KmsError::Configuration(format!(
                "master secret must be at least {MIN_SECRET_LEN} bytes, got {}",
                bytes.len()
            )));
        }
        Ok(Self(bytes))
    }

    pub fn from_base64(encoded: &str) -> Result<Self, KmsError> {
        let bytes = general_purpose::STANDARD
            .decode(encoded.trim())
            .map_err(|e| KmsError::Configuration(format!("master secret is not base64: {e}")))?;
        Self::from_bytes(bytes)
    }

    pub(crate) fn expose(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for MasterSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("MasterSecret(<redacted>)")
    }
}

/// Where the local provider's master secret comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum MasterSecretSource {
    /// Base64 secret in an environment variable.
    Env {
        #[serde(default = "default_secret_env")]
        var: String,
    },
    /// Base64 secret in the OS keyring.
    Keyring { service: String, account: String },
}

impl Default for MasterSecretSource {
    fn default() -> Self {
        MasterSecretSource::Env {
            var: default_secret_env(),
        }
    }
}

fn default_secret_env() -> String {
    DEFAULT_SECRET_ENV.to_string()
}

impl MasterSecretSource {
    /// Load the secret. A missing secret is a configuration error, never a
    /// reason to continue without encryption.
    pub fn load(&self) -> Result<MasterSecret, KmsError> {
        match self {
            MasterSecretSource::Env { var } => {
                let value = std::env::var(var).map_err(|_| {
                    KmsError::Configuration(format!("master secret variable {var} is not set"))
                })?;
                let value = Zeroizing::new(value);
                debug!(%var, "master secret loaded from env");
                MasterSecret::from_base64(&value)
            }
            MasterSecretSource::Keyring { service, account } => {
                // Keyring operations are synchronous.
                let entry = keyring::Entry::new(service, account)
                    .map_err(|e| KmsError::Configuration(format!("keyring: {e}")))?;
                let value = entry.get_password().map_err(|e| match e {
                    keyring::Error::NoEntry => KmsError::Configuration(format!(
                        "no master secret in keyring for {service}/{account}"
                    )),
                    other => KmsError::Configuration(format!("keyring: {other}")),
                })?;
                let value = Zeroizing::new(value);
                debug!(%service, %account, "master secret loaded from keyring");
                MasterSecret::from_base64(&value)
            }
        }
    }
}

/// Store a fresh random master secret in the keyring unless one exists.
/// Returns `true` when a new secret was created.
pub fn provision_keyring(service: &str, account: &str) -> Result<bool, KmsError> {
    let entry = keyring::Entry::new(service, account)
        .map_err(|e| KmsError::Configuration(format!("keyring: {e}")))?;
    match entry.get_password() {
        Ok(existing) => {
            MasterSecret::from_base64(&Zeroizing::new(existing))?;
            Ok(false)
        }
        Err(keyring::Error::NoEntry) => {
            let secret = random_key();
            let encoded = Zeroizing::new(general_purpose::STANDARD.encode(secret.as_slice()));
            entry
                .set_password(&encoded)
                .map_err(|e| KmsError::Configuration(format!("keyring: {e}")))?;
            info!(%service, %account, "provisioned master secret in keyring");
            Ok(true)
        }
        Err(other) => Err(KmsError::Configuration(format!("keyring: {other}"))),
    }
}
