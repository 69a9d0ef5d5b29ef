use std::{collections::BTreeMap, sync::Arc};

use serde::{Deserialize, Serialize};
use tracing::{info, instrument};

use crate::{
    cloud::{CloudKeyProvider, HttpKeyServiceClient},
    local::LocalKeyProvider,
    provider::{KeyManagementProvider, KmsError},
    secret::MasterSecretSource,
};

pub const DEFAULT_TOKEN_ENV: &str = "SCANVAULT_KMS_TOKEN";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KmsConfig {
    #[serde(default)]
    pub local: Option<LocalKmsConfig>,
    #[serde(default)]
    pub cloud: Option<CloudKmsConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalKmsConfig {
    #[serde(default)]
    pub secret: MasterSecretSource,
    pub salt: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloudKmsConfig {
    pub endpoint: String,
    pub key_ref: String,
    /// Environment variable holding the bearer token.
    #[serde(default = "default_token_env")]
    pub token_env: String,
}

fn default_token_env() -> String {
    DEFAULT_TOKEN_ENV.to_string()
}

/// Health of one registered provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProviderHealth {
    pub name: String,
    pub active: bool,
    pub available: bool,
}

/// Every configured provider, built once at startup. New keys are always
/// wrapped by the active provider; unwrapping looks the provider up by the
/// name stored in the package.
#[derive(Clone)]
pub struct ProviderRegistry {
    active: Arc<dyn KeyManagementProvider>,
    providers: BTreeMap<&'static str, Arc<dyn KeyManagementProvider>>,
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("active", &self.active.name())
            .field("providers", &self.providers.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl ProviderRegistry {
    /// Cloud is preferred when both are present. Neither is a configuration
    /// error.
    pub fn new(
        local: Option<Arc<dyn KeyManagementProvider>>,
        cloud: Option<Arc<dyn KeyManagementProvider>>,
    ) -> Result<Self, KmsError> {
        let active = cloud.clone().or_else(|| local.clone()).ok_or_else(|| {
            KmsError::Configuration(
                "no key management provider configured; refusing to store data unencrypted"
                    .to_string(),
            )
        })?;
        let providers = local
            .into_iter()
            .chain(cloud)
            .map(|p| (p.name(), p))
            .collect();
        info!(provider = active.name(), "key management provider selected");
        Ok(Self { active, providers })
    }

    pub fn single(provider: Arc<dyn KeyManagementProvider>) -> Self {
        let mut providers = BTreeMap::new();
        providers.insert(provider.name(), provider.clone());
        Self {
            active: provider,
            providers,
        }
    }

    #[instrument(skip_all)]
    pub async fn from_config(config: &KmsConfig) -> Result<Self, KmsError> {
        let local = match &config.local {
            Some(cfg) => {
                let secret = cfg.secret.load()?;
                let provider = LocalKeyProvider::from_master_secret(&secret, &cfg.salt)?;
                Some(Arc::new(provider) as Arc<dyn KeyManagementProvider>)
            }
            None => None,
        };
        let cloud = match &config.cloud {
            Some(cfg) => {
                let token = std::env::var(&cfg.token_env).map_err(|_| {
                    KmsError::Configuration(format!(
                        "key service token variable {} is not set",
                        cfg.token_env
                    ))
                })?;
                let client = HttpKeyServiceClient::new(cfg.endpoint.clone(), token)?;
                let provider = CloudKeyProvider::connect(Box::new(client), cfg.key_ref.clone()).await?;
                Some(Arc::new(provider) as Arc<dyn KeyManagementProvider>)
            }
            None => None,
        };
        Self::new(local, cloud)
    }

    pub fn active(&self) -> Arc<dyn KeyManagementProvider> {
        self.active.clone()
    }

    /// Provider by the name recorded in a package.
    pub fn get(&self, name: &str) -> Result<Arc<dyn KeyManagementProvider>, KmsError> {
        self.providers.get(name).cloned().ok_or_else(|| {
            KmsError::Configuration(format!("key provider {name} is not configured"))
        })
    }

    pub async fn health(&self) -> Vec<ProviderHealth> {
        let mut out = Vec::with_capacity(self.providers.len());
        for (name, provider) in &self.providers {
            out.push(ProviderHealth {
                name: name.to_string(),
                active: *name == self.active.name(),
                available: provider.is_available().await,
            });
        }
        out
    }
}
