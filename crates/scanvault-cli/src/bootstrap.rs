use std::{path::PathBuf, sync::Arc};

use crate::config::Config;
use color_eyre::{eyre::eyre, Result};
use dirs::data_dir;
use scanvault_core::clock::SystemClock;
use scanvault_engine::ScanResultStore;
use scanvault_kms::ProviderRegistry;
use scanvault_storage::open_backend;
use tracing::{debug, info};

/// Resolve the default data directory for ScanVault.
pub fn default_data_dir() -> Result<PathBuf> {
    let base = data_dir().ok_or_else(|| eyre!("no data dir available"))?;
    Ok(base.join("scanvault"))
}

/// Data directory from config, falling back to the platform default.
pub fn resolve_data_dir(config: &Config) -> Result<PathBuf> {
    match &config.data_dir {
        Some(root) => Ok(root.clone()),
        None => default_data_dir(),
    }
}

/// Open the configured backend and key providers and wire the store.
///
/// Any configuration problem (strict mode with dev storage, a missing master
/// secret, an unreachable key service) stops startup here.
pub async fn open_store(config: &Config) -> Result<ScanResultStore> {
    let root = resolve_data_dir(config)?;
    std::fs::create_dir_all(&root)?;
    debug!(?root, "opening store");

    let backend = open_backend(&config.storage, &root).map_err(|e| eyre!(e.to_string()))?;
    let providers = ProviderRegistry::from_config(&config.kms)
        .await
        .map_err(|e| eyre!(e.to_string()))?;
    info!(
        backend = backend.name(),
        provider = providers.active().name(),
        "store ready"
    );
    Ok(ScanResultStore::new(backend, providers, Arc::new(SystemClock)))
}
