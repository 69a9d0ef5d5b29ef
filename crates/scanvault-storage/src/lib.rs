//! Concrete datastore backends.
//! `RedbBackend` is the durable store; `FileBackend` is an explicit,
//! development-only alternative. The backend is chosen once from
//! configuration and never switched at runtime.

pub mod file_backend;
pub mod redb_backend;

use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use scanvault_core::{
    storage::{BackendKind, StorageBackend},
    VaultError, VaultResult,
};
use serde::{Deserialize, Serialize};
use tracing::info;

pub use file_backend::FileBackend;
pub use redb_backend::RedbBackend;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: BackendKind,
    /// Refuse to start with development storage.
    #[serde(default = "default_strict")]
    pub strict: bool,
    /// Overrides the default file under the data directory.
    #[serde(default)]
    pub path: Option<PathBuf>,
}

fn default_strict() -> bool {
    true
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Durable,
            strict: true,
            path: None,
        }
    }
}

impl StorageConfig {
    pub fn validate(&self) -> VaultResult<()> {
        if self.backend == BackendKind::EphemeralDev && self.strict {
            return Err(VaultError::configuration(
                "ephemeral_dev storage requires strict = false",
            ));
        }
        Ok(())
    }

    pub fn resolve_path(&self, data_dir: &Path) -> PathBuf {
        match (&self.path, self.backend) {
            (Some(path), _) => path.clone(),
            (None, BackendKind::Durable) => data_dir.join("scanvault.redb"),
            (None, BackendKind::EphemeralDev) => data_dir.join("scanvault-dev.json"),
        }
    }
}

/// Open the configured backend.
pub fn open_backend(config: &StorageConfig, data_dir: &Path) -> VaultResult<Arc<dyn StorageBackend>> {
    config.validate()?;
    let path = config.resolve_path(data_dir);
    let backend: Arc<dyn StorageBackend> = match config.backend {
        BackendKind::Durable => Arc::new(RedbBackend::open(&path)?),
        BackendKind::EphemeralDev => Arc::new(FileBackend::open(&path)?),
    };
    info!(backend = backend.name(), path = %path.display(), "storage backend opened");
    Ok(backend)
}
