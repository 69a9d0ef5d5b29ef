use std::{
    fs,
    path::{Path, PathBuf},
};

use color_eyre::Result;
use dirs::config_dir;
use scanvault_kms::{registry::LocalKmsConfig, secret::MasterSecretSource, KmsConfig};
use scanvault_storage::StorageConfig;
use serde::{Deserialize, Serialize};

/// Operator configuration loaded from `~/.config/scanvault/config.toml` (platform-specific).
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct Config {
    /// Override for the data directory holding the store.
    pub data_dir: Option<PathBuf>,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub kms: KmsConfig,
    #[serde(default)]
    pub audit: AuditConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct AuditConfig {
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
}

fn default_retention_days() -> u32 {
    365
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            retention_days: default_retention_days(),
        }
    }
}

impl Config {
    /// Starting point written by `config init`: durable storage and a local
    /// key provider reading its master secret from the keyring entry that
    /// `keys init` provisions. The salt still has to be set per deployment.
    pub fn starter() -> Self {
        Self {
            kms: KmsConfig {
                local: Some(LocalKmsConfig {
                    secret: MasterSecretSource::Keyring {
                        service: "scanvault".into(),
                        account: "master-secret".into(),
                    },
                    salt: "change-me-per-deployment".into(),
                }),
                cloud: None,
            },
            ..Self::default()
        }
    }
}

/// Load config from `path` or, when absent, the default location.
pub fn load(path: Option<&Path>) -> Result<Config> {
    match path {
        Some(path) => load_from_path(path),
        None => load_from_path(default_path()?),
    }
}

/// Load config from a given path; if missing or empty, return defaults.
pub fn load_from_path(path: impl AsRef<Path>) -> Result<Config> {
    let path = path.as_ref();
    if !path.exists() {
        return Ok(Config::default());
    }
    let contents = fs::read_to_string(path)?;
    if contents.trim().is_empty() {
        return Ok(Config::default());
    }
    let cfg: Config = toml::from_str(&contents)?;
    Ok(cfg)
}

/// Resolve the default config path (platform aware).
pub fn default_path() -> Result<PathBuf> {
    let base = config_dir().ok_or_else(|| color_eyre::eyre::eyre!("no config dir available"))?;
    Ok(base.join("scanvault").join("config.toml"))
}

/// Write `config` to `path`, creating parent directories as needed. An
/// existing file is left untouched.
pub fn write_if_missing(config: &Config, path: &Path) -> Result<PathBuf> {
    if path.exists() {
        return Ok(path.to_path_buf());
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let body = toml::to_string_pretty(config)?;
    fs::write(path, body)?;
    Ok(path.to_path_buf())
}

#[cfg(test)]
mod tests {
    use scanvault_core::storage::BackendKind;
    use scanvault_kms::registry::CloudKmsConfig;

    use super::*;

    #[test]
    fn returns_default_when_missing() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cfg = load_from_path(dir.path().join("config.toml")).expect("load");
        assert_eq!(cfg, Config::default());
        assert!(cfg.storage.strict);
        assert_eq!(cfg.audit.retention_days, 365);
    }

    #[test]
    fn parses_custom_config() {
        let contents = r#"
            data_dir = "/var/lib/scanvault"
            [storage]
            backend = "ephemeral_dev"
            strict = false
            [kms.local]
            salt = "deployment-7"
            [kms.local.secret]
            source = "env"
            var = "SV_SECRET"
            [kms.cloud]
            endpoint = "https://kms.internal"
            key_ref = "keys/records"
            [audit]
            retention_days = 90
        "#;
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.toml");
        fs::write(&path, contents).expect("write temp config");

        let cfg = load_from_path(&path).expect("load");
        assert_eq!(
            cfg,
            Config {
                data_dir: Some(PathBuf::from("/var/lib/scanvault")),
                storage: StorageConfig {
                    backend: BackendKind::EphemeralDev,
                    strict: false,
                    path: None,
                },
                kms: KmsConfig {
                    local: Some(LocalKmsConfig {
                        secret: MasterSecretSource::Env {
                            var: "SV_SECRET".into(),
                        },
                        salt: "deployment-7".into(),
                    }),
                    cloud: Some(CloudKmsConfig {
                        endpoint: "https://kms.internal".into(),
                        key_ref: "keys/records".into(),
                        token_env: "SCANVAULT_KMS_TOKEN".into(),
                    }),
                },
                audit: AuditConfig { retention_days: 90 },
            }
        );
    }

    #[test]
    fn write_creates_file_once() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("config.toml");
        let cfg = Config::starter();

        write_if_missing(&cfg, &path).expect("write should succeed");
        let other = Config {
            data_dir: Some(PathBuf::from("/elsewhere")),
            ..Config::starter()
        };
        let second = write_if_missing(&other, &path).expect("second write ok");
        assert_eq!(second, path);
        let loaded = load_from_path(&path).expect("load");
        assert_eq!(loaded, cfg);
    }
}
