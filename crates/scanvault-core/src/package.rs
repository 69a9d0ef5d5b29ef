//! Persisted envelope layout.
//!
//! ```text
//! EncryptedPackage {
//!   data_package: { ciphertext(b64), key_id, version, algorithm, nonce(b64), tag(b64), timestamp },
//!   encrypted_dek(b64), kms_provider
//! }
//! ```
//!
//! Packages are immutable once written; rotation supersedes them with new ones.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::record::FieldMap;

/// Current envelope format version.
pub const PACKAGE_VERSION: u32 = 1;
/// AEAD used for field ciphertext.
pub const AES_256_GCM: &str = "AES-256-GCM";

/// Ciphertext half of the envelope. All binary values are standard base64.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataPackage {
    pub ciphertext: String,
    pub key_id: String,
    pub version: u32,
    pub algorithm: String,
    pub nonce: String,
    pub tag: String,
    pub timestamp: DateTime<Utc>,
}

/// One encrypted field: ciphertext plus the DEK wrapped by a key provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedPackage {
    pub data_package: DataPackage,
    pub encrypted_dek: String,
    pub kms_provider: String,
}

impl EncryptedPackage {
    pub fn key_id(&self) -> &str {
        &self.data_package.key_id
    }
}

/// Clear-text description of what was encrypted, kept for indexing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptionManifest {
    pub algorithm: String,
    pub version: u32,
    /// Version of the sensitive-field schema used when sealing.
    pub schema_version: u32,
    pub encrypted_fields: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyPurpose {
    FieldEncryption,
}

/// Write-once description of a generated DEK.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyMetadata {
    pub key_id: String,
    pub created_at: DateTime<Utc>,
    pub algorithm: String,
    pub purpose: KeyPurpose,
    /// Field the key protects.
    pub field: String,
    /// KEK reference on the provider side (cloud key ref), if any.
    pub external_key_ref: Option<String>,
}

/// Record body as it is persisted.
///
/// `manifest == None` marks a legacy plaintext row; such rows carry no
/// packages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SealedRecord {
    /// Non-sensitive (and empty sensitive) fields, in the clear.
    pub fields: FieldMap,
    #[serde(default)]
    pub encrypted: BTreeMap<String, EncryptedPackage>,
    #[serde(default)]
    pub manifest: Option<EncryptionManifest>,
    #[serde(default)]
    pub keys: Vec<KeyMetadata>,
}

impl SealedRecord {
    /// Body for a row written before encryption was introduced.
    pub fn legacy(fields: FieldMap) -> Self {
        Self {
            fields,
            encrypted: BTreeMap::new(),
            manifest: None,
            keys: Vec::new(),
        }
    }

    /// A plaintext record written before field encryption existed. A body
    /// carrying packages or keys without a manifest is not legacy.
    pub fn is_legacy(&self) -> bool {
        self.manifest.is_none() && self.encrypted.is_empty() && self.keys.is_empty()
    }

    pub fn key_ids(&self) -> Vec<String> {
        self.encrypted
            .values()
            .map(|package| package.key_id().to_string())
            .collect()
    }
}
