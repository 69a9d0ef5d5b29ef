use std::collections::{BTreeMap, BTreeSet};

use aes_gcm::{
    aead::{Aead, KeyInit, Payload},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use rand::{rngs::OsRng, RngCore};
use scanvault_core::{
    audit::{AuditEntry, AuditEventKind},
    package::{
        DataPackage, EncryptedPackage, EncryptionManifest, KeyMetadata, KeyPurpose, SealedRecord,
        AES_256_GCM, PACKAGE_VERSION,
    },
    record::{is_empty_value, FieldMap, RecordKind, SchemaEntry, ScanRecord, StoredRow},
    tenant::TenantId,
    VaultError, VaultResult,
};
use scanvault_kms::{KeyManagementProvider, ProviderRegistry};
use serde_json::Value;
use tracing::{debug, instrument, warn};
use uuid::Uuid;
use zeroize::Zeroizing;

use crate::audit_log::AuditLog;

const DEK_LEN: usize = 32;
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

/// Old and new key ids for one field re-encrypted during rotation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RotatedKey {
    pub field: String,
    pub old_key_id: String,
    pub new_key_id: String,
}

/// Envelope encryption of sensitive record fields.
///
/// Every non-empty sensitive field gets its own fresh DEK and nonce. The DEK
/// is wrapped by the active key provider, bound to the key id, tenant, and
/// field name, and exists unwrapped only for the duration of the call.
#[derive(Clone)]
pub struct EncryptionEngine {
    providers: ProviderRegistry,
    audit: AuditLog,
}

impl EncryptionEngine {
    pub fn new(providers: ProviderRegistry, audit: AuditLog) -> Self {
        Self { providers, audit }
    }

    pub fn providers(&self) -> &ProviderRegistry {
        &self.providers
    }

    /// Seal a record with the sensitive fields of `schema`.
    pub async fn encrypt(
        &self,
        tenant_id: &TenantId,
        record: &ScanRecord,
        schema: &SchemaEntry,
    ) -> VaultResult<SealedRecord> {
        self.encrypt_fields(tenant_id, &record.fields, &schema.sensitive_fields, schema.version)
            .await
    }

    /// Seal `fields`, encrypting every non-empty field named in `sensitive`.
    /// Empty sensitive values stay in the clear and are not listed in the
    /// manifest.
    #[instrument(skip_all, fields(tenant = %tenant_id, schema_version = schema_version))]
    pub async fn encrypt_fields(
        &self,
        tenant_id: &TenantId,
        fields: &FieldMap,
        sensitive: &BTreeSet<String>,
        schema_version: u32,
    ) -> VaultResult<SealedRecord> {
        let provider = self.providers.active();
        let mut clear = FieldMap::new();
        let mut encrypted = BTreeMap::new();
        let mut keys = Vec::new();

        for (name, value) in fields {
            if !sensitive.contains(name) || is_empty_value(value) {
                clear.insert(name.clone(), value.clone());
                continue;
            }
            let (package, metadata) = self
                .seal_field(provider.as_ref(), tenant_id, name, value)
                .await?;
            encrypted.insert(name.clone(), package);
            keys.push(metadata);
        }

        let manifest = EncryptionManifest {
            algorithm: AES_256_GCM.to_string(),
            version: PACKAGE_VERSION,
            schema_version,
            encrypted_fields: encrypted.keys().cloned().collect(),
        };
        Ok(SealedRecord {
            fields: clear,
            encrypted,
            manifest: Some(manifest),
            keys,
        })
    }

    async fn seal_field(
        &self,
        provider: &dyn KeyManagementProvider,
        tenant_id: &TenantId,
        field: &str,
        value: &Value,
    ) -> VaultResult<(EncryptedPackage, KeyMetadata)> {
        let key_id = format!("dek_{}", Uuid::new_v4().simple());
        let created_at = self.audit.now();

        let mut dek = Zeroizing::new([0u8; DEK_LEN]);
        OsRng.fill_bytes(&mut *dek);
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);
        self.audit
            .record(
                self.audit
                    .entry(AuditEventKind::KeyGenerated)
                    .with_key(&key_id)
                    .with_tenant(tenant_id)
                    .with_meta("field", field),
            )
            .await?;

        let plaintext = Zeroizing::new(
            serde_json::to_vec(value).map_err(|e| VaultError::invalid(format!("field {field}: {e}")))?,
        );
        let cipher = Aes256Gcm::new_from_slice(dek.as_slice())
            .map_err(|e| VaultError::configuration(format!("cipher init failed: {e}")))?;
        let mut sealed = cipher
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: plaintext.as_slice(),
                    aad: key_id.as_bytes(),
                },
            )
            .map_err(|e| VaultError::configuration(format!("encrypt failed: {e}")))?;
        let tag = sealed.split_off(sealed.len() - TAG_LEN);

        let wrapped = provider
            .encrypt_dek(dek.as_slice(), &key_id, &dek_binding(tenant_id, field))
            .await?;
        drop(dek);
        self.audit
            .record(
                self.audit
                    .entry(AuditEventKind::KeyWrapped)
                    .with_key(&key_id)
                    .with_tenant(tenant_id)
                    .with_meta("provider", provider.name()),
            )
            .await?;

        let package = EncryptedPackage {
            data_package: DataPackage {
                ciphertext: BASE64.encode(&sealed),
                key_id: key_id.clone(),
                version: PACKAGE_VERSION,
                algorithm: AES_256_GCM.to_string(),
                nonce: BASE64.encode(nonce),
                tag: BASE64.encode(&tag),
                timestamp: created_at,
            },
            encrypted_dek: BASE64.encode(&wrapped),
            kms_provider: provider.name().to_string(),
        };
        let metadata = KeyMetadata {
            key_id,
            created_at,
            algorithm: AES_256_GCM.to_string(),
            purpose: KeyPurpose::FieldEncryption,
            field: field.to_string(),
            external_key_ref: provider.key_ref(),
        };
        Ok((package, metadata))
    }

    /// Decrypt a stored row. Rows without a manifest are legacy plaintext and
    /// come back unchanged. Any failure fails the whole record.
    #[instrument(skip_all, fields(tenant = %row.tenant_id, record = %row.record_id))]
    pub async fn decrypt(&self, row: &StoredRow) -> VaultResult<ScanRecord> {
        match self.decrypt_body(&row.tenant_id, row.kind, &row.body).await {
            Ok(record) => Ok(record),
            Err(err) => {
                let err = err.for_record(row.record_id);
                if matches!(err, VaultError::Integrity { .. }) {
                    warn!(error = %err, "record failed integrity check");
                    let entry = self
                        .audit
                        .entry(AuditEventKind::IntegrityFailure)
                        .with_tenant(&row.tenant_id)
                        .with_meta("record_id", row.record_id.to_string())
                        .failed(err.to_string());
                    if let Err(audit_err) = self.audit.record(entry).await {
                        warn!(error = %audit_err, "could not audit integrity failure");
                    }
                }
                Err(err)
            }
        }
    }

    async fn decrypt_body(
        &self,
        tenant_id: &TenantId,
        kind: RecordKind,
        body: &SealedRecord,
    ) -> VaultResult<ScanRecord> {
        let Some(manifest) = &body.manifest else {
            if !body.encrypted.is_empty() || !body.keys.is_empty() {
                return Err(VaultError::integrity("sealed packages without a manifest"));
            }
            debug!("legacy plaintext record passed through");
            return Ok(ScanRecord {
                kind,
                fields: body.fields.clone(),
            });
        };
        if manifest.algorithm != AES_256_GCM || manifest.version != PACKAGE_VERSION {
            return Err(VaultError::integrity(format!(
                "unsupported manifest {} v{}",
                manifest.algorithm, manifest.version
            )));
        }
        let listed: BTreeSet<&String> = manifest.encrypted_fields.iter().collect();
        let packaged: BTreeSet<&String> = body.encrypted.keys().collect();
        if listed != packaged {
            return Err(VaultError::integrity(
                "manifest does not match encrypted packages",
            ));
        }

        let mut fields = body.fields.clone();
        for name in &manifest.encrypted_fields {
            if fields.contains_key(name) {
                return Err(VaultError::integrity(format!(
                    "field {name} stored both encrypted and in the clear"
                )));
            }
            let package = body
                .encrypted
                .get(name)
                .ok_or_else(|| VaultError::integrity(format!("missing package for {name}")))?;
            let value = self.open_field(tenant_id, name, package).await?;
            fields.insert(name.clone(), value);
        }
        Ok(ScanRecord { kind, fields })
    }

    async fn open_field(
        &self,
        tenant_id: &TenantId,
        field: &str,
        package: &EncryptedPackage,
    ) -> VaultResult<Value> {
        let data = &package.data_package;
        if data.algorithm != AES_256_GCM || data.version != PACKAGE_VERSION {
            return Err(VaultError::integrity(format!(
                "unsupported package {} v{}",
                data.algorithm, data.version
            )));
        }
        let nonce = decode_exact(&data.nonce, NONCE_LEN, "nonce")?;
        let tag = decode_exact(&data.tag, TAG_LEN, "tag")?;
        let mut sealed = decode(&data.ciphertext, "ciphertext")?;
        let wrapped = decode(&package.encrypted_dek, "encrypted_dek")?;

        let provider = self.providers.get(&package.kms_provider)?;
        let dek = provider
            .decrypt_dek(&wrapped, &data.key_id, &dek_binding(tenant_id, field))
            .await?;
        self.audit
            .record(
                self.audit
                    .entry(AuditEventKind::KeyUnwrapped)
                    .with_key(&data.key_id)
                    .with_tenant(tenant_id),
            )
            .await?;

        let cipher = Aes256Gcm::new_from_slice(dek.as_slice())
            .map_err(|_| VaultError::integrity("unwrapped key has wrong length"))?;
        sealed.extend_from_slice(&tag);
        let plaintext = cipher
            .decrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: &sealed,
                    aad: data.key_id.as_bytes(),
                },
            )
            .map(Zeroizing::new)
            .map_err(|_| VaultError::integrity(format!("authentication tag mismatch on {field}")))?;
        serde_json::from_slice(&plaintext)
            .map_err(|e| VaultError::integrity(format!("field {field} is not valid JSON: {e}")))
    }

    /// Re-encrypt a sealed row with fresh DEKs. The result is a new body; the
    /// old packages are left untouched for the caller to supersede. Fields
    /// encrypted before stay encrypted even if `schema` no longer lists them.
    #[instrument(skip_all, fields(tenant = %row.tenant_id, record = %row.record_id))]
    pub async fn rotate(
        &self,
        row: &StoredRow,
        schema: &SchemaEntry,
    ) -> VaultResult<(SealedRecord, Vec<RotatedKey>)> {
        let manifest = row
            .body
            .manifest
            .as_ref()
            .ok_or_else(|| VaultError::invalid("legacy plaintext records have no keys to rotate"))?;
        let plain = self.decrypt(row).await?;

        let mut sensitive = schema.sensitive_fields.clone();
        sensitive.extend(manifest.encrypted_fields.iter().cloned());
        let sealed = self
            .encrypt_fields(&row.tenant_id, &plain.fields, &sensitive, schema.version)
            .await?;

        let rotated = row
            .body
            .encrypted
            .iter()
            .filter_map(|(field, old)| {
                sealed.encrypted.get(field).map(|new| RotatedKey {
                    field: field.clone(),
                    old_key_id: old.key_id().to_string(),
                    new_key_id: new.key_id().to_string(),
                })
            })
            .collect();
        Ok((sealed, rotated))
    }

    /// Audit entries describing a rotation, to be committed with the row.
    pub fn rotation_entries(
        &self,
        row: &StoredRow,
        rotated: &[RotatedKey],
        principal_id: &str,
    ) -> Vec<AuditEntry> {
        rotated
            .iter()
            .map(|key| {
                self.audit
                    .entry(AuditEventKind::KeyRotated)
                    .with_key(&key.new_key_id)
                    .with_tenant(&row.tenant_id)
                    .with_meta("old_key_id", &key.old_key_id)
                    .with_meta("field", &key.field)
                    .with_meta("record_id", row.record_id.to_string())
                    .with_meta("principal", principal_id)
            })
            .collect()
    }
}

/// Wrap context binding a DEK to its tenant and field.
fn dek_binding(tenant_id: &TenantId, field: &str) -> Vec<u8> {
    format!("{}|{}", tenant_id.as_str(), field).into_bytes()
}

fn decode(value: &str, what: &str) -> VaultResult<Vec<u8>> {
    BASE64
        .decode(value)
        .map_err(|e| VaultError::integrity(format!("{what} is not valid base64: {e}")))
}

fn decode_exact(value: &str, len: usize, what: &str) -> VaultResult<Vec<u8>> {
    let bytes = decode(value, what)?;
    if bytes.len() != len {
        return Err(VaultError::integrity(format!(
            "{what} must be {len} bytes, got {}",
            bytes.len()
        )));
    }
    Ok(bytes)
}
