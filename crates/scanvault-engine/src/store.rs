use std::sync::Arc;

use chrono::Duration;
use scanvault_core::{
    audit::{AuditEntry, AuditEventKind, TimeWindow},
    clock::Clock,
    record::{RecordId, RecordSummary, SchemaTable, ScanRecord, StoredRow},
    storage::{RowCommit, StorageBackend},
    tenant::{Principal, TenantConfig, TenantId, TenantUpdate, TenantUsage, UsageDelta},
    VaultError, VaultResult,
};
use scanvault_kms::{registry::ProviderHealth, ProviderRegistry};
use serde::Serialize;
use tracing::{info, instrument};

use crate::{
    audit_log::{AuditLog, RetentionPolicy},
    encryption::{EncryptionEngine, RotatedKey},
    isolation::{AccessMode, TenantIsolationEnforcer},
    registry::TenantRegistry,
};

/// Outcome of re-encrypting a batch of records.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RotationReport {
    pub rotated: Vec<(RecordId, Vec<RotatedKey>)>,
    /// Legacy plaintext rows have no keys; they are left as they are.
    pub skipped_legacy: Vec<RecordId>,
    /// Ids not present in the tenant's partition.
    pub missing: Vec<RecordId>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub storage_backend: &'static str,
    pub storage_error: Option<String>,
    pub providers: Vec<ProviderHealth>,
}

impl HealthReport {
    pub fn is_healthy(&self) -> bool {
        self.storage_error.is_none() && self.providers.iter().all(|p| p.available)
    }
}

/// Tenant-isolated, encrypted store for scan results.
///
/// Writes validate access, seal sensitive fields, and commit the row together
/// with its usage increment and audit entry. Any failure rejects the whole
/// operation; there is no unencrypted fallback path.
pub struct ScanResultStore {
    backend: Arc<dyn StorageBackend>,
    clock: Arc<dyn Clock>,
    audit: AuditLog,
    registry: Arc<TenantRegistry>,
    enforcer: TenantIsolationEnforcer,
    engine: EncryptionEngine,
    schemas: SchemaTable,
}

impl ScanResultStore {
    pub fn new(
        backend: Arc<dyn StorageBackend>,
        providers: ProviderRegistry,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let audit = AuditLog::new(backend.clone(), clock.clone());
        let registry = Arc::new(TenantRegistry::new(
            backend.clone(),
            clock.clone(),
            audit.clone(),
        ));
        let enforcer =
            TenantIsolationEnforcer::new(registry.clone(), backend.clone(), audit.clone());
        let engine = EncryptionEngine::new(providers, audit.clone());
        Self {
            backend,
            clock,
            audit,
            registry,
            enforcer,
            engine,
            schemas: SchemaTable::default(),
        }
    }

    pub fn with_schemas(mut self, schemas: SchemaTable) -> Self {
        self.schemas = schemas;
        self
    }

    pub fn registry(&self) -> &TenantRegistry {
        &self.registry
    }

    pub fn enforcer(&self) -> &TenantIsolationEnforcer {
        &self.enforcer
    }

    pub fn engine(&self) -> &EncryptionEngine {
        &self.engine
    }

    pub fn audit_log(&self) -> &AuditLog {
        &self.audit
    }

    /// Store a record for `tenant_id` and return its id.
    #[instrument(skip_all, fields(tenant = %tenant_id, principal = %principal.id, kind = record.kind.as_str()))]
    pub async fn store(
        &self,
        tenant_id: &TenantId,
        principal: &Principal,
        record: ScanRecord,
    ) -> VaultResult<RecordId> {
        let config = self
            .enforcer
            .check_access(tenant_id, Some(record.kind.required_feature()), AccessMode::Write)
            .await?;
        let schema = self.schemas.latest(record.kind).ok_or_else(|| {
            VaultError::invalid(format!("no schema registered for {}", record.kind.as_str()))
        })?;
        let context = self.enforcer.scoped_context(tenant_id);

        let body = self.engine.encrypt(tenant_id, &record, schema).await?;
        let now = self.clock.now();
        let row = StoredRow {
            tenant_id: tenant_id.clone(),
            record_id: RecordId::new(),
            kind: record.kind,
            created_at: now,
            updated_at: now,
            body,
        };
        let record_id = row.record_id;
        let delta = UsageDelta::scan(row.stored_size())
            .with_compliance_score(record.compliance_score());
        let audit = self
            .audit
            .entry(AuditEventKind::RecordStored)
            .with_tenant(tenant_id)
            .with_meta("record_id", record_id.to_string())
            .with_meta("principal", &principal.id)
            .with_meta("kind", record.kind.as_str())
            .with_meta("key_ids", row.body.key_ids().join(","));

        context
            .commit(RowCommit {
                row,
                delta,
                limits: config.limits,
                audit,
                now,
            })
            .await?;
        info!(record = %record_id, "record stored");
        Ok(record_id)
    }

    /// Fetch and decrypt a record. An id belonging to another tenant is
    /// `NotFound` for this one.
    #[instrument(skip_all, fields(tenant = %tenant_id, record = %record_id))]
    pub async fn get(&self, tenant_id: &TenantId, record_id: &RecordId) -> VaultResult<ScanRecord> {
        self.enforcer
            .check_access(tenant_id, None, AccessMode::Read)
            .await?;
        let row = self
            .enforcer
            .scoped_context(tenant_id)
            .fetch(record_id)
            .await?
            .ok_or_else(|| VaultError::NotFound {
                tenant_id: tenant_id.to_string(),
                record_id: record_id.to_string(),
            })?;
        let record = self.engine.decrypt(&row).await?;
        self.audit
            .record(
                self.audit
                    .entry(AuditEventKind::RecordRead)
                    .with_tenant(tenant_id)
                    .with_meta("record_id", record_id.to_string()),
            )
            .await?;
        Ok(record)
    }

    /// Cross-tenant read for operators. Opens an audited admin context.
    #[instrument(skip_all, fields(principal = %principal.id, record = %record_id))]
    pub async fn admin_get(
        &self,
        principal: &Principal,
        reason: &str,
        record_id: &RecordId,
    ) -> VaultResult<(TenantId, ScanRecord)> {
        let context = self.enforcer.admin_context(principal, reason).await?;
        let row = context
            .fetch(record_id)
            .await?
            .ok_or_else(|| VaultError::NotFound {
                tenant_id: "*".to_string(),
                record_id: record_id.to_string(),
            })?;
        let record = self.engine.decrypt(&row).await?;
        self.audit
            .record(
                self.audit
                    .entry(AuditEventKind::RecordRead)
                    .with_tenant(&row.tenant_id)
                    .with_meta("record_id", record_id.to_string())
                    .with_meta("principal", &principal.id)
                    .with_meta("admin", "true"),
            )
            .await?;
        Ok((row.tenant_id, record))
    }

    /// Summaries of records created in the last `window_days`, newest first.
    /// Sensitive fields are not decrypted.
    #[instrument(skip_all, fields(tenant = %tenant_id, window_days = window_days, principal = principal.map(|p| p.id.as_str())))]
    pub async fn list_recent(
        &self,
        tenant_id: &TenantId,
        window_days: u32,
        principal: Option<&Principal>,
    ) -> VaultResult<Vec<RecordSummary>> {
        self.enforcer
            .check_access(tenant_id, None, AccessMode::Read)
            .await?;
        let since = self.clock.now() - Duration::days(i64::from(window_days));
        let rows = self.enforcer.scoped_context(tenant_id).recent(since).await?;
        Ok(rows.iter().map(StoredRow::summary).collect())
    }

    /// Audit entries in the window, optionally for one tenant.
    pub async fn audit(
        &self,
        tenant_id: Option<&TenantId>,
        window: TimeWindow,
    ) -> VaultResult<Vec<AuditEntry>> {
        self.audit.query(tenant_id, window).await
    }

    /// Re-encrypt the named records with fresh keys. Each record is superseded
    /// atomically with its `KeyRotated` entries; records not reached keep
    /// their original, still valid, packages.
    #[instrument(skip_all, fields(tenant = %tenant_id, principal = %principal.id, count = ids.len()))]
    pub async fn rotate_records(
        &self,
        tenant_id: &TenantId,
        principal: &Principal,
        ids: &[RecordId],
    ) -> VaultResult<RotationReport> {
        self.enforcer
            .check_access(tenant_id, None, AccessMode::Read)
            .await?;
        let context = self.enforcer.scoped_context(tenant_id);
        let mut report = RotationReport::default();

        for record_id in ids {
            let Some(row) = context.fetch(record_id).await? else {
                report.missing.push(*record_id);
                continue;
            };
            if row.body.is_legacy() {
                report.skipped_legacy.push(*record_id);
                continue;
            }
            let schema = self.schemas.latest(row.kind).ok_or_else(|| {
                VaultError::invalid(format!("no schema registered for {}", row.kind.as_str()))
            })?;
            let (body, rotated) = self.engine.rotate(&row, schema).await?;
            let entries = self.engine.rotation_entries(&row, &rotated, &principal.id);
            let superseding = StoredRow {
                body,
                updated_at: self.clock.now(),
                ..row
            };
            context.supersede(superseding, entries).await?;
            report.rotated.push((*record_id, rotated));
        }
        info!(
            rotated = report.rotated.len(),
            skipped = report.skipped_legacy.len(),
            missing = report.missing.len(),
            "rotation finished"
        );
        Ok(report)
    }

    pub async fn create_tenant(&self, config: TenantConfig) -> VaultResult<TenantConfig> {
        self.registry.create_tenant(config).await
    }

    pub async fn update_tenant(
        &self,
        tenant_id: &TenantId,
        update: TenantUpdate,
    ) -> VaultResult<TenantConfig> {
        self.registry.update_tenant(tenant_id, update).await
    }

    pub async fn get_usage(&self, tenant_id: &TenantId) -> VaultResult<TenantUsage> {
        self.registry.get_usage(tenant_id).await
    }

    pub async fn update_usage(
        &self,
        tenant_id: &TenantId,
        delta: UsageDelta,
    ) -> VaultResult<TenantUsage> {
        self.registry.update_usage(tenant_id, delta).await
    }

    /// Apply audit retention as of now.
    pub async fn prune_audit(&self, policy: &RetentionPolicy) -> VaultResult<usize> {
        policy.prune(&self.audit, self.clock.now()).await
    }

    pub async fn health(&self) -> HealthReport {
        let storage_error = self
            .backend
            .health_check()
            .await
            .err()
            .map(|err| err.to_string());
        HealthReport {
            storage_backend: self.backend.name(),
            storage_error,
            providers: self.engine.providers().health().await,
        }
    }
}
