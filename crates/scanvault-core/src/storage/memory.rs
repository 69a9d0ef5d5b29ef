use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{BackendKind, RowCommit, StorageBackend};
use crate::{
    audit::{AuditEntry, TimeWindow},
    error::{DenyReason, VaultError, VaultResult},
    record::{RecordId, RowScope, StoredRow},
    tenant::{TenantConfig, TenantId, TenantUsage, UsageDelta},
};

/// Complete datastore state, partitioned by tenant.
///
/// Shared by the in-memory backend and the file-based dev backend, which
/// snapshots it to disk after every mutation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemoryState {
    tenants: BTreeMap<TenantId, TenantConfig>,
    usage: BTreeMap<TenantId, TenantUsage>,
    rows: BTreeMap<TenantId, BTreeMap<RecordId, StoredRow>>,
    audit: Vec<AuditEntry>,
    next_sequence: u64,
}

impl MemoryState {
    pub fn insert_tenant(&mut self, config: &TenantConfig, usage: &TenantUsage) -> VaultResult<()> {
        if self.tenants.contains_key(&config.tenant_id) {
            return Err(VaultError::AlreadyExists {
                entity: format!("tenant {}", config.tenant_id),
            });
        }
        self.tenants
            .insert(config.tenant_id.clone(), config.clone());
        self.usage.insert(config.tenant_id.clone(), usage.clone());
        Ok(())
    }

    pub fn update_tenant(&mut self, config: &TenantConfig) -> VaultResult<()> {
        let slot = self
            .tenants
            .get_mut(&config.tenant_id)
            .ok_or_else(|| unknown_tenant(&config.tenant_id))?;
        *slot = config.clone();
        Ok(())
    }

    pub fn tenant(&self, tenant_id: &TenantId) -> Option<TenantConfig> {
        self.tenants.get(tenant_id).cloned()
    }

    pub fn tenants(&self) -> Vec<TenantConfig> {
        self.tenants.values().cloned().collect()
    }

    pub fn usage(&self, tenant_id: &TenantId) -> Option<TenantUsage> {
        self.usage.get(tenant_id).cloned()
    }

    pub fn apply_usage(
        &mut self,
        tenant_id: &TenantId,
        delta: &UsageDelta,
        now: DateTime<Utc>,
    ) -> VaultResult<TenantUsage> {
        let usage = self
            .usage
            .get_mut(tenant_id)
            .ok_or_else(|| unknown_tenant(tenant_id))?;
        usage.apply(delta, now);
        Ok(usage.clone())
    }

    pub fn reset_period(
        &mut self,
        tenant_id: &TenantId,
        now: DateTime<Utc>,
    ) -> VaultResult<TenantUsage> {
        let usage = self
            .usage
            .get_mut(tenant_id)
            .ok_or_else(|| unknown_tenant(tenant_id))?;
        usage.reset_period(now);
        Ok(usage.clone())
    }

    pub fn commit_row(&mut self, commit: RowCommit) -> VaultResult<TenantUsage> {
        let RowCommit {
            row,
            delta,
            limits,
            audit,
            now,
        } = commit;
        let tenant_id = row.tenant_id.clone();

        let mut usage = self
            .usage
            .get(&tenant_id)
            .cloned()
            .ok_or_else(|| unknown_tenant(&tenant_id))?;
        usage.roll_over(now);
        limits
            .admits(&usage, &delta)
            .map_err(|limit| VaultError::AccessDenied {
                tenant_id: tenant_id.to_string(),
                reason: DenyReason::OverLimit(limit),
            })?;

        let partition = self.rows.entry(tenant_id.clone()).or_default();
        if partition.contains_key(&row.record_id) {
            return Err(VaultError::AlreadyExists {
                entity: format!("record {}", row.record_id),
            });
        }
        partition.insert(row.record_id, row);

        usage.apply(&delta, now);
        self.usage.insert(tenant_id, usage.clone());
        self.push_audit(audit);
        Ok(usage)
    }

    pub fn row(&self, scope: &RowScope, record_id: &RecordId) -> Option<StoredRow> {
        match scope {
            RowScope::Tenant(tenant_id) => self
                .rows
                .get(tenant_id)
                .and_then(|partition| partition.get(record_id))
                .cloned(),
            RowScope::AllTenants => self
                .rows
                .values()
                .find_map(|partition| partition.get(record_id))
                .cloned(),
        }
    }

    pub fn scan_rows(&self, scope: &RowScope, since: DateTime<Utc>) -> Vec<StoredRow> {
        let mut rows: Vec<StoredRow> = match scope {
            RowScope::Tenant(tenant_id) => self
                .rows
                .get(tenant_id)
                .map(|partition| partition.values().cloned().collect())
                .unwrap_or_default(),
            RowScope::AllTenants => self
                .rows
                .values()
                .flat_map(|partition| partition.values().cloned())
                .collect(),
        };
        rows.retain(|row| row.created_at >= since);
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        rows
    }

    pub fn supersede_row(&mut self, row: StoredRow, audit: Vec<AuditEntry>) -> VaultResult<()> {
        let existing = self
            .rows
            .get_mut(&row.tenant_id)
            .and_then(|partition| partition.get_mut(&row.record_id))
            .ok_or_else(|| VaultError::NotFound {
                tenant_id: row.tenant_id.to_string(),
                record_id: row.record_id.to_string(),
            })?;
        existing.body = row.body;
        existing.updated_at = row.updated_at;
        for entry in audit {
            self.push_audit(entry);
        }
        Ok(())
    }

    /// Store a row as-is, bypassing usage accounting. Used to load rows written
    /// by earlier versions (legacy plaintext) and in tests.
    pub fn import_row(&mut self, row: StoredRow) {
        self.rows
            .entry(row.tenant_id.clone())
            .or_default()
            .insert(row.record_id, row);
    }

    pub fn append_audit(&mut self, entry: AuditEntry) -> AuditEntry {
        self.push_audit(entry)
    }

    pub fn audit_range(&self, tenant_id: Option<&TenantId>, window: TimeWindow) -> Vec<AuditEntry> {
        self.audit
            .iter()
            .filter(|entry| window.contains(entry.timestamp))
            .filter(|entry| tenant_id.is_none() || entry.tenant_id.as_ref() == tenant_id)
            .cloned()
            .collect()
    }

    pub fn prune_audit(&mut self, before: DateTime<Utc>) -> usize {
        let len = self.audit.len();
        self.audit.retain(|entry| entry.timestamp >= before);
        len - self.audit.len()
    }

    fn push_audit(&mut self, mut entry: AuditEntry) -> AuditEntry {
        self.next_sequence += 1;
        entry.sequence = self.next_sequence;
        self.audit.push(entry.clone());
        entry
    }
}

fn unknown_tenant(tenant_id: &TenantId) -> VaultError {
    VaultError::AccessDenied {
        tenant_id: tenant_id.to_string(),
        reason: DenyReason::UnknownTenant,
    }
}

/// In-memory backend for tests and ephemeral dev runs without a data directory.
#[derive(Debug, Default, Clone)]
pub struct InMemoryBackend {
    inner: Arc<Mutex<MemoryState>>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn import_row(&self, row: StoredRow) -> VaultResult<()> {
        self.with_state(|state| {
            state.import_row(row);
            Ok(())
        })
    }

    /// Raw row as persisted, for inspecting what actually reached the store.
    pub fn raw_row(&self, tenant_id: &TenantId, record_id: &RecordId) -> Option<StoredRow> {
        self.with_state(|state| Ok(state.row(&RowScope::Tenant(tenant_id.clone()), record_id)))
            .ok()
            .flatten()
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut MemoryState) -> VaultResult<T>) -> VaultResult<T> {
        let mut state = self
            .inner
            .lock()
            .map_err(|err| VaultError::unavailable("memory", format!("lock poisoned: {err}")))?;
        f(&mut state)
    }
}

#[async_trait]
impl StorageBackend for InMemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn kind(&self) -> BackendKind {
        BackendKind::EphemeralDev
    }

    async fn health_check(&self) -> VaultResult<()> {
        self.with_state(|_| Ok(()))
    }

    async fn insert_tenant(&self, config: &TenantConfig, usage: &TenantUsage) -> VaultResult<()> {
        self.with_state(|state| state.insert_tenant(config, usage))
    }

    async fn update_tenant(&self, config: &TenantConfig) -> VaultResult<()> {
        self.with_state(|state| state.update_tenant(config))
    }

    async fn fetch_tenant(&self, tenant_id: &TenantId) -> VaultResult<Option<TenantConfig>> {
        self.with_state(|state| Ok(state.tenant(tenant_id)))
    }

    async fn list_tenants(&self) -> VaultResult<Vec<TenantConfig>> {
        self.with_state(|state| Ok(state.tenants()))
    }

    async fn fetch_usage(&self, tenant_id: &TenantId) -> VaultResult<Option<TenantUsage>> {
        self.with_state(|state| Ok(state.usage(tenant_id)))
    }

    async fn apply_usage(
        &self,
        tenant_id: &TenantId,
        delta: &UsageDelta,
        now: DateTime<Utc>,
    ) -> VaultResult<TenantUsage> {
        self.with_state(|state| state.apply_usage(tenant_id, delta, now))
    }

    async fn reset_period(
        &self,
        tenant_id: &TenantId,
        now: DateTime<Utc>,
    ) -> VaultResult<TenantUsage> {
        self.with_state(|state| state.reset_period(tenant_id, now))
    }

    async fn commit_row(&self, commit: RowCommit) -> VaultResult<TenantUsage> {
        self.with_state(|state| state.commit_row(commit))
    }

    async fn fetch_row(
        &self,
        scope: &RowScope,
        record_id: &RecordId,
    ) -> VaultResult<Option<StoredRow>> {
        self.with_state(|state| Ok(state.row(scope, record_id)))
    }

    async fn scan_rows(&self, scope: &RowScope, since: DateTime<Utc>) -> VaultResult<Vec<StoredRow>> {
        self.with_state(|state| Ok(state.scan_rows(scope, since)))
    }

    async fn supersede_row(&self, row: StoredRow, audit: Vec<AuditEntry>) -> VaultResult<()> {
        self.with_state(|state| state.supersede_row(row, audit))
    }

    async fn append_audit(&self, entry: AuditEntry) -> VaultResult<AuditEntry> {
        self.with_state(|state| Ok(state.append_audit(entry)))
    }

    async fn audit_range(
        &self,
        tenant_id: Option<&TenantId>,
        window: TimeWindow,
    ) -> VaultResult<Vec<AuditEntry>> {
        self.with_state(|state| Ok(state.audit_range(tenant_id, window)))
    }

    async fn prune_audit(&self, before: DateTime<Utc>) -> VaultResult<usize> {
        self.with_state(|state| Ok(state.prune_audit(before)))
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone};

    use super::*;
    use crate::{
        audit::AuditEventKind,
        package::SealedRecord,
        record::{FieldMap, RecordKind},
        tenant::{TenantLimits, Tier},
    };

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 6, 10, 9, 0, 0).unwrap()
    }

    fn tenant(id: &str) -> TenantId {
        TenantId::parse(id).unwrap()
    }

    async fn onboard(backend: &InMemoryBackend, id: &str) {
        let config = TenantConfig::new(tenant(id), id, Tier::Free, now());
        backend
            .insert_tenant(&config, &TenantUsage::new(tenant(id), now()))
            .await
            .expect("insert tenant");
    }

    fn row(id: &str) -> StoredRow {
        StoredRow {
            tenant_id: tenant(id),
            record_id: RecordId::new(),
            kind: RecordKind::PiiScan,
            created_at: now(),
            updated_at: now(),
            body: SealedRecord::legacy(FieldMap::new()),
        }
    }

    fn commit(row: StoredRow, limits: TenantLimits) -> RowCommit {
        RowCommit {
            audit: AuditEntry::new(AuditEventKind::RecordStored, now()).with_tenant(&row.tenant_id),
            row,
            delta: UsageDelta::scan(10),
            limits,
            now: now(),
        }
    }

    #[tokio::test]
    async fn duplicate_tenant_is_rejected() {
        let backend = InMemoryBackend::new();
        onboard(&backend, "acme").await;
        let config = TenantConfig::new(tenant("acme"), "again", Tier::Free, now());
        let err = backend
            .insert_tenant(&config, &TenantUsage::new(tenant("acme"), now()))
            .await
            .expect_err("duplicate");
        assert!(matches!(err, VaultError::AlreadyExists { .. }));
    }

    #[tokio::test]
    async fn rows_are_invisible_outside_their_partition() {
        let backend = InMemoryBackend::new();
        onboard(&backend, "acme").await;
        onboard(&backend, "globex").await;

        let stored = row("acme");
        let id = stored.record_id;
        backend
            .commit_row(commit(stored, TenantLimits::unlimited()))
            .await
            .expect("commit");

        let other = backend
            .fetch_row(&RowScope::Tenant(tenant("globex")), &id)
            .await
            .expect("fetch");
        assert!(other.is_none());

        let own = backend
            .fetch_row(&RowScope::Tenant(tenant("acme")), &id)
            .await
            .expect("fetch");
        assert!(own.is_some());

        let any = backend.fetch_row(&RowScope::AllTenants, &id).await.expect("fetch");
        assert!(any.is_some());
    }

    #[tokio::test]
    async fn commit_over_limit_writes_nothing() {
        let backend = InMemoryBackend::new();
        onboard(&backend, "acme").await;
        let limits = TenantLimits::new(None, Some(1), None);

        backend
            .commit_row(commit(row("acme"), limits))
            .await
            .expect("first commit");
        let rejected = row("acme");
        let rejected_id = rejected.record_id;
        let err = backend
            .commit_row(commit(rejected, limits))
            .await
            .expect_err("over limit");
        assert!(matches!(err, VaultError::AccessDenied { .. }));

        assert!(backend.raw_row(&tenant("acme"), &rejected_id).is_none());
        let usage = backend.fetch_usage(&tenant("acme")).await.unwrap().unwrap();
        assert_eq!(usage.scans_this_period, 1);
        let audit = backend
            .audit_range(None, TimeWindow::last_days(now(), 1))
            .await
            .unwrap();
        assert_eq!(audit.len(), 1);
    }

    #[tokio::test]
    async fn audit_sequence_increases_and_prune_drops_old() {
        let backend = InMemoryBackend::new();
        let old = backend
            .append_audit(AuditEntry::new(AuditEventKind::KeyGenerated, now() - Duration::days(400)))
            .await
            .unwrap();
        let recent = backend
            .append_audit(AuditEntry::new(AuditEventKind::KeyWrapped, now()))
            .await
            .unwrap();
        assert!(recent.sequence > old.sequence);

        let removed = backend
            .prune_audit(now() - Duration::days(365))
            .await
            .unwrap();
        assert_eq!(removed, 1);
        let remaining = backend
            .audit_range(None, TimeWindow::last_days(now(), 1000))
            .await
            .unwrap();
        assert_eq!(remaining, vec![recent]);
    }
}
