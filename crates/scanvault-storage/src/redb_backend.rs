//! Durable backend on redb (pure Rust, ACID).
//!
//! ## Table layout
//!
//! - `records`: `tenant_id \0 record_id` → sealed row (JSON). The tenant prefix
//!   is the partition: tenant-scoped reads are range scans over it.
//! - `tenants`: tenant_id → TenantConfig
//! - `usage`: tenant_id → TenantUsage
//! - `audit`: sequence → AuditEntry
//! - `meta`: key → value bytes (sequence counter, health check marker)

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition, WriteTransaction};
use scanvault_core::{
    audit::{AuditEntry, TimeWindow},
    error::DenyReason,
    record::{RecordId, RowScope, StoredRow},
    storage::{BackendKind, RowCommit, StorageBackend},
    tenant::{TenantConfig, TenantId, TenantUsage, UsageDelta},
    VaultError, VaultResult,
};
use serde::{de::DeserializeOwned, Serialize};
use tracing::instrument;

const RECORDS: TableDefinition<&str, &[u8]> = TableDefinition::new("records");
const TENANTS: TableDefinition<&str, &[u8]> = TableDefinition::new("tenants");
const USAGE: TableDefinition<&str, &[u8]> = TableDefinition::new("usage");
const AUDIT: TableDefinition<u64, &[u8]> = TableDefinition::new("audit");
const META: TableDefinition<&str, &[u8]> = TableDefinition::new("meta");

const NEXT_SEQUENCE: &str = "audit_next_sequence";
const HEALTH_MARKER: &str = "health_marker";

#[derive(Debug, thiserror::Error)]
enum RedbError {
    #[error("redb error: {0}")]
    Redb(#[from] redb::Error),

    #[error("redb database error: {0}")]
    Database(#[from] redb::DatabaseError),

    #[error("redb transaction error: {0}")]
    Transaction(#[from] redb::TransactionError),

    #[error("redb table error: {0}")]
    Table(#[from] redb::TableError),

    #[error("redb storage error: {0}")]
    Storage(#[from] redb::StorageError),

    #[error("redb commit error: {0}")]
    Commit(#[from] redb::CommitError),

    #[error("undecodable value: {0}")]
    Serde(#[from] serde_json::Error),

    #[error(transparent)]
    Vault(#[from] VaultError),
}

impl From<RedbError> for VaultError {
    fn from(err: RedbError) -> Self {
        match err {
            RedbError::Vault(inner) => inner,
            RedbError::Serde(e) => VaultError::integrity(format!("stored value: {e}")),
            other => VaultError::unavailable("redb", other),
        }
    }
}

type RedbResult<T> = Result<T, RedbError>;

/// Composite key: the NUL separator sorts below every tenant id character.
fn row_key(tenant_id: &TenantId, record_id: &RecordId) -> String {
    format!("{}\0{}", tenant_id.as_str(), record_id)
}

fn partition_bounds(tenant_id: &TenantId) -> (String, String) {
    (
        format!("{}\0", tenant_id.as_str()),
        format!("{}\u{1}", tenant_id.as_str()),
    )
}

fn encode<T: Serialize>(value: &T) -> RedbResult<Vec<u8>> {
    Ok(serde_json::to_vec(value)?)
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> RedbResult<T> {
    Ok(serde_json::from_slice(bytes)?)
}

fn unknown_tenant(tenant_id: &TenantId) -> VaultError {
    VaultError::AccessDenied {
        tenant_id: tenant_id.to_string(),
        reason: DenyReason::UnknownTenant,
    }
}

/// Embedded ACID datastore.
pub struct RedbBackend {
    db: Database,
}

impl RedbBackend {
    /// Open (or create) the database at the given path.
    #[instrument(skip_all, fields(path = %path.as_ref().display()))]
    pub fn open(path: impl AsRef<Path>) -> VaultResult<Self> {
        Ok(Self::open_inner(path.as_ref())?)
    }

    fn open_inner(path: &Path) -> RedbResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| VaultError::unavailable("redb", format!("create {}: {e}", parent.display())))?;
        }
        let db = Database::create(path)?;

        // Pre-create tables so read transactions never fail on a fresh file.
        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(RECORDS)?;
            let _ = write_txn.open_table(TENANTS)?;
            let _ = write_txn.open_table(USAGE)?;
            let _ = write_txn.open_table(AUDIT)?;
            let _ = write_txn.open_table(META)?;
        }
        write_txn.commit()?;
        Ok(Self { db })
    }

    /// Append inside an open write transaction, assigning the next sequence.
    fn push_audit(txn: &WriteTransaction, mut entry: AuditEntry) -> RedbResult<AuditEntry> {
        let mut meta = txn.open_table(META)?;
        let current = match meta.get(NEXT_SEQUENCE)? {
            Some(value) => {
                let bytes: [u8; 8] = value.value().try_into().map_err(|_| {
                    VaultError::integrity("audit sequence counter is corrupt")
                })?;
                u64::from_be_bytes(bytes)
            }
            None => 0,
        };
        let next = current + 1;
        meta.insert(NEXT_SEQUENCE, next.to_be_bytes().as_slice())?;

        entry.sequence = next;
        let mut audit = txn.open_table(AUDIT)?;
        audit.insert(next, encode(&entry)?.as_slice())?;
        Ok(entry)
    }

    fn read_usage(txn: &WriteTransaction, tenant_id: &TenantId) -> RedbResult<TenantUsage> {
        let table = txn.open_table(USAGE)?;
        let usage = match table.get(tenant_id.as_str())? {
            Some(value) => decode(value.value())?,
            None => return Err(unknown_tenant(tenant_id).into()),
        };
        Ok(usage)
    }

    fn write_usage(txn: &WriteTransaction, usage: &TenantUsage) -> RedbResult<()> {
        let mut table = txn.open_table(USAGE)?;
        table.insert(usage.tenant_id.as_str(), encode(usage)?.as_slice())?;
        Ok(())
    }

    fn update_usage_with(
        &self,
        tenant_id: &TenantId,
        f: impl FnOnce(&mut TenantUsage),
    ) -> RedbResult<TenantUsage> {
        let txn = self.db.begin_write()?;
        let mut usage = Self::read_usage(&txn, tenant_id)?;
        f(&mut usage);
        Self::write_usage(&txn, &usage)?;
        txn.commit()?;
        Ok(usage)
    }

    fn commit_row_inner(&self, commit: RowCommit) -> RedbResult<TenantUsage> {
        let RowCommit {
            row,
            delta,
            limits,
            audit,
            now,
        } = commit;
        let tenant_id = row.tenant_id.clone();

        // Dropping the transaction on any early return aborts it.
        let txn = self.db.begin_write()?;
        let mut usage = Self::read_usage(&txn, &tenant_id)?;
        usage.roll_over(now);
        limits
            .admits(&usage, &delta)
            .map_err(|limit| VaultError::AccessDenied {
                tenant_id: tenant_id.to_string(),
                reason: DenyReason::OverLimit(limit),
            })?;

        {
            let key = row_key(&tenant_id, &row.record_id);
            let mut records = txn.open_table(RECORDS)?;
            if records.get(key.as_str())?.is_some() {
                return Err(VaultError::AlreadyExists {
                    entity: format!("record {}", row.record_id),
                }
                .into());
            }
            records.insert(key.as_str(), encode(&row)?.as_slice())?;
        }

        usage.apply(&delta, now);
        Self::write_usage(&txn, &usage)?;
        Self::push_audit(&txn, audit)?;
        txn.commit()?;
        Ok(usage)
    }

    fn fetch_row_inner(&self, scope: &RowScope, record_id: &RecordId) -> RedbResult<Option<StoredRow>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(RECORDS)?;
        match scope {
            RowScope::Tenant(tenant_id) => {
                let key = row_key(tenant_id, record_id);
                match table.get(key.as_str())? {
                    Some(value) => Ok(Some(decode(value.value())?)),
                    None => Ok(None),
                }
            }
            RowScope::AllTenants => {
                let suffix = format!("\0{record_id}");
                for entry in table.iter()? {
                    let (key, value) = entry?;
                    if key.value().ends_with(&suffix) {
                        return Ok(Some(decode(value.value())?));
                    }
                }
                Ok(None)
            }
        }
    }

    fn scan_rows_inner(&self, scope: &RowScope, since: DateTime<Utc>) -> RedbResult<Vec<StoredRow>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(RECORDS)?;
        let mut rows = Vec::new();
        match scope {
            RowScope::Tenant(tenant_id) => {
                let (start, end) = partition_bounds(tenant_id);
                for entry in table.range(start.as_str()..end.as_str())? {
                    let (_, value) = entry?;
                    rows.push(decode::<StoredRow>(value.value())?);
                }
            }
            RowScope::AllTenants => {
                for entry in table.iter()? {
                    let (_, value) = entry?;
                    rows.push(decode::<StoredRow>(value.value())?);
                }
            }
        }
        rows.retain(|row| row.created_at >= since);
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(rows)
    }

    fn supersede_row_inner(&self, row: StoredRow, audit: Vec<AuditEntry>) -> RedbResult<()> {
        let key = row_key(&row.tenant_id, &row.record_id);
        let txn = self.db.begin_write()?;
        {
            let mut records = txn.open_table(RECORDS)?;
            let existing: StoredRow = {
                let value = records.get(key.as_str())?.ok_or_else(|| VaultError::NotFound {
                    tenant_id: row.tenant_id.to_string(),
                    record_id: row.record_id.to_string(),
                })?;
                decode(value.value())?
            };
            let updated = StoredRow {
                body: row.body,
                updated_at: row.updated_at,
                ..existing
            };
            records.insert(key.as_str(), encode(&updated)?.as_slice())?;
        }
        for entry in audit {
            Self::push_audit(&txn, entry)?;
        }
        txn.commit()?;
        Ok(())
    }

    fn audit_range_inner(
        &self,
        tenant_id: Option<&TenantId>,
        window: TimeWindow,
    ) -> RedbResult<Vec<AuditEntry>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(AUDIT)?;
        let mut out = Vec::new();
        for entry in table.iter()? {
            let (_, value) = entry?;
            let entry: AuditEntry = decode(value.value())?;
            if window.contains(entry.timestamp)
                && (tenant_id.is_none() || entry.tenant_id.as_ref() == tenant_id)
            {
                out.push(entry);
            }
        }
        Ok(out)
    }

    fn prune_audit_inner(&self, before: DateTime<Utc>) -> RedbResult<usize> {
        let txn = self.db.begin_write()?;
        let removed = {
            let mut table = txn.open_table(AUDIT)?;
            let mut stale = Vec::new();
            for entry in table.iter()? {
                let (key, value) = entry?;
                let entry: AuditEntry = decode(value.value())?;
                if entry.timestamp < before {
                    stale.push(key.value());
                }
            }
            for sequence in &stale {
                table.remove(*sequence)?;
            }
            stale.len()
        };
        txn.commit()?;
        Ok(removed)
    }
}

#[async_trait]
impl StorageBackend for RedbBackend {
    fn name(&self) -> &'static str {
        "redb"
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Durable
    }

    async fn health_check(&self) -> VaultResult<()> {
        let marker = Utc::now().timestamp().to_be_bytes();
        let run = || -> RedbResult<()> {
            let txn = self.db.begin_write()?;
            {
                let mut meta = txn.open_table(META)?;
                meta.insert(HEALTH_MARKER, marker.as_slice())?;
            }
            txn.commit()?;
            let read_txn = self.db.begin_read()?;
            let meta = read_txn.open_table(META)?;
            match meta.get(HEALTH_MARKER)? {
                Some(value) if value.value() == marker.as_slice() => Ok(()),
                _ => Err(VaultError::unavailable("redb", "health marker mismatch").into()),
            }
        };
        Ok(run()?)
    }

    async fn insert_tenant(&self, config: &TenantConfig, usage: &TenantUsage) -> VaultResult<()> {
        let run = || -> RedbResult<()> {
            let txn = self.db.begin_write()?;
            {
                let mut tenants = txn.open_table(TENANTS)?;
                if tenants.get(config.tenant_id.as_str())?.is_some() {
                    return Err(VaultError::AlreadyExists {
                        entity: format!("tenant {}", config.tenant_id),
                    }
                    .into());
                }
                tenants.insert(config.tenant_id.as_str(), encode(config)?.as_slice())?;
            }
            Self::write_usage(&txn, usage)?;
            txn.commit()?;
            Ok(())
        };
        Ok(run()?)
    }

    async fn update_tenant(&self, config: &TenantConfig) -> VaultResult<()> {
        let run = || -> RedbResult<()> {
            let txn = self.db.begin_write()?;
            {
                let mut tenants = txn.open_table(TENANTS)?;
                if tenants.get(config.tenant_id.as_str())?.is_none() {
                    return Err(unknown_tenant(&config.tenant_id).into());
                }
                tenants.insert(config.tenant_id.as_str(), encode(config)?.as_slice())?;
            }
            txn.commit()?;
            Ok(())
        };
        Ok(run()?)
    }

    async fn fetch_tenant(&self, tenant_id: &TenantId) -> VaultResult<Option<TenantConfig>> {
        let run = || -> RedbResult<Option<TenantConfig>> {
            let read_txn = self.db.begin_read()?;
            let table = read_txn.open_table(TENANTS)?;
            match table.get(tenant_id.as_str())? {
                Some(value) => Ok(Some(decode(value.value())?)),
                None => Ok(None),
            }
        };
        Ok(run()?)
    }

    async fn list_tenants(&self) -> VaultResult<Vec<TenantConfig>> {
        let run = || -> RedbResult<Vec<TenantConfig>> {
            let read_txn = self.db.begin_read()?;
            let table = read_txn.open_table(TENANTS)?;
            let mut out = Vec::new();
            for entry in table.iter()? {
                let (_, value) = entry?;
                out.push(decode(value.value())?);
            }
            Ok(out)
        };
        Ok(run()?)
    }

    async fn fetch_usage(&self, tenant_id: &TenantId) -> VaultResult<Option<TenantUsage>> {
        let run = || -> RedbResult<Option<TenantUsage>> {
            let read_txn = self.db.begin_read()?;
            let table = read_txn.open_table(USAGE)?;
            match table.get(tenant_id.as_str())? {
                Some(value) => Ok(Some(decode(value.value())?)),
                None => Ok(None),
            }
        };
        Ok(run()?)
    }

    async fn apply_usage(
        &self,
        tenant_id: &TenantId,
        delta: &UsageDelta,
        now: DateTime<Utc>,
    ) -> VaultResult<TenantUsage> {
        Ok(self.update_usage_with(tenant_id, |usage| usage.apply(delta, now))?)
    }

    async fn reset_period(
        &self,
        tenant_id: &TenantId,
        now: DateTime<Utc>,
    ) -> VaultResult<TenantUsage> {
        Ok(self.update_usage_with(tenant_id, |usage| usage.reset_period(now))?)
    }

    #[instrument(skip_all, fields(tenant = %commit.row.tenant_id, record = %commit.row.record_id))]
    async fn commit_row(&self, commit: RowCommit) -> VaultResult<TenantUsage> {
        Ok(self.commit_row_inner(commit)?)
    }

    async fn fetch_row(
        &self,
        scope: &RowScope,
        record_id: &RecordId,
    ) -> VaultResult<Option<StoredRow>> {
        Ok(self.fetch_row_inner(scope, record_id)?)
    }

    async fn scan_rows(&self, scope: &RowScope, since: DateTime<Utc>) -> VaultResult<Vec<StoredRow>> {
        Ok(self.scan_rows_inner(scope, since)?)
    }

    async fn supersede_row(&self, row: StoredRow, audit: Vec<AuditEntry>) -> VaultResult<()> {
        Ok(self.supersede_row_inner(row, audit)?)
    }

    async fn append_audit(&self, entry: AuditEntry) -> VaultResult<AuditEntry> {
        let run = || -> RedbResult<AuditEntry> {
            let txn = self.db.begin_write()?;
            let entry = Self::push_audit(&txn, entry)?;
            txn.commit()?;
            Ok(entry)
        };
        Ok(run()?)
    }

    async fn audit_range(
        &self,
        tenant_id: Option<&TenantId>,
        window: TimeWindow,
    ) -> VaultResult<Vec<AuditEntry>> {
        Ok(self.audit_range_inner(tenant_id, window)?)
    }

    async fn prune_audit(&self, before: DateTime<Utc>) -> VaultResult<usize> {
        Ok(self.prune_audit_inner(before)?)
    }
}
