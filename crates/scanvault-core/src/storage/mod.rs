//! Datastore contract used by the engine.
//!
//! Rows are partitioned by tenant inside every backend: each row read takes a
//! [`RowScope`], and a tenant scope can only ever see its own partition.

mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    audit::{AuditEntry, TimeWindow},
    error::VaultResult,
    record::{RecordId, RowScope, StoredRow},
    tenant::{TenantConfig, TenantId, TenantLimits, TenantUsage, UsageDelta},
};

pub use memory::{InMemoryBackend, MemoryState};

/// The two supported backend variants, chosen once at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// Embedded ACID database.
    #[default]
    Durable,
    /// File or memory store for development only.
    EphemeralDev,
}

/// Everything one store operation writes, committed as a single unit: the
/// row, the usage increment (checked against `limits` after rollover), and
/// the audit entry.
#[derive(Debug, Clone)]
pub struct RowCommit {
    pub row: StoredRow,
    pub delta: UsageDelta,
    pub limits: TenantLimits,
    pub audit: AuditEntry,
    pub now: DateTime<Utc>,
}

#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Short name used for logging and error context.
    fn name(&self) -> &'static str;

    fn kind(&self) -> BackendKind;

    /// Write-read round trip against the underlying store.
    async fn health_check(&self) -> VaultResult<()>;

    /// Create a tenant and its usage row. Fails with `AlreadyExists`.
    async fn insert_tenant(&self, config: &TenantConfig, usage: &TenantUsage) -> VaultResult<()>;

    /// Replace an existing tenant configuration.
    async fn update_tenant(&self, config: &TenantConfig) -> VaultResult<()>;

    async fn fetch_tenant(&self, tenant_id: &TenantId) -> VaultResult<Option<TenantConfig>>;

    async fn list_tenants(&self) -> VaultResult<Vec<TenantConfig>>;

    async fn fetch_usage(&self, tenant_id: &TenantId) -> VaultResult<Option<TenantUsage>>;

    /// Atomically roll over (if due) and apply a delta.
    async fn apply_usage(
        &self,
        tenant_id: &TenantId,
        delta: &UsageDelta,
        now: DateTime<Utc>,
    ) -> VaultResult<TenantUsage>;

    async fn reset_period(&self, tenant_id: &TenantId, now: DateTime<Utc>)
        -> VaultResult<TenantUsage>;

    /// Insert a new row with its usage increment and audit entry, all or nothing.
    async fn commit_row(&self, commit: RowCommit) -> VaultResult<TenantUsage>;

    async fn fetch_row(
        &self,
        scope: &RowScope,
        record_id: &RecordId,
    ) -> VaultResult<Option<StoredRow>>;

    /// Rows in scope created at or after `since`, newest first.
    async fn scan_rows(&self, scope: &RowScope, since: DateTime<Utc>) -> VaultResult<Vec<StoredRow>>;

    /// Replace the body of an existing row in the same tenant partition
    /// together with its audit entries. Tenant, kind, and creation time are kept.
    async fn supersede_row(&self, row: StoredRow, audit: Vec<AuditEntry>) -> VaultResult<()>;

    /// Append an entry, assigning the next sequence number.
    async fn append_audit(&self, entry: AuditEntry) -> VaultResult<AuditEntry>;

    /// Entries in the window (optionally one tenant's), in append order.
    async fn audit_range(
        &self,
        tenant_id: Option<&TenantId>,
        window: TimeWindow,
    ) -> VaultResult<Vec<AuditEntry>>;

    /// Delete entries older than `before`. Retention processes only.
    async fn prune_audit(&self, before: DateTime<Utc>) -> VaultResult<usize>;
}
