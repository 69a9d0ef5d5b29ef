use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use scanvault_core::{
    audit::{AuditEntry, AuditEventKind, TimeWindow},
    clock::Clock,
    storage::StorageBackend,
    tenant::TenantId,
    VaultResult,
};
use tracing::{info, instrument};

/// Append-only audit log over the configured backend.
///
/// Entries are appended after the operation they describe completes, so the
/// entries for one key id appear in completion order. Nothing here deletes
/// entries; see [`RetentionPolicy`].
#[derive(Clone)]
pub struct AuditLog {
    backend: Arc<dyn StorageBackend>,
    clock: Arc<dyn Clock>,
}

impl AuditLog {
    pub fn new(backend: Arc<dyn StorageBackend>, clock: Arc<dyn Clock>) -> Self {
        Self { backend, clock }
    }

    /// Entry of `kind` stamped with the current time, ready to be appended
    /// here or committed together with a row.
    pub fn entry(&self, kind: AuditEventKind) -> AuditEntry {
        AuditEntry::new(kind, self.clock.now())
    }

    pub async fn append(
        &self,
        kind: AuditEventKind,
        key_id: Option<&str>,
        tenant_id: Option<&TenantId>,
        metadata: impl IntoIterator<Item = (String, String)>,
    ) -> VaultResult<AuditEntry> {
        let mut entry = self.entry(kind);
        entry.key_id = key_id.map(str::to_string);
        entry.tenant_id = tenant_id.cloned();
        entry.metadata.extend(metadata);
        self.record(entry).await
    }

    /// Append a prepared entry.
    pub async fn record(&self, entry: AuditEntry) -> VaultResult<AuditEntry> {
        self.backend.append_audit(entry).await
    }

    /// Entries in the window, optionally limited to one tenant, in append order.
    pub async fn query(
        &self,
        tenant_id: Option<&TenantId>,
        window: TimeWindow,
    ) -> VaultResult<Vec<AuditEntry>> {
        self.backend.audit_range(tenant_id, window).await
    }

    /// Every entry in the window that mentions `key_id`.
    pub async fn for_key(&self, key_id: &str, window: TimeWindow) -> VaultResult<Vec<AuditEntry>> {
        let mut entries = self.query(None, window).await?;
        entries.retain(|entry| entry.key_id.as_deref() == Some(key_id));
        Ok(entries)
    }

    pub(crate) fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }
}

/// Audit retention. Pruning is the only code path that deletes entries and
/// only runs when invoked explicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    pub max_age: Duration,
}

impl RetentionPolicy {
    pub fn new(max_age: Duration) -> Self {
        Self { max_age }
    }

    pub fn from_days(days: u32) -> Self {
        Self::new(Duration::days(i64::from(days)))
    }

    pub fn cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now - self.max_age
    }

    /// Delete entries older than `max_age` as of `now`. Returns the count.
    #[instrument(skip_all, fields(max_age_days = self.max_age.num_days()))]
    pub async fn prune(&self, log: &AuditLog, now: DateTime<Utc>) -> VaultResult<usize> {
        let cutoff = self.cutoff(now);
        let removed = log.backend.prune_audit(cutoff).await?;
        info!(removed, %cutoff, "audit retention pruned entries");
        Ok(removed)
    }
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self::from_days(365)
    }
}
