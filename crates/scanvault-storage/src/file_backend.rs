use std::{
    fs::{self, File},
    io::{Read, Write},
    path::{Path, PathBuf},
    sync::Mutex,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use scanvault_core::{
    audit::{AuditEntry, TimeWindow},
    record::{RecordId, RowScope, StoredRow},
    storage::{BackendKind, MemoryState, RowCommit, StorageBackend},
    tenant::{TenantConfig, TenantId, TenantUsage, UsageDelta},
    VaultError, VaultResult,
};
use tempfile::NamedTempFile;
use tracing::{instrument, warn};

/// Development backend: the whole datastore as one JSON snapshot on disk.
///
/// Rows hold the same sealed bodies the durable backend stores, so sensitive
/// fields are never written in the clear. Every mutation is applied to a copy
/// of the state, persisted atomically, and only then made visible.
pub struct FileBackend {
    path: PathBuf,
    state: Mutex<MemoryState>,
}

impl FileBackend {
    #[instrument(skip_all, fields(path = %path.as_ref().display()))]
    pub fn open(path: impl AsRef<Path>) -> VaultResult<Self> {
        let path = path.as_ref().to_path_buf();
        let state = match read_snapshot(&path)? {
            Some(state) => state,
            None => MemoryState::default(),
        };
        warn!("using ephemeral development storage; not for production data");
        Ok(Self {
            path,
            state: Mutex::new(state),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read<T>(&self, f: impl FnOnce(&MemoryState) -> T) -> VaultResult<T> {
        let state = self.state.lock().map_err(poisoned)?;
        Ok(f(&state))
    }

    fn mutate<T>(&self, f: impl FnOnce(&mut MemoryState) -> VaultResult<T>) -> VaultResult<T> {
        let mut state = self.state.lock().map_err(poisoned)?;
        let mut next = state.clone();
        let out = f(&mut next)?;
        write_snapshot(&self.path, &next)?;
        *state = next;
        Ok(out)
    }
}

fn poisoned<E: std::fmt::Display>(err: E) -> VaultError {
    VaultError::unavailable("file", format!("lock poisoned: {err}"))
}

fn io_err<E: ToString>(err: E) -> VaultError {
    VaultError::unavailable("file", err)
}

fn write_snapshot(path: &Path, state: &MemoryState) -> VaultResult<()> {
    let parent = path
        .parent()
        .ok_or_else(|| VaultError::configuration("invalid storage path"))?;
    fs::create_dir_all(parent).map_err(io_err)?;

    let mut tmp = NamedTempFile::new_in(parent).map_err(io_err)?;
    let json = serde_json::to_vec(state).map_err(io_err)?;
    tmp.write_all(&json).map_err(io_err)?;
    tmp.flush().map_err(io_err)?;
    tmp.persist(path).map_err(|e| io_err(e.error))?;
    Ok(())
}

fn read_snapshot(path: &Path) -> VaultResult<Option<MemoryState>> {
    let mut file = match File::open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(io_err(err)),
    };
    let mut buf = Vec::new();
    file.read_to_end(&mut buf).map_err(io_err)?;
    if buf.is_empty() {
        return Ok(None);
    }
    serde_json::from_slice(&buf)
        .map(Some)
        .map_err(|e| VaultError::integrity(format!("snapshot {} is unreadable: {e}", path.display())))
}

#[async_trait]
impl StorageBackend for FileBackend {
    fn name(&self) -> &'static str {
        "file"
    }

    fn kind(&self) -> BackendKind {
        BackendKind::EphemeralDev
    }

    async fn health_check(&self) -> VaultResult<()> {
        self.mutate(|_| Ok(()))
    }

    async fn insert_tenant(&self, config: &TenantConfig, usage: &TenantUsage) -> VaultResult<()> {
        self.mutate(|state| state.insert_tenant(config, usage))
    }

    async fn update_tenant(&self, config: &TenantConfig) -> VaultResult<()> {
        self.mutate(|state| state.update_tenant(config))
    }

    async fn fetch_tenant(&self, tenant_id: &TenantId) -> VaultResult<Option<TenantConfig>> {
        self.read(|state| state.tenant(tenant_id))
    }

    async fn list_tenants(&self) -> VaultResult<Vec<TenantConfig>> {
        self.read(|state| state.tenants())
    }

    async fn fetch_usage(&self, tenant_id: &TenantId) -> VaultResult<Option<TenantUsage>> {
        self.read(|state| state.usage(tenant_id))
    }

    async fn apply_usage(
        &self,
        tenant_id: &TenantId,
        delta: &UsageDelta,
        now: DateTime<Utc>,
    ) -> VaultResult<TenantUsage> {
        self.mutate(|state| state.apply_usage(tenant_id, delta, now))
    }

    async fn reset_period(
        &self,
        tenant_id: &TenantId,
        now: DateTime<Utc>,
    ) -> VaultResult<TenantUsage> {
        self.mutate(|state| state.reset_period(tenant_id, now))
    }

    #[instrument(skip_all, fields(tenant = %commit.row.tenant_id, record = %commit.row.record_id))]
    async fn commit_row(&self, commit: RowCommit) -> VaultResult<TenantUsage> {
        self.mutate(|state| state.commit_row(commit))
    }

    async fn fetch_row(
        &self,
        scope: &RowScope,
        record_id: &RecordId,
    ) -> VaultResult<Option<StoredRow>> {
        self.read(|state| state.row(scope, record_id))
    }

    async fn scan_rows(&self, scope: &RowScope, since: DateTime<Utc>) -> VaultResult<Vec<StoredRow>> {
        self.read(|state| state.scan_rows(scope, since))
    }

    async fn supersede_row(&self, row: StoredRow, audit: Vec<AuditEntry>) -> VaultResult<()> {
        self.mutate(|state| state.supersede_row(row, audit))
    }

    async fn append_audit(&self, entry: AuditEntry) -> VaultResult<AuditEntry> {
        self.mutate(|state| Ok(state.append_audit(entry)))
    }

    async fn audit_range(
        &self,
        tenant_id: Option<&TenantId>,
        window: TimeWindow,
    ) -> VaultResult<Vec<AuditEntry>> {
        self.read(|state| state.audit_range(tenant_id, window))
    }

    async fn prune_audit(&self, before: DateTime<Utc>) -> VaultResult<usize> {
        self.mutate(|state| Ok(state.prune_audit(before)))
    }
}
