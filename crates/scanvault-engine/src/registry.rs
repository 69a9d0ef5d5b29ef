use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};

use scanvault_core::{
    audit::AuditEventKind,
    clock::Clock,
    error::DenyReason,
    storage::StorageBackend,
    tenant::{LimitKind, TenantConfig, TenantId, TenantUpdate, TenantUsage, UsageDelta},
    VaultError, VaultResult,
};
use tracing::{info, instrument};

use crate::audit_log::AuditLog;

/// Tenant configuration and usage counters.
///
/// Configurations are cached; the cache is refreshed synchronously whenever
/// a configuration is written and is never held across a datastore call.
/// Usage is always read from the backend.
pub struct TenantRegistry {
    backend: Arc<dyn StorageBackend>,
    clock: Arc<dyn Clock>,
    audit: AuditLog,
    cache: RwLock<HashMap<TenantId, TenantConfig>>,
}

impl TenantRegistry {
    pub fn new(backend: Arc<dyn StorageBackend>, clock: Arc<dyn Clock>, audit: AuditLog) -> Self {
        Self {
            backend,
            clock,
            audit,
            cache: RwLock::new(HashMap::new()),
        }
    }

    fn cached(&self, tenant_id: &TenantId) -> VaultResult<Option<TenantConfig>> {
        let cache = self.cache.read().map_err(poisoned)?;
        Ok(cache.get(tenant_id).cloned())
    }

    fn refresh(&self, config: &TenantConfig) -> VaultResult<()> {
        let mut cache = self.cache.write().map_err(poisoned)?;
        cache.insert(config.tenant_id.clone(), config.clone());
        Ok(())
    }

    /// Onboard a tenant. Ids are unique; a second create fails with
    /// `AlreadyExists`.
    #[instrument(skip_all, fields(tenant = %config.tenant_id))]
    pub async fn create_tenant(&self, config: TenantConfig) -> VaultResult<TenantConfig> {
        let usage = TenantUsage::new(config.tenant_id.clone(), self.clock.now());
        self.backend.insert_tenant(&config, &usage).await?;
        self.refresh(&config)?;
        self.audit
            .record(
                self.audit
                    .entry(AuditEventKind::TenantCreated)
                    .with_tenant(&config.tenant_id)
                    .with_meta("tier", format!("{:?}", config.tier)),
            )
            .await?;
        info!(tier = ?config.tier, "tenant created");
        Ok(config)
    }

    pub async fn get_tenant(&self, tenant_id: &TenantId) -> VaultResult<Option<TenantConfig>> {
        if let Some(config) = self.cached(tenant_id)? {
            return Ok(Some(config));
        }
        let fetched = self.backend.fetch_tenant(tenant_id).await?;
        if let Some(config) = &fetched {
            self.refresh(config)?;
        }
        Ok(fetched)
    }

    /// Like [`get_tenant`](Self::get_tenant), but an unknown id is an access
    /// denial.
    pub async fn require_tenant(&self, tenant_id: &TenantId) -> VaultResult<TenantConfig> {
        self.get_tenant(tenant_id)
            .await?
            .ok_or_else(|| VaultError::AccessDenied {
                tenant_id: tenant_id.to_string(),
                reason: DenyReason::UnknownTenant,
            })
    }

    /// Apply a plan or status change.
    #[instrument(skip_all, fields(tenant = %tenant_id))]
    pub async fn update_tenant(
        &self,
        tenant_id: &TenantId,
        update: TenantUpdate,
    ) -> VaultResult<TenantConfig> {
        let mut config = self
            .backend
            .fetch_tenant(tenant_id)
            .await?
            .ok_or_else(|| VaultError::AccessDenied {
                tenant_id: tenant_id.to_string(),
                reason: DenyReason::UnknownTenant,
            })?;
        update.apply(&mut config, self.clock.now());
        self.backend.update_tenant(&config).await?;
        self.refresh(&config)?;
        self.audit
            .record(
                self.audit
                    .entry(AuditEventKind::TenantUpdated)
                    .with_tenant(tenant_id)
                    .with_meta("status", format!("{:?}", config.status))
                    .with_meta("tier", format!("{:?}", config.tier)),
            )
            .await?;
        Ok(config)
    }

    pub async fn list_tenants(&self) -> VaultResult<Vec<TenantConfig>> {
        self.backend.list_tenants().await
    }

    /// Current-period usage. A pending rollover is reflected in the result
    /// even before the next write persists it.
    pub async fn get_usage(&self, tenant_id: &TenantId) -> VaultResult<TenantUsage> {
        let mut usage = self
            .backend
            .fetch_usage(tenant_id)
            .await?
            .ok_or_else(|| VaultError::AccessDenied {
                tenant_id: tenant_id.to_string(),
                reason: DenyReason::UnknownTenant,
            })?;
        usage.roll_over(self.clock.now());
        Ok(usage)
    }

    /// Apply signed counter changes atomically at the data layer.
    #[instrument(skip_all, fields(tenant = %tenant_id))]
    pub async fn update_usage(
        &self,
        tenant_id: &TenantId,
        delta: UsageDelta,
    ) -> VaultResult<TenantUsage> {
        self.backend
            .apply_usage(tenant_id, &delta, self.clock.now())
            .await
    }

    /// Force a new usage period now.
    #[instrument(skip_all, fields(tenant = %tenant_id))]
    pub async fn start_new_period(&self, tenant_id: &TenantId) -> VaultResult<TenantUsage> {
        let usage = self.backend.reset_period(tenant_id, self.clock.now()).await?;
        info!(period_start = %usage.period_start, "usage period reset");
        Ok(usage)
    }

    /// First limit `usage` is over, if any. Read-only.
    pub fn over_limit(config: &TenantConfig, usage: &TenantUsage) -> Option<LimitKind> {
        config.limits.exceeded_by(usage)
    }
}

fn poisoned<E: std::fmt::Display>(err: E) -> VaultError {
    VaultError::unavailable("tenant cache", format!("lock poisoned: {err}"))
}
