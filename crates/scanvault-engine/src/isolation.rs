use std::sync::Arc;

use chrono::{DateTime, Utc};
use scanvault_core::{
    audit::{AuditEntry, AuditEventKind},
    error::DenyReason,
    record::{RecordId, RowScope, StoredRow},
    storage::{RowCommit, StorageBackend},
    tenant::{Feature, Principal, TenantConfig, TenantId, TenantUsage},
    VaultError, VaultResult,
};
use tracing::{instrument, warn};

use crate::{audit_log::AuditLog, registry::TenantRegistry};

/// What an access check is for. Writes are additionally held to the
/// tenant's usage limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    Read,
    Write,
}

/// Binds callers to a tenant's partition.
#[derive(Clone)]
pub struct TenantIsolationEnforcer {
    registry: Arc<TenantRegistry>,
    backend: Arc<dyn StorageBackend>,
    audit: AuditLog,
}

impl TenantIsolationEnforcer {
    pub fn new(
        registry: Arc<TenantRegistry>,
        backend: Arc<dyn StorageBackend>,
        audit: AuditLog,
    ) -> Self {
        Self {
            registry,
            backend,
            audit,
        }
    }

    /// Check the tenant exists, is active, is entitled to `feature`, and for
    /// writes is under every configured limit. Denials are audited.
    #[instrument(skip_all, fields(tenant = %tenant_id, mode = ?mode))]
    pub async fn check_access(
        &self,
        tenant_id: &TenantId,
        feature: Option<Feature>,
        mode: AccessMode,
    ) -> VaultResult<TenantConfig> {
        match self.evaluate(tenant_id, feature, mode).await? {
            Ok(config) => Ok(config),
            Err(reason) => {
                warn!(%reason, "tenant access denied");
                self.audit
                    .record(
                        self.audit
                            .entry(AuditEventKind::AccessDenied)
                            .with_tenant(tenant_id)
                            .failed(reason.to_string()),
                    )
                    .await?;
                Err(VaultError::AccessDenied {
                    tenant_id: tenant_id.to_string(),
                    reason,
                })
            }
        }
    }

    /// `false` for an unknown or inactive tenant, a missing entitlement, or
    /// usage over any limit. Datastore failures are still errors.
    pub async fn validate_access(
        &self,
        tenant_id: &TenantId,
        feature: Option<Feature>,
    ) -> VaultResult<bool> {
        Ok(self
            .evaluate(tenant_id, feature, AccessMode::Write)
            .await?
            .is_ok())
    }

    async fn evaluate(
        &self,
        tenant_id: &TenantId,
        feature: Option<Feature>,
        mode: AccessMode,
    ) -> VaultResult<Result<TenantConfig, DenyReason>> {
        let Some(config) = self.registry.get_tenant(tenant_id).await? else {
            return Ok(Err(DenyReason::UnknownTenant));
        };
        if !config.is_active() {
            return Ok(Err(DenyReason::TenantInactive));
        }
        if let Some(feature) = feature {
            if !config.is_entitled(feature) {
                return Ok(Err(DenyReason::FeatureNotEntitled(feature)));
            }
        }
        if mode == AccessMode::Write {
            let usage = self.registry.get_usage(tenant_id).await?;
            if let Some(limit) = TenantRegistry::over_limit(&config, &usage) {
                return Ok(Err(DenyReason::OverLimit(limit)));
            }
        }
        Ok(Ok(config))
    }

    /// Handle restricted to `tenant_id`'s partition.
    pub fn scoped_context(&self, tenant_id: &TenantId) -> ScopedContext {
        ScopedContext {
            scope: RowScope::Tenant(tenant_id.clone()),
            backend: self.backend.clone(),
        }
    }

    /// Scoped handle; `admin_bypass` widens it to every tenant and requires an
    /// elevated principal.
    pub async fn get_scoped_context(
        &self,
        tenant_id: &TenantId,
        principal: &Principal,
        admin_bypass: bool,
    ) -> VaultResult<ScopedContext> {
        if admin_bypass {
            return self
                .admin_context(principal, &format!("bypass requested for {tenant_id}"))
                .await;
        }
        Ok(self.scoped_context(tenant_id))
    }

    /// Read-only handle over every tenant. Only elevated principals may open
    /// one, and every opening is audited.
    #[instrument(skip_all, fields(principal = %principal.id))]
    pub async fn admin_context(
        &self,
        principal: &Principal,
        reason: &str,
    ) -> VaultResult<ScopedContext> {
        if !principal.elevated {
            self.audit
                .record(
                    self.audit
                        .entry(AuditEventKind::AdminBypass)
                        .with_meta("principal", &principal.id)
                        .with_meta("reason", reason)
                        .failed(DenyReason::ElevationRequired.to_string()),
                )
                .await?;
            return Err(VaultError::AccessDenied {
                tenant_id: "*".to_string(),
                reason: DenyReason::ElevationRequired,
            });
        }
        self.audit
            .record(
                self.audit
                    .entry(AuditEventKind::AdminBypass)
                    .with_meta("principal", &principal.id)
                    .with_meta("reason", reason),
            )
            .await?;
        warn!(reason, "admin bypass context opened");
        Ok(ScopedContext {
            scope: RowScope::AllTenants,
            backend: self.backend.clone(),
        })
    }
}

/// Data-access handle. Every read goes through the backend with this
/// handle's [`RowScope`], so the partition restriction is applied by the
/// datastore rather than by filtering afterwards. Writes are only possible
/// through tenant-scoped handles and only for the handle's own tenant.
#[derive(Clone)]
pub struct ScopedContext {
    scope: RowScope,
    backend: Arc<dyn StorageBackend>,
}

impl ScopedContext {
    pub fn scope(&self) -> &RowScope {
        &self.scope
    }

    pub fn tenant_id(&self) -> Option<&TenantId> {
        match &self.scope {
            RowScope::Tenant(tenant_id) => Some(tenant_id),
            RowScope::AllTenants => None,
        }
    }

    pub async fn fetch(&self, record_id: &RecordId) -> VaultResult<Option<StoredRow>> {
        self.backend.fetch_row(&self.scope, record_id).await
    }

    /// Rows created at or after `since`, newest first.
    pub async fn recent(&self, since: DateTime<Utc>) -> VaultResult<Vec<StoredRow>> {
        self.backend.scan_rows(&self.scope, since).await
    }

    pub async fn commit(&self, commit: RowCommit) -> VaultResult<TenantUsage> {
        self.ensure_writable(&commit.row.tenant_id)?;
        self.backend.commit_row(commit).await
    }

    pub async fn supersede(&self, row: StoredRow, audit: Vec<AuditEntry>) -> VaultResult<()> {
        self.ensure_writable(&row.tenant_id)?;
        self.backend.supersede_row(row, audit).await
    }

    fn ensure_writable(&self, tenant_id: &TenantId) -> VaultResult<()> {
        match &self.scope {
            RowScope::Tenant(scoped) if scoped == tenant_id => Ok(()),
            RowScope::Tenant(scoped) => Err(VaultError::AccessDenied {
                tenant_id: scoped.to_string(),
                reason: DenyReason::UnknownTenant,
            }),
            RowScope::AllTenants => Err(VaultError::invalid(
                "admin contexts are read-only",
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use scanvault_core::{
        audit::TimeWindow,
        clock::{Clock, ManualClock},
        package::SealedRecord,
        record::{FieldMap, RecordKind},
        storage::InMemoryBackend,
        tenant::{TenantLimits, TenantStatus, TenantUpdate, Tier, UsageDelta},
    };

    use super::*;

    struct Fixture {
        enforcer: TenantIsolationEnforcer,
        registry: Arc<TenantRegistry>,
        audit: AuditLog,
        clock: ManualClock,
    }

    async fn fixture() -> Fixture {
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2026, 2, 10, 9, 0, 0).unwrap());
        let backend: Arc<dyn StorageBackend> = Arc::new(InMemoryBackend::new());
        let audit = AuditLog::new(backend.clone(), Arc::new(clock.clone()));
        let registry = Arc::new(TenantRegistry::new(
            backend.clone(),
            Arc::new(clock.clone()),
            audit.clone(),
        ));
        for (id, tier) in [("acme", Tier::Starter), ("globex", Tier::Free)] {
            registry
                .create_tenant(TenantConfig::new(
                    TenantId::parse(id).unwrap(),
                    id,
                    tier,
                    clock.now(),
                ))
                .await
                .expect("tenant");
        }
        Fixture {
            enforcer: TenantIsolationEnforcer::new(registry.clone(), backend, audit.clone()),
            registry,
            audit,
            clock,
        }
    }

    fn tenant(id: &str) -> TenantId {
        TenantId::parse(id).unwrap()
    }

    fn row(tenant_id: TenantId, at: DateTime<Utc>) -> StoredRow {
        StoredRow {
            tenant_id,
            record_id: RecordId::new(),
            kind: RecordKind::WebsiteScan,
            created_at: at,
            updated_at: at,
            body: SealedRecord::legacy(FieldMap::new()),
        }
    }

    fn commit(row: StoredRow, at: DateTime<Utc>) -> RowCommit {
        RowCommit {
            audit: AuditEntry::new(AuditEventKind::RecordStored, at).with_tenant(&row.tenant_id),
            row,
            delta: UsageDelta::scan(1),
            limits: TenantLimits::unlimited(),
            now: at,
        }
    }

    #[tokio::test]
    async fn validate_access_reports_each_denial() {
        let fx = fixture().await;
        assert!(fx.enforcer.validate_access(&tenant("acme"), Some(Feature::WebsiteScan)).await.unwrap());
        assert!(!fx.enforcer.validate_access(&tenant("initech"), None).await.unwrap());
        assert!(!fx
            .enforcer
            .validate_access(&tenant("globex"), Some(Feature::Soc2Assessment))
            .await
            .unwrap());

        fx.registry
            .update_tenant(
                &tenant("acme"),
                TenantUpdate {
                    limits: Some(TenantLimits::new(None, Some(1), None)),
                    ..TenantUpdate::default()
                },
            )
            .await
            .unwrap();
        fx.registry
            .update_usage(&tenant("acme"), UsageDelta::scan(1))
            .await
            .unwrap();
        assert!(!fx.enforcer.validate_access(&tenant("acme"), None).await.unwrap());
        // Reads are not held to quotas.
        fx.enforcer
            .check_access(&tenant("acme"), None, AccessMode::Read)
            .await
            .expect("read allowed over quota");
    }

    #[tokio::test]
    async fn inactive_tenant_is_denied_and_audited() {
        let fx = fixture().await;
        fx.registry
            .update_tenant(
                &tenant("globex"),
                TenantUpdate {
                    status: Some(TenantStatus::Deactivated),
                    ..TenantUpdate::default()
                },
            )
            .await
            .unwrap();
        let err = fx
            .enforcer
            .check_access(&tenant("globex"), None, AccessMode::Read)
            .await
            .expect_err("inactive");
        assert!(matches!(
            err,
            VaultError::AccessDenied {
                reason: DenyReason::TenantInactive,
                ..
            }
        ));
        let denials = fx
            .audit
            .query(Some(&tenant("globex")), TimeWindow::last_days(fx.clock.now(), 1))
            .await
            .unwrap()
            .into_iter()
            .filter(|e| e.kind == AuditEventKind::AccessDenied)
            .count();
        assert_eq!(denials, 1);
    }

    #[tokio::test]
    async fn scoped_context_cannot_see_or_write_other_tenants() {
        let fx = fixture().await;
        let now = fx.clock.now();
        let acme_ctx = fx.enforcer.scoped_context(&tenant("acme"));
        let globex_ctx = fx.enforcer.scoped_context(&tenant("globex"));

        let acme_row = row(tenant("acme"), now);
        let id = acme_row.record_id;
        acme_ctx.commit(commit(acme_row, now)).await.expect("own write");

        assert!(globex_ctx.fetch(&id).await.unwrap().is_none());
        assert!(globex_ctx.recent(now - chrono::Duration::days(1)).await.unwrap().is_empty());
        assert!(acme_ctx.fetch(&id).await.unwrap().is_some());

        let err = globex_ctx
            .commit(commit(row(tenant("acme"), now), now))
            .await
            .expect_err("cross-tenant write");
        assert!(matches!(err, VaultError::AccessDenied { .. }));
    }

    #[tokio::test]
    async fn admin_context_requires_elevation_and_is_audited() {
        let fx = fixture().await;
        let err = fx
            .enforcer
            .admin_context(&Principal::user("alice"), "support ticket")
            .await
            .err()
            .expect("not elevated");
        assert!(matches!(
            err,
            VaultError::AccessDenied {
                reason: DenyReason::ElevationRequired,
                ..
            }
        ));

        let ctx = fx
            .enforcer
            .get_scoped_context(&tenant("acme"), &Principal::operator("ops"), true)
            .await
            .expect("elevated");
        assert_eq!(ctx.scope(), &RowScope::AllTenants);
        assert!(ctx.tenant_id().is_none());

        let now = fx.clock.now();
        let err = ctx
            .commit(commit(row(tenant("acme"), now), now))
            .await
            .expect_err("read-only");
        assert!(matches!(err, VaultError::InvalidInput { .. }));

        let bypasses = fx
            .audit
            .query(None, TimeWindow::last_days(now, 1))
            .await
            .unwrap()
            .into_iter()
            .filter(|e| e.kind == AuditEventKind::AdminBypass)
            .collect::<Vec<_>>();
        assert_eq!(bypasses.len(), 2);
        assert_eq!(bypasses[1].metadata["principal"], "ops");
    }
}
