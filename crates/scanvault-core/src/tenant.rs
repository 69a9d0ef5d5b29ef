use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
};

use chrono::{DateTime, Datelike, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{VaultError, VaultResult};

const MAX_TENANT_ID_LEN: usize = 64;

/// Validated tenant identifier: 1-64 chars of `[a-z0-9_-]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TenantId(String);

impl TenantId {
    pub fn parse(raw: impl Into<String>) -> VaultResult<Self> {
        let raw = raw.into();
        let valid_chars = raw
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_');
        if raw.is_empty() || raw.len() > MAX_TENANT_ID_LEN || !valid_chars {
            return Err(VaultError::invalid(format!(
                "tenant id must be 1-{MAX_TENANT_ID_LEN} chars of [a-z0-9_-], got {raw:?}"
            )));
        }
        Ok(Self(raw))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for TenantId {
    type Error = VaultError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        TenantId::parse(value)
    }
}

impl From<TenantId> for String {
    fn from(value: TenantId) -> Self {
        value.0
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Features a tenant may be entitled to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Feature {
    WebsiteScan,
    AiModelScan,
    Soc2Assessment,
    PiiScan,
    AuditExport,
}

impl Feature {
    pub fn as_str(&self) -> &'static str {
        match self {
            Feature::WebsiteScan => "website_scan",
            Feature::AiModelScan => "ai_model_scan",
            Feature::Soc2Assessment => "soc2_assessment",
            Feature::PiiScan => "pii_scan",
            Feature::AuditExport => "audit_export",
        }
    }
}

/// Which configured limit a usage figure ran into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitKind {
    Users,
    Scans,
    Storage,
}

impl LimitKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            LimitKind::Users => "users",
            LimitKind::Scans => "scans",
            LimitKind::Storage => "storage",
        }
    }
}

/// Subscription tier; supplies default limits and features at onboarding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    #[default]
    Free,
    Starter,
    Professional,
    Enterprise,
}

const MB: u64 = 1024 * 1024;

impl Tier {
    pub fn default_limits(&self) -> TenantLimits {
        match self {
            Tier::Free => TenantLimits::new(Some(1), Some(10), Some(50 * MB)),
            Tier::Starter => TenantLimits::new(Some(5), Some(100), Some(1024 * MB)),
            Tier::Professional => TenantLimits::new(Some(25), Some(1_000), Some(10 * 1024 * MB)),
            Tier::Enterprise => TenantLimits::unlimited(),
        }
    }

    pub fn default_features(&self) -> BTreeSet<Feature> {
        let features: &[Feature] = match self {
            Tier::Free => &[Feature::WebsiteScan, Feature::PiiScan],
            Tier::Starter => &[Feature::WebsiteScan, Feature::PiiScan, Feature::AiModelScan],
            Tier::Professional | Tier::Enterprise => &[
                Feature::WebsiteScan,
                Feature::PiiScan,
                Feature::AiModelScan,
                Feature::Soc2Assessment,
                Feature::AuditExport,
            ],
        };
        features.iter().copied().collect()
    }
}

/// Numeric limits; `None` means unlimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct TenantLimits {
    pub max_users: Option<u64>,
    pub max_scans_per_period: Option<u64>,
    pub max_storage_bytes: Option<u64>,
}

impl TenantLimits {
    pub fn new(
        max_users: Option<u64>,
        max_scans_per_period: Option<u64>,
        max_storage_bytes: Option<u64>,
    ) -> Self {
        Self {
            max_users,
            max_scans_per_period,
            max_storage_bytes,
        }
    }

    pub fn unlimited() -> Self {
        Self::default()
    }

    /// First limit the usage is over, if any. Scans and storage are over once
    /// they reach the limit; users only once they exceed it.
    pub fn exceeded_by(&self, usage: &TenantUsage) -> Option<LimitKind> {
        if matches!(self.max_users, Some(max) if usage.user_count > max) {
            return Some(LimitKind::Users);
        }
        if matches!(self.max_scans_per_period, Some(max) if usage.scans_this_period >= max) {
            return Some(LimitKind::Scans);
        }
        if matches!(self.max_storage_bytes, Some(max) if usage.storage_used_bytes >= max) {
            return Some(LimitKind::Storage);
        }
        None
    }

    /// Check whether applying `delta` keeps usage within every limit.
    pub fn admits(&self, usage: &TenantUsage, delta: &UsageDelta) -> Result<(), LimitKind> {
        let after = |current: u64, change: i64| apply_signed(current, change);
        if delta.users > 0
            && matches!(self.max_users, Some(max) if after(usage.user_count, delta.users) > max)
        {
            return Err(LimitKind::Users);
        }
        if delta.scans > 0
            && matches!(self.max_scans_per_period, Some(max) if after(usage.scans_this_period, delta.scans) > max)
        {
            return Err(LimitKind::Scans);
        }
        if delta.storage_bytes > 0
            && matches!(self.max_storage_bytes, Some(max) if after(usage.storage_used_bytes, delta.storage_bytes) > max)
        {
            return Err(LimitKind::Storage);
        }
        Ok(())
    }
}

/// Tenants are never hard-deleted; deactivation flips this flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TenantStatus {
    #[default]
    Active,
    Suspended,
    Deactivated,
}

/// Tenant configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TenantConfig {
    pub tenant_id: TenantId,
    pub display_name: String,
    pub tier: Tier,
    pub limits: TenantLimits,
    pub features: BTreeSet<Feature>,
    /// Data-residency tag (e.g. `eu`, `us`).
    pub data_residency: String,
    pub status: TenantStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl TenantConfig {
    /// New active tenant with the tier's default limits and features.
    pub fn new(
        tenant_id: TenantId,
        display_name: impl Into<String>,
        tier: Tier,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            tenant_id,
            display_name: display_name.into(),
            tier,
            limits: tier.default_limits(),
            features: tier.default_features(),
            data_residency: "us".to_string(),
            status: TenantStatus::Active,
            created_at: now,
            updated_at: now,
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_residency(mut self, residency: impl Into<String>) -> Self {
        self.data_residency = residency.into();
        self
    }

    pub fn with_limits(mut self, limits: TenantLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn is_active(&self) -> bool {
        self.status == TenantStatus::Active
    }

    pub fn is_entitled(&self, feature: Feature) -> bool {
        self.features.contains(&feature)
    }
}

/// Plan or status change. A tier change resets limits and features to the
/// tier defaults unless they are given explicitly.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TenantUpdate {
    pub display_name: Option<String>,
    pub tier: Option<Tier>,
    pub limits: Option<TenantLimits>,
    pub features: Option<BTreeSet<Feature>>,
    pub data_residency: Option<String>,
    pub status: Option<TenantStatus>,
    pub metadata: Option<BTreeMap<String, serde_json::Value>>,
}

impl TenantUpdate {
    pub fn apply(self, config: &mut TenantConfig, now: DateTime<Utc>) {
        if let Some(tier) = self.tier {
            config.tier = tier;
            config.limits = tier.default_limits();
            config.features = tier.default_features();
        }
        if let Some(name) = self.display_name {
            config.display_name = name;
        }
        if let Some(limits) = self.limits {
            config.limits = limits;
        }
        if let Some(features) = self.features {
            config.features = features;
        }
        if let Some(residency) = self.data_residency {
            config.data_residency = residency;
        }
        if let Some(status) = self.status {
            config.status = status;
        }
        if let Some(metadata) = self.metadata {
            config.metadata = metadata;
        }
        config.updated_at = now;
    }
}

/// Usage counters, kept apart from [`TenantConfig`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantUsage {
    pub tenant_id: TenantId,
    pub user_count: u64,
    pub scans_this_period: u64,
    pub storage_used_bytes: u64,
    pub period_start: DateTime<Utc>,
    pub last_activity: Option<DateTime<Utc>>,
    /// Latest compliance score (0-100) reported by a stored record.
    pub compliance_score: Option<u8>,
}

impl TenantUsage {
    pub fn new(tenant_id: TenantId, now: DateTime<Utc>) -> Self {
        Self {
            tenant_id,
            user_count: 0,
            scans_this_period: 0,
            storage_used_bytes: 0,
            period_start: period_start(now),
            last_activity: None,
            compliance_score: None,
        }
    }

    /// Reset the scan counter if `now` falls in a later period. Returns whether
    /// a rollover happened.
    pub fn roll_over(&mut self, now: DateTime<Utc>) -> bool {
        let current = period_start(now);
        if current > self.period_start {
            debug!(
                tenant = %self.tenant_id,
                previous = %self.period_start,
                period_start = %current,
                "usage period rolled over"
            );
            self.period_start = current;
            self.scans_this_period = 0;
            return true;
        }
        false
    }

    /// Force a new period starting at the current one.
    pub fn reset_period(&mut self, now: DateTime<Utc>) {
        self.period_start = period_start(now);
        self.scans_this_period = 0;
    }

    /// Roll over if due, then apply the delta (counters saturate at zero).
    pub fn apply(&mut self, delta: &UsageDelta, now: DateTime<Utc>) {
        self.roll_over(now);
        self.user_count = apply_signed(self.user_count, delta.users);
        self.scans_this_period = apply_signed(self.scans_this_period, delta.scans);
        self.storage_used_bytes = apply_signed(self.storage_used_bytes, delta.storage_bytes);
        if let Some(score) = delta.compliance_score {
            self.compliance_score = Some(score.min(100));
        }
        self.last_activity = Some(now);
    }
}

/// Signed changes to usage counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageDelta {
    #[serde(default)]
    pub users: i64,
    #[serde(default)]
    pub scans: i64,
    #[serde(default)]
    pub storage_bytes: i64,
    #[serde(default)]
    pub compliance_score: Option<u8>,
}

impl UsageDelta {
    /// One stored scan occupying `bytes` of storage.
    pub fn scan(bytes: u64) -> Self {
        Self {
            scans: 1,
            storage_bytes: i64::try_from(bytes).unwrap_or(i64::MAX),
            ..Self::default()
        }
    }

    pub fn with_compliance_score(mut self, score: Option<u8>) -> Self {
        self.compliance_score = score;
        self
    }
}

/// Start of the calendar month (UTC) containing `now`.
pub fn period_start(now: DateTime<Utc>) -> DateTime<Utc> {
    now.date_naive()
        .with_day(1)
        .and_then(|day| day.and_hms_opt(0, 0, 0))
        .map(|start| start.and_utc())
        .unwrap_or(now)
}

fn apply_signed(current: u64, change: i64) -> u64 {
    if change >= 0 {
        current.saturating_add(change.unsigned_abs())
    } else {
        current.saturating_sub(change.unsigned_abs())
    }
}

/// Caller identity passed through for audit attribution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    pub id: String,
    /// Operators may open cross-tenant admin contexts.
    pub elevated: bool,
}

impl Principal {
    pub fn user(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            elevated: false,
        }
    }

    pub fn operator(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            elevated: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn at(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 12, 0, 0).unwrap()
    }

    #[test]
    fn tenant_id_validation() {
        assert!(TenantId::parse("acme").is_ok());
        assert!(TenantId::parse("other_tenant-2").is_ok());
        assert!(TenantId::parse("").is_err());
        assert!(TenantId::parse("Acme").is_err());
        assert!(TenantId::parse("a/b").is_err());
        assert!(TenantId::parse("x".repeat(65)).is_err());
    }

    #[test]
    fn tenant_id_rejected_during_deserialize() {
        let err = serde_json::from_str::<TenantId>("\"../etc\"");
        assert!(err.is_err());
        let ok: TenantId = serde_json::from_str("\"acme\"").expect("valid id");
        assert_eq!(ok.as_str(), "acme");
    }

    #[test]
    fn scans_are_over_limit_once_reached() {
        let limits = TenantLimits::new(None, Some(2), None);
        let mut usage = TenantUsage::new(TenantId::parse("acme").unwrap(), at(2026, 3, 5));
        assert_eq!(limits.exceeded_by(&usage), None);
        usage.scans_this_period = 2;
        assert_eq!(limits.exceeded_by(&usage), Some(LimitKind::Scans));
        assert_eq!(
            limits.admits(&usage, &UsageDelta::scan(10)),
            Err(LimitKind::Scans)
        );
    }

    #[test]
    fn users_over_limit_only_when_exceeded() {
        let limits = TenantLimits::new(Some(3), None, None);
        let mut usage = TenantUsage::new(TenantId::parse("acme").unwrap(), at(2026, 3, 5));
        usage.user_count = 3;
        assert_eq!(limits.exceeded_by(&usage), None);
        let add_user = UsageDelta {
            users: 1,
            ..UsageDelta::default()
        };
        assert_eq!(limits.admits(&usage, &add_user), Err(LimitKind::Users));
    }

    #[test]
    fn apply_rolls_over_into_new_month() {
        let mut usage = TenantUsage::new(TenantId::parse("acme").unwrap(), at(2026, 3, 5));
        usage.apply(&UsageDelta::scan(100), at(2026, 3, 20));
        usage.apply(&UsageDelta::scan(100), at(2026, 3, 21));
        assert_eq!(usage.scans_this_period, 2);

        usage.apply(&UsageDelta::scan(50), at(2026, 4, 1));
        assert_eq!(usage.scans_this_period, 1);
        assert_eq!(usage.storage_used_bytes, 250);
        assert_eq!(usage.period_start, Utc.with_ymd_and_hms(2026, 4, 1, 0, 0, 0).unwrap());
    }

    #[test]
    fn roll_over_reports_only_new_periods() {
        let mut usage = TenantUsage::new(TenantId::parse("acme").unwrap(), at(2026, 3, 5));
        usage.scans_this_period = 7;
        assert!(!usage.roll_over(at(2026, 3, 31)));
        assert_eq!(usage.scans_this_period, 7);

        assert!(usage.roll_over(at(2026, 4, 2)));
        assert_eq!(usage.scans_this_period, 0);
        assert!(!usage.roll_over(at(2026, 4, 3)));
    }

    #[test]
    fn counters_saturate_at_zero() {
        let mut usage = TenantUsage::new(TenantId::parse("acme").unwrap(), at(2026, 3, 5));
        usage.apply(
            &UsageDelta {
                users: -4,
                storage_bytes: -10,
                ..UsageDelta::default()
            },
            at(2026, 3, 6),
        );
        assert_eq!(usage.user_count, 0);
        assert_eq!(usage.storage_used_bytes, 0);
    }

    #[test]
    fn tier_change_resets_defaults() {
        let now = at(2026, 3, 5);
        let mut config = TenantConfig::new(TenantId::parse("acme").unwrap(), "Acme", Tier::Free, now);
        assert!(!config.is_entitled(Feature::Soc2Assessment));

        TenantUpdate {
            tier: Some(Tier::Professional),
            ..TenantUpdate::default()
        }
        .apply(&mut config, at(2026, 3, 6));

        assert!(config.is_entitled(Feature::Soc2Assessment));
        assert_eq!(config.limits, Tier::Professional.default_limits());
        assert_eq!(config.updated_at, at(2026, 3, 6));
    }
}
