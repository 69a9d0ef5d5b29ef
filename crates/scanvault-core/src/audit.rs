use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::tenant::TenantId;

/// Auditable event kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventKind {
    // Key lifecycle
    KeyGenerated,
    KeyWrapped,
    KeyUnwrapped,
    KeyRotated,

    // Record access
    RecordStored,
    RecordRead,
    IntegrityFailure,

    // Tenant access
    AccessDenied,
    AdminBypass,
    TenantCreated,
    TenantUpdated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditOutcome {
    Success,
    Failure,
}

/// Immutable audit log entry. `sequence` is assigned by the backend on append.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub entry_id: Uuid,
    pub sequence: u64,
    pub kind: AuditEventKind,
    pub key_id: Option<String>,
    pub tenant_id: Option<TenantId>,
    pub timestamp: DateTime<Utc>,
    pub outcome: AuditOutcome,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl AuditEntry {
    pub fn new(kind: AuditEventKind, timestamp: DateTime<Utc>) -> Self {
        Self {
            entry_id: Uuid::new_v4(),
            sequence: 0,
            kind,
            key_id: None,
            tenant_id: None,
            timestamp,
            outcome: AuditOutcome::Success,
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_tenant(mut self, tenant_id: &TenantId) -> Self {
        self.tenant_id = Some(tenant_id.clone());
        self
    }

    pub fn with_key(mut self, key_id: impl Into<String>) -> Self {
        self.key_id = Some(key_id.into());
        self
    }

    pub fn with_meta(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn failed(mut self, error: impl Into<String>) -> Self {
        self.outcome = AuditOutcome::Failure;
        self.metadata.insert("error".to_string(), error.into());
        self
    }
}

/// Inclusive time window for audit and listing queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeWindow {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
}

impl TimeWindow {
    pub fn new(from: DateTime<Utc>, to: DateTime<Utc>) -> Self {
        Self { from, to }
    }

    /// The `days` days ending at `now`.
    pub fn last_days(now: DateTime<Utc>, days: u32) -> Self {
        Self {
            from: now - Duration::days(i64::from(days)),
            to: now,
        }
    }

    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        at >= self.from && at <= self.to
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    #[test]
    fn builder_sets_fields() {
        let now = Utc.with_ymd_and_hms(2026, 5, 1, 0, 0, 0).unwrap();
        let tenant = TenantId::parse("acme").unwrap();
        let entry = AuditEntry::new(AuditEventKind::KeyUnwrapped, now)
            .with_tenant(&tenant)
            .with_key("dek_1")
            .failed("tag mismatch");

        assert_eq!(entry.tenant_id, Some(tenant));
        assert_eq!(entry.key_id.as_deref(), Some("dek_1"));
        assert_eq!(entry.outcome, AuditOutcome::Failure);
        assert_eq!(entry.metadata.get("error").map(String::as_str), Some("tag mismatch"));
    }

    #[test]
    fn window_is_inclusive() {
        let now = Utc.with_ymd_and_hms(2026, 5, 10, 0, 0, 0).unwrap();
        let window = TimeWindow::last_days(now, 7);
        assert!(window.contains(now));
        assert!(window.contains(now - Duration::days(7)));
        assert!(!window.contains(now - Duration::days(8)));
    }
}
