use std::fmt;

use thiserror::Error;

use crate::tenant::{Feature, LimitKind};

/// Result alias used across the ScanVault crates.
pub type VaultResult<T> = Result<T, VaultError>;

/// Errors produced by the persistence layer.
///
/// Messages carry the tenant and record the caller named, never key bytes or
/// field contents.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum VaultError {
    /// Missing or invalid master secret, key-service, or storage configuration.
    #[error("configuration error: {reason}")]
    Configuration { reason: String },
    /// The caller may not perform this operation for the tenant.
    #[error("access denied for tenant {tenant_id}: {reason}")]
    AccessDenied {
        tenant_id: String,
        reason: DenyReason,
    },
    /// No such record in the caller's tenant scope.
    #[error("record {record_id} not found for tenant {tenant_id}")]
    NotFound {
        tenant_id: String,
        record_id: String,
    },
    /// Unique entity already present.
    #[error("already exists: {entity}")]
    AlreadyExists { entity: String },
    /// Authentication tag mismatch, tampering, or a malformed package.
    #[error("integrity failure{}: {reason}", fmt_record(.record_id))]
    Integrity {
        record_id: Option<String>,
        reason: String,
    },
    /// Transient key-service or datastore failure; retry with backoff.
    #[error("{provider} unavailable: {reason}")]
    ProviderUnavailable { provider: String, reason: String },
    /// Caller-supplied data that can never succeed.
    #[error("invalid input: {reason}")]
    InvalidInput { reason: String },
}

fn fmt_record(record_id: &Option<String>) -> String {
    match record_id {
        Some(id) => format!(" for record {id}"),
        None => String::new(),
    }
}

/// Why an access check failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DenyReason {
    UnknownTenant,
    TenantInactive,
    FeatureNotEntitled(Feature),
    OverLimit(LimitKind),
    ElevationRequired,
}

impl fmt::Display for DenyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DenyReason::UnknownTenant => write!(f, "unknown tenant"),
            DenyReason::TenantInactive => write!(f, "tenant is not active"),
            DenyReason::FeatureNotEntitled(feature) => {
                write!(f, "feature {} not entitled", feature.as_str())
            }
            DenyReason::OverLimit(limit) => write!(f, "{} limit reached", limit.as_str()),
            DenyReason::ElevationRequired => write!(f, "elevated principal required"),
        }
    }
}

/// Coarse classification of a [`VaultError`] for callers deciding whether to
/// retry or escalate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Configuration,
    AccessDenied,
    NotFound,
    AlreadyExists,
    Integrity,
    ProviderUnavailable,
    InvalidInput,
}

impl VaultError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            VaultError::Configuration { .. } => ErrorKind::Configuration,
            VaultError::AccessDenied { .. } => ErrorKind::AccessDenied,
            VaultError::NotFound { .. } => ErrorKind::NotFound,
            VaultError::AlreadyExists { .. } => ErrorKind::AlreadyExists,
            VaultError::Integrity { .. } => ErrorKind::Integrity,
            VaultError::ProviderUnavailable { .. } => ErrorKind::ProviderUnavailable,
            VaultError::InvalidInput { .. } => ErrorKind::InvalidInput,
        }
    }

    /// Only transient provider failures are worth retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(self, VaultError::ProviderUnavailable { .. })
    }

    pub fn configuration(reason: impl Into<String>) -> Self {
        VaultError::Configuration {
            reason: reason.into(),
        }
    }

    pub fn integrity(reason: impl Into<String>) -> Self {
        VaultError::Integrity {
            record_id: None,
            reason: reason.into(),
        }
    }

    pub fn unavailable(provider: impl Into<String>, reason: impl ToString) -> Self {
        VaultError::ProviderUnavailable {
            provider: provider.into(),
            reason: reason.to_string(),
        }
    }

    pub fn invalid(reason: impl Into<String>) -> Self {
        VaultError::InvalidInput {
            reason: reason.into(),
        }
    }

    /// Attach a record id to an integrity failure that was raised without one.
    pub fn for_record(self, record_id: impl ToString) -> Self {
        match self {
            VaultError::Integrity {
                record_id: None,
                reason,
            } => VaultError::Integrity {
                record_id: Some(record_id.to_string()),
                reason,
            },
            other => other,
        }
    }
}
