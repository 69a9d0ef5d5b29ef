//! Tenant-isolated storage of scan results with field-level envelope
//! encryption. `ScanResultStore` is the entry point; the other modules are
//! its building blocks and are usable on their own in tests and tooling.

pub mod audit_log;
pub mod encryption;
pub mod isolation;
pub mod registry;
pub mod store;

pub use audit_log::{AuditLog, RetentionPolicy};
pub use encryption::{EncryptionEngine, RotatedKey};
pub use isolation::{AccessMode, ScopedContext, TenantIsolationEnforcer};
pub use registry::TenantRegistry;
pub use store::{HealthReport, RotationReport, ScanResultStore};
