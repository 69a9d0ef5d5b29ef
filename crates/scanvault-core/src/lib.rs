//! Core abstractions for ScanVault: tenant and record models, the encrypted
//! package layout, audit entries, and the storage backend contract.
//! This crate is intentionally small to keep dependency surface minimal.

pub mod audit;
pub mod clock;
pub mod error;
pub mod package;
pub mod record;
pub mod storage;
pub mod tenant;

pub use error::{DenyReason, ErrorKind, VaultError, VaultResult};
