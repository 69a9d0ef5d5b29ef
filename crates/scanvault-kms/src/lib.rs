//! Key management for envelope encryption.
//! DEKs are wrapped either by a KEK derived from a local master secret or by an
//! external managed key service. The registry is built once at startup and
//! handed to every component that wraps or unwraps keys.

pub mod cloud;
pub mod local;
pub mod provider;
pub mod registry;
pub mod secret;

pub use provider::{KeyManagementProvider, KmsError};
pub use registry::{KmsConfig, ProviderRegistry};
