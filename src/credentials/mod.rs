//! Credential pool
//!
//! Short-lived auth parameter bundles are scored by their success rate and
//! rotated between requests. Records that keep failing are deactivated, and
//! an exhausted pool raises a replenishment signal for the health monitor.

mod pool;
mod record;

pub use pool::{read_credential_file, CredentialPool, PoolSettings, PoolStats};
pub use record::{CredentialBundle, CredentialId, CredentialRecord};
