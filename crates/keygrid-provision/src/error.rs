//! Error types for fleet provisioning.

use keygrid_cloud::CloudError;
use thiserror::Error;

pub type ProvisionResult<T> = Result<T, ProvisionError>;

#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("a reconciliation of role {0} is already running")]
    ReconcileInProgress(String),

    #[error("fleet {role} is degraded: {failures} action(s) failed after retries (last: {last_error})")]
    FleetDegraded {
        role: String,
        failures: usize,
        last_error: CloudError,
    },

    #[error("cloud error: {0}")]
    Cloud(#[from] CloudError),
}
