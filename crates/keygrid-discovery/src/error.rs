//! Error types for node-side discovery.

use std::path::PathBuf;

use keygrid_cloud::CloudError;
use thiserror::Error;

pub type DiscoveryResult<T> = Result<T, DiscoveryError>;

#[derive(Debug, Error)]
pub enum DiscoveryError {
    /// Retry budget used up; the cluster could not be discovered.
    #[error("failed to discover cluster {tag} after {attempts} attempt(s): {last_error}")]
    Timeout {
        tag: String,
        attempts: u32,
        last_error: CloudError,
    },

    #[error("cloud error: {0}")]
    Cloud(#[from] CloudError),

    #[error("failed to read boot payload {path}: {source}")]
    PayloadIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid boot payload: {0}")]
    InvalidPayload(String),

    #[error("boot of role {role} halted: {source}")]
    Halted {
        role: String,
        #[source]
        source: Box<DiscoveryError>,
    },
}
