//! Error types for cloud provider calls.

use thiserror::Error;

pub type CloudResult<T> = Result<T, CloudError>;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CloudError {
    /// The caller may not perform the action. For instance callers this is
    /// often a grant that has not propagated yet.
    #[error("{caller} is not authorized to {action} on {scope}")]
    Unauthorized {
        caller: String,
        action: String,
        scope: String,
    },

    #[error("insufficient capacity in zone {zone}: {reason}")]
    Capacity { zone: String, reason: String },

    #[error("instance not found: {0}")]
    InstanceNotFound(String),

    #[error("front not found: {0}")]
    FrontNotFound(String),

    #[error("request throttled")]
    Throttled,

    #[error("cloud API error: {0}")]
    Api(String),

    #[error("snapshot error: {0}")]
    Snapshot(String),
}

impl CloudError {
    /// Whether a later attempt of the same call may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CloudError::Unauthorized { .. }
                | CloudError::Capacity { .. }
                | CloudError::Throttled
                | CloudError::Api(_)
        )
    }

    pub fn is_authorization(&self) -> bool {
        matches!(self, CloudError::Unauthorized { .. })
    }
}
