//! Error types for the load balancer front.

use keygrid_cloud::CloudError;
use thiserror::Error;

pub type FrontResult<T> = Result<T, FrontError>;

#[derive(Debug, Error)]
pub enum FrontError {
    #[error("front {0} has no allowed_cidrs; refusing to open it")]
    NoAllowedCidrs(String),

    #[error("invalid allowed cidr: {0}")]
    InvalidCidr(String),

    #[error("front {0} has not been created yet")]
    NotEnsured(String),

    #[error("cloud error: {0}")]
    Cloud(#[from] CloudError),
}
