//! Error types for the deployment orchestrator.

use keygrid_cloud::CloudError;
use keygrid_core::{ConfigError, ImageError, RenderError};
use keygrid_front::FrontError;
use keygrid_provision::ProvisionError;
use keygrid_state::{DeployStep, StateError};
use thiserror::Error;

pub type OrchestratorResult<T> = Result<T, OrchestratorError>;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("image error: {0}")]
    Image(#[from] ImageError),

    #[error("render error: {0}")]
    Render(#[from] RenderError),

    #[error("provision error: {0}")]
    Provision(#[from] ProvisionError),

    #[error("front error: {0}")]
    Front(#[from] FrontError),

    #[error("cloud error: {0}")]
    Cloud(#[from] CloudError),

    #[error("state error: {0}")]
    State(#[from] StateError),

    /// Resources created by earlier steps are left in place.
    #[error(
        "deployment halted at {step} (last completed: {}): {source}",
        .last_completed.map(|s| s.label()).unwrap_or("none")
    )]
    PartialDeploymentHalt {
        step: DeployStep,
        last_completed: Option<DeployStep>,
        source: Box<OrchestratorError>,
    },
}
