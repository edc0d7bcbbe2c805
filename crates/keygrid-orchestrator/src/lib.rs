//! keygrid-orchestrator: stands up a coordination fleet, a secret-store
//! fleet, and the front in dependency order.
//!
//! ```text
//!   resolve_images ─► render_payloads ─► provision_coordination
//!                                                │
//!        publish_dns ◄─ attach_front ◄─ provision_secret_store ◄─ bind_permissions
//! ```
//!
//! Configuration steps fail fast before any resource exists. A failure once
//! resources exist halts the deployment in place and reports the last step
//! that completed. Progress is written to the state store after every step.

pub mod binder;
pub mod error;
pub mod orchestrator;

pub use binder::{GrantOutcome, PermissionBinder};
pub use error::{OrchestratorError, OrchestratorResult};
pub use orchestrator::{
    DeploymentReport, Orchestrator, ReconcileReport, ResolvedDeployment, resolve_deployment,
};
