//! keygrid-health: the two health signals keygrid keeps apart.
//!
//! ```text
//!   cloud status checks ──► InfrastructureHealth ──► Liveness ──► keygrid-provision
//!                                                                  (replace / keep)
//!
//!   HTTP probe ──► ApplicationHealth ──► ProbeResult ──► HealthTracker ──► keygrid-front
//!                                                                          (route / skip)
//! ```
//!
//! The provisioner only ever sees [`Liveness`]. A node that is alive but
//! sealed fails its application probe and drops out of the front's
//! rotation, yet is never replaced for it.

pub mod app;
pub mod checker;
pub mod infra;

pub use app::{ApplicationHealth, HttpProbe};
pub use checker::{HealthStatus, HealthTracker, ProbeResult, http_probe};
pub use infra::{InfrastructureHealth, Liveness, StatusCheckHealth};
