//! keygrid-provision: keeps each role's fleet at its target size.
//!
//! ```text
//!   observe(role) ──► [ObservedInstance + Liveness]
//!                              │
//!   ledger (in flight) ──► plan(role, payload, observed, in_flight)
//!                              │
//!                              ▼
//!                      [FleetAction] ──► execute with retry ──► FleetReport
//! ```
//!
//! Planning is a pure function. The provisioner wraps it with a per-role
//! ledger of actions it has issued but not yet seen take effect, which is
//! what makes repeated passes idempotent. Replacement decisions use only
//! infrastructure liveness.

pub mod error;
pub mod planner;
pub mod provisioner;

pub use error::{ProvisionError, ProvisionResult};
pub use planner::{FleetAction, InFlight, LaunchPlan, ObservedInstance, TerminateReason, plan};
pub use provisioner::{ActionFailure, FleetProvisioner, FleetReport};
