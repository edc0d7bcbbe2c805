//! keygrid-cloud: the cloud provider contract.
//!
//! Everything keygrid does to infrastructure goes through
//! [`CloudProvider`]. Two kinds of callers exist: the orchestrator, which
//! may do anything, and instances, which may only list instances carrying
//! their own tags or tags they were granted.
//!
//! ```text
//!   Orchestrator ──launch/terminate──┐
//!   Provisioner  ──list(tag)─────────┤
//!   Front        ──backends/dns──────┼──► CloudProvider ──► SimulatedCloud
//!   Binder       ──put_grant─────────┤                      (or a real API)
//!   Node (boot)  ──list(tag) as self─┘
//! ```

pub mod error;
pub mod provider;
pub mod retry;
pub mod simulated;

pub use error::{CloudError, CloudResult};
pub use provider::*;
pub use retry::with_retry;
pub use simulated::{CallStats, SimulatedCloud};
