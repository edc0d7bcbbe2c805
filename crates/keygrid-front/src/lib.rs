//! keygrid-front: the load balancer in front of the secret-store fleet.
//!
//! ```text
//!   clients ──► DNS name ──► front (allowed_cidrs, listener_port)
//!                                │ round robin over healthy backends
//!                                ▼
//!                      backends (instance:backend_port)
//!                                ▲
//!              ApplicationHealth probe + HealthTracker per backend
//! ```
//!
//! The front's view of health is its own. It decides routing only and is
//! never consulted by the provisioner.

pub mod dns;
pub mod error;
pub mod front;
pub mod monitor;

pub use dns::desired_record;
pub use error::{FrontError, FrontResult};
pub use front::{BackendHealth, LoadBalancerFront};
pub use monitor::run_probe_loop;
