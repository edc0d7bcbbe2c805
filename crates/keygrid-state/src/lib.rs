//! keygrid-state: desired-state store for keygrid.
//!
//! Backed by [redb](https://docs.rs/redb). Holds what the operator asked
//! for: resolved roles, rendered boot payloads, permission grants, the
//! front spec, and the progress of each deployment. Observed state (live
//! instances) is never stored here; it is always read from the cloud.
//!
//! ```text
//!   roles        {role}                 → Role
//!   payloads     {role}                 → BootPayload
//!   grants       {grantee}:{action}:{k=v} → PermissionGrant
//!   fronts       {front}                → FrontSpec
//!   deployments  {cluster}              → DeploymentRecord
//! ```

pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use store::StateStore;
pub use types::*;
