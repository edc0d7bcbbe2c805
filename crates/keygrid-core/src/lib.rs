//! keygrid-core: shared types for the keygrid orchestrator.
//!
//! ```text
//!   keygrid.toml ──► Manifest ──► ImageRegistry::resolve ──► Role
//!                                                             │
//!                                         render(role, tag) ◄─┘
//!                                                 │
//!                                                 ▼
//!                                           BootPayload (digest)
//! ```

pub mod config;
pub mod duration;
pub mod image;
pub mod render;
pub mod retry;
pub mod types;

pub use config::{ConfigError, Manifest};
pub use image::{ImageCatalog, ImageError, ImageRegistry, ImageSelector, MachineImage};
pub use render::{RenderError, render};
pub use retry::RetryPolicy;
pub use types::*;
