//! keygrid-discovery: how a freshly booted node finds its cluster.
//!
//! ```text
//!   boot payload (cluster_tag_key, cluster_tag_value, retry, policy)
//!        │
//!        ▼
//!   BootAgent::boot ──► DiscoveryClient::join(tag)
//!                            │  list_instances(as self, tag)
//!                            │  retry on throttling / grant not yet visible
//!                            ▼
//!                       [PeerAddress] ──► retry_join list for the agent
//! ```
//!
//! Discovery only produces the bootstrap hint. Membership after first
//! contact belongs to the coordination protocol.

pub mod agent;
pub mod client;
pub mod error;

pub use agent::{BootAgent, BootOutcome, load_payload};
pub use client::{DiscoveryClient, PeerAddress};
pub use error::{DiscoveryError, DiscoveryResult};
