//! The provider trait and the request/record types it speaks.

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use keygrid_core::{BootPayload, DiscoveryTag, FrontSpec, Instance, PermissionGrant, RoleName};
use serde::{Deserialize, Serialize};

use crate::error::CloudResult;

/// Who is making a call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Caller {
    /// The orchestrator's own credentials. Unrestricted.
    Orchestrator,
    /// A running instance using the credentials of its role.
    Instance { instance_id: String, role: RoleName },
}

impl fmt::Display for Caller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Caller::Orchestrator => f.write_str("orchestrator"),
            Caller::Instance { instance_id, role } => write!(f, "instance {instance_id} ({role})"),
        }
    }
}

/// Everything needed to launch one instance.
#[derive(Debug, Clone, PartialEq)]
pub struct LaunchRequest {
    pub role: RoleName,
    pub zone: String,
    pub image_id: String,
    pub instance_class: String,
    pub payload: BootPayload,
    pub tags: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrontHandle {
    pub name: String,
    /// Stable address clients connect to.
    pub address: String,
}

/// One backend registered behind a front.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BackendTarget {
    pub instance_id: String,
    pub address: String,
    pub port: u16,
}

impl BackendTarget {
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DnsRecord {
    pub zone: String,
    pub name: String,
    pub target: String,
    pub ttl: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DnsChange {
    Created,
    Updated,
    Unchanged,
}

/// Infrastructure operations keygrid needs from a cloud.
#[async_trait]
pub trait CloudProvider: Send + Sync {
    /// Launch one instance. The returned record is as the cloud first reports it.
    async fn launch_instance(&self, request: LaunchRequest) -> CloudResult<Instance>;

    /// List instances carrying `tag`, in any lifecycle state.
    async fn list_instances(&self, caller: &Caller, tag: &DiscoveryTag) -> CloudResult<Vec<Instance>>;

    /// Terminate an instance. Terminating an already terminated instance succeeds.
    async fn terminate_instance(&self, instance_id: &str) -> CloudResult<()>;

    /// Create the front if absent, otherwise update its listener settings.
    async fn ensure_front(&self, spec: &FrontSpec) -> CloudResult<FrontHandle>;

    /// Replace the front's backend set.
    async fn register_backends(&self, front: &str, backends: &[BackendTarget]) -> CloudResult<()>;

    async fn upsert_dns_record(&self, record: &DnsRecord) -> CloudResult<DnsChange>;

    /// Store a grant. Returns false when an identical grant already exists.
    async fn put_grant(&self, grant: &PermissionGrant) -> CloudResult<bool>;

    async fn list_grants(&self) -> CloudResult<Vec<PermissionGrant>>;
}
