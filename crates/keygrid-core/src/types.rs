//! Domain types shared across keygrid crates.
//!
//! These describe roles, the instances that realize them, the boot payload
//! handed to each instance, permission grants, and the load balancer front.
//! All of them are serializable so they can be persisted by
//! `keygrid-state` and shipped to nodes as JSON.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::retry::RetryPolicy;

/// Cloud-assigned instance identifier.
pub type InstanceId = String;

/// Name of a role (e.g. `"coordination"`, `"secret-store"`).
pub type RoleName = String;

/// Tag key every instance carries with its fleet identity, `{cluster}/{role}`.
///
/// The provisioner lists a fleet through this tag; nodes never use it.
pub const ROLE_TAG_KEY: &str = "keygrid:role";

// ── Discovery ──────────────────────────────────────────────────────

/// A `(key, value)` tag shared by every instance of one logical cluster.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DiscoveryTag {
    pub key: String,
    pub value: String,
}

impl DiscoveryTag {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }

    /// The tag every instance of `role` in `cluster` carries for fleet
    /// membership.
    pub fn for_fleet(cluster: &str, role: &str) -> Self {
        Self::new(ROLE_TAG_KEY, format!("{cluster}/{role}"))
    }

    pub fn is_empty(&self) -> bool {
        self.key.trim().is_empty() || self.value.trim().is_empty()
    }
}

impl fmt::Display for DiscoveryTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.key, self.value)
    }
}

// ── Roles ──────────────────────────────────────────────────────────

/// Which half of the deployment a role belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoleKind {
    Coordination,
    SecretStore,
}

impl RoleKind {
    pub fn label(&self) -> &'static str {
        match self {
            RoleKind::Coordination => "coordination",
            RoleKind::SecretStore => "secret_store",
        }
    }
}

/// What a node does when discovery exhausts its retry budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BootPolicy {
    /// Start the service with an empty peer list.
    #[default]
    ProceedEmpty,
    /// Abort the boot sequence.
    Halt,
}

impl BootPolicy {
    pub fn label(&self) -> &'static str {
        match self {
            BootPolicy::ProceedEmpty => "proceed_empty",
            BootPolicy::Halt => "halt",
        }
    }
}

/// A fully resolved role: everything needed to launch one of its instances.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Role {
    pub name: RoleName,
    /// Name of the cluster this role belongs to.
    pub cluster: String,
    pub kind: RoleKind,
    pub desired_size: u32,
    pub instance_class: String,
    /// Machine image resolved from the image registry.
    pub image_id: String,
    /// Placement zones, in preference order.
    pub zones: Vec<String>,
    pub discovery_tag: DiscoveryTag,
    /// Boot script template with `{{ name }}` placeholders.
    pub payload_template: String,
    /// Role-level template bindings.
    pub params: BTreeMap<String, String>,
    pub boot_policy: BootPolicy,
    /// Retry budget the node uses for discovery at boot.
    pub discovery_retry: RetryPolicy,
}

impl Role {
    /// Fleet membership tag. Unique per cluster, so fleets of the same
    /// role name in different clusters never see each other.
    pub fn fleet_tag(&self) -> DiscoveryTag {
        DiscoveryTag::for_fleet(&self.cluster, &self.name)
    }

    /// Tags applied to every instance launched for this role.
    pub fn instance_tags(&self) -> BTreeMap<String, String> {
        let mut tags = BTreeMap::new();
        let fleet = self.fleet_tag();
        tags.insert(fleet.key, fleet.value);
        tags.insert(
            self.discovery_tag.key.clone(),
            self.discovery_tag.value.clone(),
        );
        tags
    }
}

// ── Instances ──────────────────────────────────────────────────────

/// Lifecycle state reported by the cloud provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Pending,
    Running,
    ShuttingDown,
    Terminated,
    Stopped,
}

/// Infrastructure-level status check (VM/process liveness).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusCheck {
    Initializing,
    Ok,
    Impaired,
}

/// An instance as observed through the cloud provider's listing API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instance {
    pub id: InstanceId,
    pub role: RoleName,
    /// Private network address. May be reused after termination.
    pub address: String,
    pub zone: String,
    pub image_id: String,
    pub instance_class: String,
    /// Digest of the boot payload this instance was launched with.
    pub payload_digest: String,
    pub tags: BTreeMap<String, String>,
    pub state: LifecycleState,
    pub status_check: StatusCheck,
    /// Launch time (unix seconds).
    pub launched_at: u64,
}

impl Instance {
    /// Pending or running; anything else is on its way out.
    pub fn is_active(&self) -> bool {
        matches!(self.state, LifecycleState::Pending | LifecycleState::Running)
    }

    pub fn has_tag(&self, tag: &DiscoveryTag) -> bool {
        self.tags.get(&tag.key) == Some(&tag.value)
    }
}

// ── Boot payload ───────────────────────────────────────────────────

/// Configuration handed to an instance at first boot.
///
/// The digest covers every other field, so two payloads with equal digests
/// describe the same instance generation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BootPayload {
    pub role: RoleName,
    pub cluster_tag_key: String,
    pub cluster_tag_value: String,
    pub boot_policy: BootPolicy,
    pub discovery_retry: RetryPolicy,
    pub script: String,
    pub digest: String,
}

impl BootPayload {
    pub fn new(
        role: &str,
        tag: &DiscoveryTag,
        boot_policy: BootPolicy,
        discovery_retry: RetryPolicy,
        script: String,
    ) -> Self {
        let digest = payload_digest(role, tag, boot_policy, &discovery_retry, &script);
        Self {
            role: role.to_string(),
            cluster_tag_key: tag.key.clone(),
            cluster_tag_value: tag.value.clone(),
            boot_policy,
            discovery_retry,
            script,
            digest,
        }
    }

    pub fn tag(&self) -> DiscoveryTag {
        DiscoveryTag::new(&self.cluster_tag_key, &self.cluster_tag_value)
    }

    /// Whether the stored digest matches the payload contents.
    pub fn verify(&self) -> bool {
        let expected = payload_digest(
            &self.role,
            &self.tag(),
            self.boot_policy,
            &self.discovery_retry,
            &self.script,
        );
        expected == self.digest
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    pub fn from_json(s: &str) -> serde_json::Result<Self> {
        serde_json::from_str(s)
    }
}

fn payload_digest(
    role: &str,
    tag: &DiscoveryTag,
    boot_policy: BootPolicy,
    retry: &RetryPolicy,
    script: &str,
) -> String {
    let mut hasher = Sha256::new();
    for part in [
        role,
        tag.key.as_str(),
        tag.value.as_str(),
        boot_policy.label(),
        &retry.max_attempts.to_string(),
        &retry.initial_backoff.as_millis().to_string(),
        &retry.max_backoff.as_millis().to_string(),
        script,
    ] {
        hasher.update(part.as_bytes());
        hasher.update([0u8]);
    }
    hex::encode(hasher.finalize())
}

// ── Permissions ────────────────────────────────────────────────────

/// Actions a grant can permit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GrantAction {
    /// List instances carrying the grant's scope tag.
    ListInstances,
}

impl GrantAction {
    pub fn label(&self) -> &'static str {
        match self {
            GrantAction::ListInstances => "list_instances",
        }
    }
}

/// Permission for one role's instances to act on another role's scope.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PermissionGrant {
    pub grantor: RoleName,
    pub grantee: RoleName,
    pub action: GrantAction,
    pub scope: DiscoveryTag,
}

impl PermissionGrant {
    /// Composite key used for storage and deduplication.
    pub fn key(&self) -> String {
        format!("{}:{}:{}", self.grantee, self.action.label(), self.scope)
    }

    pub fn permits(&self, grantee: &str, action: GrantAction, scope: &DiscoveryTag) -> bool {
        self.grantee == grantee && self.action == action && &self.scope == scope
    }
}

// ── Load balancer front ────────────────────────────────────────────

/// Application-level probe settings for the front.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbeSpec {
    /// HTTP path to probe (e.g. `/v1/sys/health`).
    pub path: String,
    pub interval: Duration,
    pub timeout: Duration,
    /// Consecutive failures before a backend is marked unhealthy.
    pub unhealthy_threshold: u32,
    /// Consecutive successes before a backend is marked healthy again.
    pub healthy_threshold: u32,
}

/// Stable DNS name bound to the front's address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DnsBinding {
    pub zone: String,
    pub name: String,
    pub ttl: u32,
}

/// Declarative description of the load balancer front.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrontSpec {
    pub name: String,
    pub listener_port: u16,
    pub backend_port: u16,
    /// CIDR blocks allowed to reach the listener. Always operator supplied.
    pub allowed_cidrs: Vec<String>,
    pub health: ProbeSpec,
    pub dns: Option<DnsBinding>,
}
