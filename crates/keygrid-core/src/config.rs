//! keygrid.toml manifest parser.
//!
//! The manifest is the declarative description of a deployment: the image
//! catalog, the two roles, and the load balancer front. Durations are
//! human strings (`"5s"`, `"500ms"`); they are validated when the manifest
//! is loaded so that a bad value fails before anything is provisioned.

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::duration::parse_duration;
use crate::image::{ImageCatalog, ImageSelector, MachineImage};
use crate::retry::RetryPolicy;
use crate::types::{BootPolicy, DiscoveryTag, DnsBinding, FrontSpec, ProbeSpec, Role, RoleKind};

/// Tag key used when a role does not name its own.
pub const DEFAULT_TAG_KEY: &str = "keygrid-cluster";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse manifest: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid duration for {field}: {value:?}")]
    InvalidDuration { field: String, value: String },

    #[error("role {0} has neither `template` nor `template_path`")]
    MissingTemplate(String),

    #[error("roles {first} and {second} share discovery tag {tag}")]
    TagCollision {
        first: String,
        second: String,
        tag: String,
    },

    #[error("front {0} has no allowed_cidrs; network access scope must be set explicitly")]
    NoAllowedCidrs(String),

    #[error("invalid CIDR block: {0}")]
    InvalidCidr(String),

    #[error("invalid manifest: {0}")]
    Invalid(String),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub cluster: ClusterConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub images: Vec<MachineImage>,
    pub roles: RolesConfig,
    pub front: FrontConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    pub name: String,
    /// Template bindings shared by every role.
    #[serde(default)]
    pub params: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff: String,
    #[serde(default = "default_max_backoff")]
    pub max_backoff: String,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff: default_initial_backoff(),
            max_backoff: default_max_backoff(),
        }
    }
}

impl RetryConfig {
    pub fn to_policy(&self, field: &str) -> ConfigResult<RetryPolicy> {
        Ok(RetryPolicy::new(
            self.max_attempts,
            duration_field(&format!("{field}.initial_backoff"), &self.initial_backoff)?,
            duration_field(&format!("{field}.max_backoff"), &self.max_backoff)?,
        ))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RolesConfig {
    pub coordination: RoleConfig,
    pub secret_store: RoleConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoleConfig {
    pub name: String,
    pub size: u32,
    pub instance_class: String,
    pub zones: Vec<String>,
    pub image: ImageSelector,
    pub tag_key: Option<String>,
    pub tag_value: Option<String>,
    /// Inline boot script template.
    pub template: Option<String>,
    /// Template file, relative to the manifest.
    pub template_path: Option<PathBuf>,
    #[serde(default)]
    pub params: BTreeMap<String, String>,
    #[serde(default)]
    pub boot_policy: BootPolicy,
    #[serde(default)]
    pub discovery_retry: RetryConfig,
}

impl RoleConfig {
    /// The tag this role's instances are discoverable under.
    ///
    /// Defaults to `keygrid-cluster = {cluster}-{role}`.
    pub fn discovery_tag(&self, cluster: &str) -> DiscoveryTag {
        let key = self
            .tag_key
            .clone()
            .unwrap_or_else(|| DEFAULT_TAG_KEY.to_string());
        let value = self
            .tag_value
            .clone()
            .unwrap_or_else(|| format!("{cluster}-{}", self.name));
        DiscoveryTag::new(key, value)
    }

    /// Build the resolved role once its image id is known.
    pub fn resolve(&self, kind: RoleKind, cluster: &str, image_id: &str) -> ConfigResult<Role> {
        let template = self
            .template
            .clone()
            .ok_or_else(|| ConfigError::MissingTemplate(self.name.clone()))?;
        Ok(Role {
            name: self.name.clone(),
            cluster: cluster.to_string(),
            kind,
            desired_size: self.size,
            instance_class: self.instance_class.clone(),
            image_id: image_id.to_string(),
            zones: self.zones.clone(),
            discovery_tag: self.discovery_tag(cluster),
            payload_template: template,
            params: self.params.clone(),
            boot_policy: self.boot_policy,
            discovery_retry: self
                .discovery_retry
                .to_policy(&format!("roles.{}.discovery_retry", kind.label()))?,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrontConfig {
    pub name: String,
    pub listener_port: u16,
    pub backend_port: u16,
    #[serde(default)]
    pub allowed_cidrs: Vec<String>,
    #[serde(default)]
    pub health: ProbeConfig,
    pub dns: Option<DnsBinding>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeConfig {
    #[serde(default = "default_probe_path")]
    pub path: String,
    #[serde(default = "default_probe_interval")]
    pub interval: String,
    #[serde(default = "default_probe_timeout")]
    pub timeout: String,
    #[serde(default = "default_threshold")]
    pub unhealthy_threshold: u32,
    #[serde(default = "default_threshold")]
    pub healthy_threshold: u32,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            path: default_probe_path(),
            interval: default_probe_interval(),
            timeout: default_probe_timeout(),
            unhealthy_threshold: default_threshold(),
            healthy_threshold: default_threshold(),
        }
    }
}

impl Manifest {
    /// Load a manifest, resolving template files relative to its directory.
    pub fn from_file(path: &Path) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut manifest: Manifest = toml::from_str(&content)?;
        let base = path.parent().unwrap_or_else(|| Path::new("."));
        manifest.load_templates(base)?;
        manifest.validate()?;
        Ok(manifest)
    }

    /// Parse a manifest from a string. Template paths resolve against `base`.
    pub fn from_toml_str(content: &str, base: &Path) -> ConfigResult<Self> {
        let mut manifest: Manifest = toml::from_str(content)?;
        manifest.load_templates(base)?;
        manifest.validate()?;
        Ok(manifest)
    }

    /// Both roles, coordination first.
    pub fn role_configs(&self) -> [(RoleKind, &RoleConfig); 2] {
        [
            (RoleKind::Coordination, &self.roles.coordination),
            (RoleKind::SecretStore, &self.roles.secret_store),
        ]
    }

    pub fn role_config(&self, kind: RoleKind) -> &RoleConfig {
        match kind {
            RoleKind::Coordination => &self.roles.coordination,
            RoleKind::SecretStore => &self.roles.secret_store,
        }
    }

    pub fn image_catalog(&self) -> ImageCatalog {
        ImageCatalog::new(self.images.clone())
    }

    pub fn retry_policy(&self) -> ConfigResult<RetryPolicy> {
        self.retry.to_policy("retry")
    }

    pub fn front_spec(&self) -> ConfigResult<FrontSpec> {
        let health = &self.front.health;
        Ok(FrontSpec {
            name: self.front.name.clone(),
            listener_port: self.front.listener_port,
            backend_port: self.front.backend_port,
            allowed_cidrs: self.front.allowed_cidrs.clone(),
            health: ProbeSpec {
                path: health.path.clone(),
                interval: duration_field("front.health.interval", &health.interval)?,
                timeout: duration_field("front.health.timeout", &health.timeout)?,
                unhealthy_threshold: health.unhealthy_threshold.max(1),
                healthy_threshold: health.healthy_threshold.max(1),
            },
            dns: self.front.dns.clone(),
        })
    }

    fn load_templates(&mut self, base: &Path) -> ConfigResult<()> {
        for role in [&mut self.roles.coordination, &mut self.roles.secret_store] {
            if role.template.is_some() {
                continue;
            }
            if let Some(rel) = &role.template_path {
                let path = base.join(rel);
                let content = std::fs::read_to_string(&path)
                    .map_err(|source| ConfigError::Io { path, source })?;
                role.template = Some(content);
            }
        }
        Ok(())
    }

    /// Check everything that can be checked without touching the cloud.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.cluster.name.trim().is_empty() {
            return Err(ConfigError::Invalid("cluster.name is empty".into()));
        }
        self.retry_policy()?;

        let coordination = &self.roles.coordination;
        let secret_store = &self.roles.secret_store;
        if coordination.name == secret_store.name {
            return Err(ConfigError::Invalid(format!(
                "both roles are named {}",
                coordination.name
            )));
        }

        for (kind, role) in self.role_configs() {
            if role.name.trim().is_empty() {
                return Err(ConfigError::Invalid(format!("roles.{}.name is empty", kind.label())));
            }
            if role.zones.is_empty() {
                return Err(ConfigError::Invalid(format!("role {} has no zones", role.name)));
            }
            if role.template.is_none() {
                return Err(ConfigError::MissingTemplate(role.name.clone()));
            }
            role.discovery_retry
                .to_policy(&format!("roles.{}.discovery_retry", kind.label()))?;
        }

        let a = coordination.discovery_tag(&self.cluster.name);
        let b = secret_store.discovery_tag(&self.cluster.name);
        if a.is_empty() || b.is_empty() {
            return Err(ConfigError::Invalid("discovery tags must be non-empty".into()));
        }
        if a == b {
            return Err(ConfigError::TagCollision {
                first: coordination.name.clone(),
                second: secret_store.name.clone(),
                tag: a.to_string(),
            });
        }

        if self.front.allowed_cidrs.is_empty() {
            return Err(ConfigError::NoAllowedCidrs(self.front.name.clone()));
        }
        for cidr in &self.front.allowed_cidrs {
            validate_cidr(cidr)?;
        }
        self.front_spec()?;
        Ok(())
    }
}

/// Accept `addr/prefix` with a prefix that fits the address family.
pub fn validate_cidr(cidr: &str) -> ConfigResult<()> {
    let (addr, prefix) = cidr
        .split_once('/')
        .ok_or_else(|| ConfigError::InvalidCidr(cidr.to_string()))?;
    let addr: IpAddr = addr
        .parse()
        .map_err(|_| ConfigError::InvalidCidr(cidr.to_string()))?;
    let prefix: u8 = prefix
        .parse()
        .map_err(|_| ConfigError::InvalidCidr(cidr.to_string()))?;
    let max = if addr.is_ipv4() { 32 } else { 128 };
    if prefix > max {
        return Err(ConfigError::InvalidCidr(cidr.to_string()));
    }
    Ok(())
}

fn duration_field(field: &str, value: &str) -> ConfigResult<std::time::Duration> {
    parse_duration(value).ok_or_else(|| ConfigError::InvalidDuration {
        field: field.to_string(),
        value: value.to_string(),
    })
}

fn default_max_attempts() -> u32 {
    4
}

fn default_initial_backoff() -> String {
    "1s".to_string()
}

fn default_max_backoff() -> String {
    "30s".to_string()
}

fn default_probe_path() -> String {
    "/v1/sys/health".to_string()
}

fn default_probe_interval() -> String {
    "5s".to_string()
}

fn default_probe_timeout() -> String {
    "2s".to_string()
}

fn default_threshold() -> u32 {
    2
}
