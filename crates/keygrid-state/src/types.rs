//! Deployment progress records.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// The ordered steps of a deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeployStep {
    ResolveImages,
    RenderPayloads,
    ProvisionCoordination,
    BindPermissions,
    ProvisionSecretStore,
    AttachFront,
    PublishDns,
}

impl DeployStep {
    pub const ALL: [DeployStep; 7] = [
        DeployStep::ResolveImages,
        DeployStep::RenderPayloads,
        DeployStep::ProvisionCoordination,
        DeployStep::BindPermissions,
        DeployStep::ProvisionSecretStore,
        DeployStep::AttachFront,
        DeployStep::PublishDns,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            DeployStep::ResolveImages => "resolve_images",
            DeployStep::RenderPayloads => "render_payloads",
            DeployStep::ProvisionCoordination => "provision_coordination",
            DeployStep::BindPermissions => "bind_permissions",
            DeployStep::ProvisionSecretStore => "provision_secret_store",
            DeployStep::AttachFront => "attach_front",
            DeployStep::PublishDns => "publish_dns",
        }
    }

    /// Whether a failure at this step leaves cloud resources behind.
    pub fn creates_resources(&self) -> bool {
        *self >= DeployStep::ProvisionCoordination
    }
}

impl std::fmt::Display for DeployStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentStatus {
    InProgress,
    Completed,
    Halted,
}

/// Persisted progress of one `apply`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentRecord {
    pub cluster: String,
    pub status: DeploymentStatus,
    pub completed_steps: Vec<DeployStep>,
    pub last_completed: Option<DeployStep>,
    pub halted_at: Option<DeployStep>,
    pub error: Option<String>,
    pub started_at: u64,
    pub updated_at: u64,
}

impl DeploymentRecord {
    pub fn start(cluster: &str) -> Self {
        let now = epoch_secs();
        Self {
            cluster: cluster.to_string(),
            status: DeploymentStatus::InProgress,
            completed_steps: Vec::new(),
            last_completed: None,
            halted_at: None,
            error: None,
            started_at: now,
            updated_at: now,
        }
    }

    pub fn complete_step(&mut self, step: DeployStep) {
        if !self.completed_steps.contains(&step) {
            self.completed_steps.push(step);
        }
        self.last_completed = Some(step);
        self.updated_at = epoch_secs();
    }

    pub fn halt(&mut self, step: DeployStep, error: impl Into<String>) {
        self.status = DeploymentStatus::Halted;
        self.halted_at = Some(step);
        self.error = Some(error.into());
        self.updated_at = epoch_secs();
    }

    pub fn finish(&mut self) {
        self.status = DeploymentStatus::Completed;
        self.updated_at = epoch_secs();
    }

    pub fn is_complete(&self) -> bool {
        self.status == DeploymentStatus::Completed
    }
}

pub fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}
