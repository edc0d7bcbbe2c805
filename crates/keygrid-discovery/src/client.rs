//! The `join` query.

use std::sync::Arc;
use std::time::Duration;

use keygrid_cloud::{Caller, CloudProvider};
use keygrid_core::{DiscoveryTag, RetryPolicy};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{DiscoveryError, DiscoveryResult};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerAddress {
    pub instance_id: String,
    pub address: String,
}

/// Discovery from the point of view of one instance.
pub struct DiscoveryClient {
    cloud: Arc<dyn CloudProvider>,
    caller: Caller,
    instance_id: String,
    retry: RetryPolicy,
    max_wait: Option<Duration>,
}

impl DiscoveryClient {
    pub fn new(
        cloud: Arc<dyn CloudProvider>,
        instance_id: impl Into<String>,
        role: impl Into<String>,
        retry: RetryPolicy,
    ) -> Self {
        let instance_id = instance_id.into();
        Self {
            cloud,
            caller: Caller::Instance {
                instance_id: instance_id.clone(),
                role: role.into(),
            },
            instance_id,
            retry,
            max_wait: None,
        }
    }

    /// Give up once the next backoff would run past `max_wait`.
    pub fn with_max_wait(mut self, max_wait: Duration) -> Self {
        self.max_wait = Some(max_wait);
        self
    }

    /// Active peers carrying `tag`, excluding this instance.
    ///
    /// An empty list is a valid answer. Peers still booting are included.
    /// Anything carrying the tag is returned, whichever fleet it belongs to.
    pub async fn join(&self, tag: &DiscoveryTag) -> DiscoveryResult<Vec<PeerAddress>> {
        let attempts = self.retry.attempts();
        let started = Instant::now();
        let mut attempt = 1;

        loop {
            let error = match self.cloud.list_instances(&self.caller, tag).await {
                Ok(instances) => {
                    let peers: Vec<PeerAddress> = instances
                        .into_iter()
                        .filter(|i| i.is_active() && i.id != self.instance_id)
                        .map(|i| PeerAddress {
                            instance_id: i.id,
                            address: i.address,
                        })
                        .collect();
                    info!(instance = %self.instance_id, %tag, peers = peers.len(), attempt, "cluster discovered");
                    return Ok(peers);
                }
                Err(e) if !e.is_retryable() => return Err(DiscoveryError::Cloud(e)),
                Err(e) => e,
            };

            let delay = self.retry.backoff_for(attempt);
            let out_of_time = self
                .max_wait
                .is_some_and(|max| started.elapsed() + delay > max);
            if attempt >= attempts || out_of_time {
                warn!(instance = %self.instance_id, %tag, attempts = attempt, error = %error, "discovery gave up");
                return Err(DiscoveryError::Timeout {
                    tag: tag.to_string(),
                    attempts: attempt,
                    last_error: error,
                });
            }

            if error.is_authorization() {
                debug!(instance = %self.instance_id, %tag, attempt, "list not yet permitted, waiting for grant");
            } else {
                debug!(instance = %self.instance_id, %tag, attempt, error = %error, "list failed, retrying");
            }
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keygrid_cloud::{CloudError, LaunchRequest, SimulatedCloud};
    use keygrid_core::{BootPayload, BootPolicy, GrantAction, Instance, PermissionGrant};
    use std::collections::BTreeMap;

    fn tag() -> DiscoveryTag {
        DiscoveryTag::new("consul-cluster", "prod")
    }

    fn retry(attempts: u32) -> RetryPolicy {
        RetryPolicy::new(attempts, Duration::from_secs(1), Duration::from_secs(8))
    }

    async fn launch(cloud: &SimulatedCloud, role: &str, zone: &str, tag: &DiscoveryTag) -> Instance {
        let payload = BootPayload::new(role, tag, BootPolicy::ProceedEmpty, retry(3), "run".into());
        let mut tags = BTreeMap::new();
        tags.insert(tag.key.clone(), tag.value.clone());
        cloud
            .launch_instance(LaunchRequest {
                role: role.to_string(),
                zone: zone.to_string(),
                image_id: "ami".to_string(),
                instance_class: "small".to_string(),
                payload,
                tags,
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn first_node_finds_no_peers() {
        let cloud = Arc::new(SimulatedCloud::new());
        let me = launch(&cloud, "consul", "a", &tag()).await;
        let client = DiscoveryClient::new(cloud.clone(), &me.id, "consul", retry(3));
        assert!(client.join(&tag()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn join_excludes_self_by_id_even_on_address_reuse() {
        let cloud = Arc::new(SimulatedCloud::new());
        let old = launch(&cloud, "consul", "a", &tag()).await;
        let peer = launch(&cloud, "consul", "a", &tag()).await;
        cloud.terminate_instance(&old.id).await.unwrap();
        let me = launch(&cloud, "consul", "a", &tag()).await;
        assert_eq!(me.address, old.address);

        let client = DiscoveryClient::new(cloud.clone(), &me.id, "consul", retry(3));
        let peers = client.join(&tag()).await.unwrap();
        assert_eq!(
            peers,
            vec![PeerAddress {
                instance_id: peer.id,
                address: peer.address,
            }]
        );
    }

    #[tokio::test]
    async fn booting_peers_are_included() {
        let cloud = Arc::new(SimulatedCloud::new());
        let a = launch(&cloud, "consul", "a", &tag()).await;
        let me = launch(&cloud, "consul", "b", &tag()).await;
        cloud.mark_all_ready();
        let _booting = launch(&cloud, "consul", "a", &tag()).await;

        let client = DiscoveryClient::new(cloud.clone(), &me.id, "consul", retry(3));
        let peers = client.join(&tag()).await.unwrap();
        assert_eq!(peers.len(), 2);
        assert!(peers.iter().any(|p| p.instance_id == a.id));
    }

    #[tokio::test(start_paused = true)]
    async fn waits_for_grant_to_propagate() {
        let cloud = Arc::new(SimulatedCloud::new().with_grant_delay(Duration::from_secs(5)));
        let consul_tag = tag();
        let vault_tag = DiscoveryTag::new("keygrid-cluster", "prod-vault");
        launch(&cloud, "consul", "a", &consul_tag).await;
        let vault = launch(&cloud, "vault", "a", &vault_tag).await;
        cloud
            .put_grant(&PermissionGrant {
                grantor: "consul".into(),
                grantee: "vault".into(),
                action: GrantAction::ListInstances,
                scope: consul_tag.clone(),
            })
            .await
            .unwrap();

        let client = DiscoveryClient::new(cloud.clone(), &vault.id, "vault", retry(5));
        let peers = client.join(&consul_tag).await.unwrap();
        assert_eq!(peers.len(), 1);
        // 1s + 2s + 4s of backoff crosses the 5s propagation delay.
        assert_eq!(cloud.calls().lists, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_grant_times_out() {
        let cloud = Arc::new(SimulatedCloud::new());
        launch(&cloud, "consul", "a", &tag()).await;
        let vault = launch(&cloud, "vault", "a", &DiscoveryTag::new("k", "vault")).await;

        let client = DiscoveryClient::new(cloud.clone(), &vault.id, "vault", retry(3));
        match client.join(&tag()).await {
            Err(DiscoveryError::Timeout { attempts, last_error, .. }) => {
                assert_eq!(attempts, 3);
                assert!(last_error.is_authorization());
            }
            other => panic!("expected timeout, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn max_wait_bounds_the_budget() {
        let cloud = Arc::new(SimulatedCloud::new());
        let vault = launch(&cloud, "vault", "a", &DiscoveryTag::new("k", "vault")).await;
        let client = DiscoveryClient::new(cloud.clone(), &vault.id, "vault", retry(100))
            .with_max_wait(Duration::from_secs(10));

        let started = Instant::now();
        let err = client.join(&tag()).await.unwrap_err();
        assert!(matches!(err, DiscoveryError::Timeout { .. }));
        assert!(started.elapsed() <= Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn throttling_is_retried() {
        let cloud = Arc::new(SimulatedCloud::new());
        let me = launch(&cloud, "consul", "a", &tag()).await;
        cloud.throttle_next_lists(2);
        let client = DiscoveryClient::new(cloud.clone(), &me.id, "consul", retry(3));
        assert!(client.join(&tag()).await.is_ok());
    }

    #[tokio::test]
    async fn non_retryable_errors_fail_immediately() {
        struct Broken;

        #[async_trait::async_trait]
        impl CloudProvider for Broken {
            async fn launch_instance(&self, _: LaunchRequest) -> keygrid_cloud::CloudResult<Instance> {
                unreachable!()
            }
            async fn list_instances(&self, _: &Caller, _: &DiscoveryTag) -> keygrid_cloud::CloudResult<Vec<Instance>> {
                Err(CloudError::Snapshot("corrupt".into()))
            }
            async fn terminate_instance(&self, _: &str) -> keygrid_cloud::CloudResult<()> {
                unreachable!()
            }
            async fn ensure_front(&self, _: &keygrid_core::FrontSpec) -> keygrid_cloud::CloudResult<keygrid_cloud::FrontHandle> {
                unreachable!()
            }
            async fn register_backends(&self, _: &str, _: &[keygrid_cloud::BackendTarget]) -> keygrid_cloud::CloudResult<()> {
                unreachable!()
            }
            async fn upsert_dns_record(&self, _: &keygrid_cloud::DnsRecord) -> keygrid_cloud::CloudResult<keygrid_cloud::DnsChange> {
                unreachable!()
            }
            async fn put_grant(&self, _: &PermissionGrant) -> keygrid_cloud::CloudResult<bool> {
                unreachable!()
            }
            async fn list_grants(&self) -> keygrid_cloud::CloudResult<Vec<PermissionGrant>> {
                unreachable!()
            }
        }

        let client = DiscoveryClient::new(Arc::new(Broken), "i-1", "consul", retry(5));
        assert!(matches!(
            client.join(&tag()).await,
            Err(DiscoveryError::Cloud(CloudError::Snapshot(_)))
        ));
    }
}
