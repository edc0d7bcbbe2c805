//! The deployment state machine.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use keygrid_cloud::{BackendTarget, CloudProvider, DnsChange};
use keygrid_core::{
    BootPayload, FrontSpec, GrantAction, ImageRegistry, Manifest, Role, RoleKind, render,
};
use keygrid_front::LoadBalancerFront;
use keygrid_health::{ApplicationHealth, StatusCheckHealth};
use keygrid_provision::{FleetProvisioner, FleetReport, ProvisionResult};
use keygrid_state::{DeployStep, DeploymentRecord, StateStore};
use tracing::{debug, error, info, warn};

use crate::binder::{GrantOutcome, PermissionBinder};
use crate::error::{OrchestratorError, OrchestratorResult};

/// Everything derivable from the manifest without touching the cloud.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedDeployment {
    pub coordination: Role,
    pub secret_store: Role,
    pub coordination_payload: BootPayload,
    pub secret_store_payload: BootPayload,
    pub front: FrontSpec,
}

impl ResolvedDeployment {
    pub fn role(&self, kind: RoleKind) -> &Role {
        match kind {
            RoleKind::Coordination => &self.coordination,
            RoleKind::SecretStore => &self.secret_store,
        }
    }

    pub fn payload(&self, kind: RoleKind) -> &BootPayload {
        match kind {
            RoleKind::Coordination => &self.coordination_payload,
            RoleKind::SecretStore => &self.secret_store_payload,
        }
    }
}

/// Outcome of a successful [`Orchestrator::apply`].
#[derive(Debug, Clone)]
pub struct DeploymentReport {
    pub cluster: String,
    pub coordination: FleetReport,
    pub grant: GrantOutcome,
    pub secret_store: FleetReport,
    pub front_address: String,
    pub backends: Vec<BackendTarget>,
    /// `None` when no DNS binding is configured.
    pub dns: Option<DnsChange>,
}

/// Outcome of one [`Orchestrator::reconcile_all`] pass. Each fleet's result
/// stands on its own.
#[derive(Debug)]
pub struct ReconcileReport {
    pub coordination: ProvisionResult<FleetReport>,
    pub secret_store: ProvisionResult<FleetReport>,
    pub backends: Vec<BackendTarget>,
}

impl ReconcileReport {
    pub fn is_noop(&self) -> bool {
        [&self.coordination, &self.secret_store]
            .iter()
            .all(|r| r.as_ref().is_ok_and(|report| report.is_noop()))
    }
}

pub struct Orchestrator {
    manifest: Manifest,
    registry: Arc<dyn ImageRegistry>,
    provisioner: FleetProvisioner,
    binder: PermissionBinder,
    front: Arc<LoadBalancerFront>,
    store: StateStore,
}

impl Orchestrator {
    /// Build an orchestrator for `manifest`. Images resolve against the
    /// manifest's own catalog unless [`with_registry`](Self::with_registry)
    /// replaces it.
    pub fn new(
        manifest: Manifest,
        cloud: Arc<dyn CloudProvider>,
        probe: Arc<dyn ApplicationHealth>,
        store: StateStore,
    ) -> OrchestratorResult<Self> {
        let retry = manifest.retry_policy()?;
        let front_spec = manifest.front_spec()?;
        let provisioner = FleetProvisioner::new(cloud.clone(), Arc::new(StatusCheckHealth), retry);

        Ok(Self {
            registry: Arc::new(manifest.image_catalog()),
            provisioner,
            binder: PermissionBinder::new(cloud.clone(), retry),
            front: Arc::new(LoadBalancerFront::new(front_spec, cloud, probe).with_retry_policy(retry)),
            store,
            manifest,
        })
    }

    pub fn with_registry(mut self, registry: Arc<dyn ImageRegistry>) -> Self {
        self.registry = registry;
        self
    }

    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    pub fn front(&self) -> Arc<LoadBalancerFront> {
        Arc::clone(&self.front)
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    /// Resolve images and render payloads. Touches neither the cloud nor
    /// the state store.
    pub fn resolve(&self) -> OrchestratorResult<ResolvedDeployment> {
        resolve_deployment(&self.manifest, self.registry.as_ref())
    }

    /// Run the full deployment.
    pub async fn apply(&self) -> OrchestratorResult<DeploymentReport> {
        let cluster = self.manifest.cluster.name.clone();
        let mut record = DeploymentRecord::start(&cluster);
        self.store.put_deployment(&record)?;
        info!(%cluster, "deployment starting");

        let (coordination, secret_store) = self
            .step(&mut record, DeployStep::ResolveImages, async {
                let roles = resolve_roles(&self.manifest, self.registry.as_ref())?;
                self.store.put_role(&roles.0)?;
                self.store.put_role(&roles.1)?;
                Ok::<_, OrchestratorError>(roles)
            })
            .await?;

        let (coordination_payload, secret_store_payload) = self
            .step(&mut record, DeployStep::RenderPayloads, async {
                let payloads = render_payloads(&self.manifest, &coordination, &secret_store)?;
                self.store.put_payload(&payloads.0)?;
                self.store.put_payload(&payloads.1)?;
                Ok::<_, OrchestratorError>(payloads)
            })
            .await?;

        let coordination_report = self
            .step(&mut record, DeployStep::ProvisionCoordination, async {
                let report = self.provisioner.reconcile_fleet(&coordination, &coordination_payload).await?;
                Ok::<_, OrchestratorError>(report.into_result()?)
            })
            .await?;

        let grant = self
            .step(&mut record, DeployStep::BindPermissions, async {
                let (grant, outcome) = self
                    .binder
                    .grant(
                        &coordination.name,
                        &secret_store.name,
                        GrantAction::ListInstances,
                        &coordination.discovery_tag,
                    )
                    .await?;
                self.store.put_grant(&grant)?;
                Ok::<_, OrchestratorError>(outcome)
            })
            .await?;

        let secret_store_report = self
            .step(&mut record, DeployStep::ProvisionSecretStore, async {
                let report = self.provisioner.reconcile_fleet(&secret_store, &secret_store_payload).await?;
                Ok::<_, OrchestratorError>(report.into_result()?)
            })
            .await?;

        let (front_address, backends) = self
            .step(&mut record, DeployStep::AttachFront, async {
                let handle = self.front.ensure().await?;
                self.store.put_front(self.front.spec())?;
                let backends = self.attach_backends(&secret_store).await?;
                Ok::<_, OrchestratorError>((handle.address, backends))
            })
            .await?;

        let dns = if self.front.spec().dns.is_some() {
            self.step(&mut record, DeployStep::PublishDns, async {
                Ok::<_, OrchestratorError>(self.front.publish_dns().await?)
            })
            .await?
        } else {
            debug!(%cluster, "no dns binding configured");
            None
        };

        record.finish();
        self.store.put_deployment(&record)?;
        info!(%cluster, front = %front_address, backends = backends.len(), "deployment complete");

        Ok(DeploymentReport {
            cluster,
            coordination: coordination_report,
            grant,
            secret_store: secret_store_report,
            front_address,
            backends,
            dns,
        })
    }

    /// One reconciliation pass for both fleets, in parallel, followed by a
    /// refresh of the front's backend set.
    pub async fn reconcile_all(&self) -> OrchestratorResult<ReconcileReport> {
        let resolved = self.resolve()?;

        let (coordination, secret_store) = tokio::join!(
            self.provisioner
                .reconcile_fleet(&resolved.coordination, &resolved.coordination_payload),
            self.provisioner
                .reconcile_fleet(&resolved.secret_store, &resolved.secret_store_payload),
        );
        for (role, result) in [
            (&resolved.coordination.name, &coordination),
            (&resolved.secret_store.name, &secret_store),
        ] {
            if let Err(e) = result {
                warn!(%role, error = %e, "reconcile pass failed");
            }
        }

        if self.front.address().is_none() {
            self.front.ensure().await?;
        }
        let backends = self.attach_backends(&resolved.secret_store).await?;

        Ok(ReconcileReport {
            coordination,
            secret_store,
            backends,
        })
    }

    async fn attach_backends(&self, role: &Role) -> OrchestratorResult<Vec<BackendTarget>> {
        let observed = self.provisioner.observe(role).await?;
        let instances: Vec<_> = observed.into_iter().map(|o| o.instance).collect();
        Ok(self.front.register_backends(&instances).await?)
    }

    /// Run one step, recording its completion or the halt.
    async fn step<T, F>(
        &self,
        record: &mut DeploymentRecord,
        step: DeployStep,
        work: F,
    ) -> OrchestratorResult<T>
    where
        F: Future<Output = OrchestratorResult<T>>,
    {
        debug!(cluster = %record.cluster, %step, "step starting");
        match work.await {
            Ok(value) => {
                record.complete_step(step);
                self.store.put_deployment(record)?;
                info!(cluster = %record.cluster, %step, "step complete");
                Ok(value)
            }
            Err(e) => Err(self.halt(record, step, e)),
        }
    }

    fn halt(
        &self,
        record: &mut DeploymentRecord,
        step: DeployStep,
        cause: OrchestratorError,
    ) -> OrchestratorError {
        record.halt(step, cause.to_string());
        if let Err(e) = self.store.put_deployment(record) {
            warn!(cluster = %record.cluster, error = %e, "failed to persist halted deployment");
        }

        if !step.creates_resources() {
            error!(cluster = %record.cluster, %step, error = %cause, "deployment rejected before any resource was created");
            return cause;
        }
        error!(
            cluster = %record.cluster,
            %step,
            last_completed = ?record.last_completed,
            error = %cause,
            "deployment halted, resources left in place"
        );
        OrchestratorError::PartialDeploymentHalt {
            step,
            last_completed: record.last_completed,
            source: Box::new(cause),
        }
    }
}

/// Everything [`Orchestrator::resolve`] does, without an orchestrator.
pub fn resolve_deployment(
    manifest: &Manifest,
    registry: &dyn ImageRegistry,
) -> OrchestratorResult<ResolvedDeployment> {
    let (coordination, secret_store) = resolve_roles(manifest, registry)?;
    let (coordination_payload, secret_store_payload) =
        render_payloads(manifest, &coordination, &secret_store)?;
    Ok(ResolvedDeployment {
        coordination,
        secret_store,
        coordination_payload,
        secret_store_payload,
        front: manifest.front_spec()?,
    })
}

fn resolve_roles(
    manifest: &Manifest,
    registry: &dyn ImageRegistry,
) -> OrchestratorResult<(Role, Role)> {
    let cluster = &manifest.cluster.name;
    let resolve = |kind: RoleKind| -> OrchestratorResult<Role> {
        let config = manifest.role_config(kind);
        let image = registry.resolve(&config.image)?;
        debug!(role = %config.name, image = %image.id, version = %image.version, "image resolved");
        Ok(config.resolve(kind, cluster, &image.id)?)
    };
    Ok((resolve(RoleKind::Coordination)?, resolve(RoleKind::SecretStore)?))
}

/// Both payloads point at the coordination tag: the secret store's
/// embedded coordination agent joins the coordination cluster.
fn render_payloads(
    manifest: &Manifest,
    coordination: &Role,
    secret_store: &Role,
) -> OrchestratorResult<(BootPayload, BootPayload)> {
    let mut params: BTreeMap<String, String> = manifest.cluster.params.clone();
    params.insert("cluster_name".to_string(), manifest.cluster.name.clone());

    let tag = &coordination.discovery_tag;
    let coordination_payload = render(coordination, tag, &params)?;
    let secret_store_payload = render(secret_store, tag, &params)?;
    Ok((coordination_payload, secret_store_payload))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use keygrid_cloud::SimulatedCloud;
    use keygrid_core::{RenderError, ROLE_TAG_KEY};
    use keygrid_health::ProbeResult;
    use keygrid_provision::ProvisionError;
    use keygrid_state::DeploymentStatus;
    use std::path::Path;

    struct AlwaysHealthy;

    #[async_trait]
    impl ApplicationHealth for AlwaysHealthy {
        async fn probe(&self, _endpoint: &str) -> ProbeResult {
            ProbeResult::Healthy
        }
    }

    const MANIFEST: &str = r#"
[cluster]
name = "prod"
params = { datacenter = "dc1" }

[retry]
max_attempts = 2
initial_backoff = "10ms"
max_backoff = "10ms"

[[images]]
id = "ami-consul-1"
os_family = "ubuntu"
software = "consul"
version = "1.15.2"

[[images]]
id = "ami-vault-1"
os_family = "ubuntu"
software = "vault"
version = "1.13.1"

[roles.coordination]
name = "consul"
size = 3
instance_class = "t3.small"
zones = ["a", "b", "c"]
image = { os_family = "ubuntu", software = "consul", version = "^1.15" }
template = "consul agent -dc {{datacenter}} -retry-join 'tag_key={{cluster_tag_key}} tag_value={{cluster_tag_value}}'"

[roles.secret_store]
name = "vault"
size = 2
instance_class = "t3.medium"
zones = ["a", "b"]
image = { os_family = "ubuntu", software = "vault", version = "^1.13" }
template = "vault server -cluster {{cluster_name}} -consul-tag {{cluster_tag_key}}={{cluster_tag_value}}"

[front]
name = "vault-front"
listener_port = 8200
backend_port = 8200
allowed_cidrs = ["10.0.0.0/8"]

[front.dns]
zone = "example.com"
name = "vault.example.com"
ttl = 60
"#;

    fn manifest() -> Manifest {
        Manifest::from_toml_str(MANIFEST, Path::new(".")).unwrap()
    }

    fn orchestrator(manifest: Manifest, cloud: &Arc<SimulatedCloud>) -> Orchestrator {
        Orchestrator::new(
            manifest,
            cloud.clone(),
            Arc::new(AlwaysHealthy),
            StateStore::open_in_memory().unwrap(),
        )
        .unwrap()
    }

    #[test]
    fn resolve_renders_both_payloads_against_coordination_tag() {
        let cloud = Arc::new(SimulatedCloud::new());
        let orch = orchestrator(manifest(), &cloud);
        let resolved = orch.resolve().unwrap();

        assert_eq!(resolved.coordination.image_id, "ami-consul-1");
        assert_eq!(resolved.secret_store.image_id, "ami-vault-1");
        let consul_tag = &resolved.coordination.discovery_tag;
        assert_eq!(&resolved.coordination_payload.tag(), consul_tag);
        assert_eq!(&resolved.secret_store_payload.tag(), consul_tag);
        assert_ne!(&resolved.secret_store.discovery_tag, consul_tag);
        assert!(resolved.secret_store_payload.script.contains("-cluster prod"));
        assert!(resolved.coordination_payload.script.contains("-dc dc1"));

        assert_eq!(orch.resolve().unwrap(), resolved);
        assert_eq!(cloud.calls().launches, 0);
    }

    #[tokio::test]
    async fn apply_runs_every_step_in_order() {
        let cloud = Arc::new(SimulatedCloud::new());
        let orch = orchestrator(manifest(), &cloud);
        let report = orch.apply().await.unwrap();

        assert_eq!(report.coordination.launched.len(), 3);
        assert_eq!(report.secret_store.launched.len(), 2);
        assert_eq!(report.grant, GrantOutcome::Created);
        assert_eq!(report.backends.len(), 2);
        assert_eq!(report.dns, Some(DnsChange::Created));

        let grants = cloud.list_grants().await.unwrap();
        assert_eq!(grants.len(), 1);
        assert_eq!(grants[0].grantee, "vault");
        assert_eq!(grants[0].scope, orch.resolve().unwrap().coordination.discovery_tag);

        let record = orch.store().get_deployment("prod").unwrap().unwrap();
        assert_eq!(record.status, DeploymentStatus::Completed);
        assert_eq!(record.completed_steps, DeployStep::ALL.to_vec());
        assert_eq!(orch.store().list_roles().unwrap().len(), 2);
        assert!(orch.store().get_payload("vault").unwrap().is_some());
        assert_eq!(orch.store().list_grants().unwrap().len(), 1);
        assert!(orch.store().get_front("vault-front").unwrap().is_some());
    }

    #[tokio::test]
    async fn every_instance_is_tagged_for_its_fleet() {
        let cloud = Arc::new(SimulatedCloud::new());
        let orch = orchestrator(manifest(), &cloud);
        orch.apply().await.unwrap();

        for instance in cloud.instances() {
            let expected = format!("prod/{}", instance.role);
            assert_eq!(instance.tags.get(ROLE_TAG_KEY), Some(&expected));
        }
    }

    #[tokio::test]
    async fn missing_parameter_fails_before_any_cloud_call() {
        let cloud = Arc::new(SimulatedCloud::new());
        let mut m = manifest();
        m.roles.secret_store.template = Some("vault -seal {{seal_key}}".to_string());
        let orch = orchestrator(m, &cloud);

        match orch.apply().await {
            Err(OrchestratorError::Render(RenderError::MissingParameter { role, names })) => {
                assert_eq!(role, "vault");
                assert_eq!(names, vec!["seal_key".to_string()]);
            }
            other => panic!("expected missing parameter, got {other:?}"),
        }
        let calls = cloud.calls();
        assert_eq!((calls.launches, calls.lists), (0, 0));

        let record = orch.store().get_deployment("prod").unwrap().unwrap();
        assert_eq!(record.halted_at, Some(DeployStep::RenderPayloads));
        assert_eq!(record.last_completed, Some(DeployStep::ResolveImages));
    }

    #[tokio::test]
    async fn unknown_image_fails_fast() {
        let cloud = Arc::new(SimulatedCloud::new());
        let mut m = manifest();
        m.roles.coordination.image.version = "^2".to_string();
        let orch = orchestrator(m, &cloud);

        assert!(matches!(orch.apply().await, Err(OrchestratorError::Image(_))));
        assert!(cloud.instances().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn throttled_front_call_is_retried_within_apply() {
        let cloud = Arc::new(SimulatedCloud::new());
        let orch = orchestrator(manifest(), &cloud);
        cloud.throttle_next_front_calls(1);

        let report = orch.apply().await.unwrap();
        assert_eq!(report.backends.len(), 2);
        let record = orch.store().get_deployment("prod").unwrap().unwrap();
        assert_eq!(record.status, DeploymentStatus::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn front_throttled_past_budget_halts_at_attach() {
        let cloud = Arc::new(SimulatedCloud::new());
        let orch = orchestrator(manifest(), &cloud);
        cloud.throttle_next_front_calls(2);

        match orch.apply().await {
            Err(OrchestratorError::PartialDeploymentHalt { step, last_completed, .. }) => {
                assert_eq!(step, DeployStep::AttachFront);
                assert_eq!(last_completed, Some(DeployStep::ProvisionSecretStore));
            }
            other => panic!("expected partial halt, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn launch_failure_halts_and_leaves_coordination_fleet() {
        let cloud = Arc::new(SimulatedCloud::new());
        let orch = orchestrator(manifest(), &cloud);

        let coordination_only = orch.resolve().unwrap();
        orch.provisioner
            .reconcile_fleet(&coordination_only.coordination, &coordination_only.coordination_payload)
            .await
            .unwrap();
        cloud.mark_all_ready();
        cloud.fail_next_launches(100);

        match orch.apply().await {
            Err(OrchestratorError::PartialDeploymentHalt { step, last_completed, source }) => {
                assert_eq!(step, DeployStep::ProvisionSecretStore);
                assert_eq!(last_completed, Some(DeployStep::BindPermissions));
                assert!(matches!(
                    *source,
                    OrchestratorError::Provision(ProvisionError::FleetDegraded { .. })
                ));
            }
            other => panic!("expected partial halt, got {other:?}"),
        }

        let consul: Vec<_> = cloud.instances().into_iter().filter(|i| i.role == "consul").collect();
        assert_eq!(consul.len(), 3, "nothing is torn down");
        let record = orch.store().get_deployment("prod").unwrap().unwrap();
        assert_eq!(record.status, DeploymentStatus::Halted);
        assert_eq!(record.halted_at, Some(DeployStep::ProvisionSecretStore));
    }

    #[tokio::test]
    async fn no_dns_binding_skips_publish() {
        let cloud = Arc::new(SimulatedCloud::new());
        let mut m = manifest();
        m.front.dns = None;
        let orch = orchestrator(m, &cloud);

        let report = orch.apply().await.unwrap();
        assert_eq!(report.dns, None);
        assert!(cloud.dns_records().is_empty());
        let record = orch.store().get_deployment("prod").unwrap().unwrap();
        assert!(record.is_complete());
        assert!(!record.completed_steps.contains(&DeployStep::PublishDns));
    }

    #[tokio::test]
    async fn reapply_is_a_noop() {
        let cloud = Arc::new(SimulatedCloud::new());
        let orch = orchestrator(manifest(), &cloud);
        orch.apply().await.unwrap();
        cloud.mark_all_ready();

        let again = orch.apply().await.unwrap();
        assert!(again.coordination.is_noop());
        assert!(again.secret_store.is_noop());
        assert_eq!(again.grant, GrantOutcome::AlreadyPresent);
        assert_eq!(again.dns, Some(DnsChange::Unchanged));
        assert_eq!(cloud.calls().launches, 5);
    }

    #[tokio::test]
    async fn reconcile_all_repairs_both_fleets() {
        let cloud = Arc::new(SimulatedCloud::new());
        let orch = orchestrator(manifest(), &cloud);
        orch.apply().await.unwrap();
        cloud.mark_all_ready();

        let first = orch.reconcile_all().await.unwrap();
        assert!(first.is_noop());

        let victim = cloud
            .instances()
            .into_iter()
            .find(|i| i.role == "vault")
            .unwrap();
        cloud.terminate_instance(&victim.id).await.unwrap();

        let repair = orch.reconcile_all().await.unwrap();
        let vault = repair.secret_store.as_ref().unwrap();
        assert_eq!(vault.launched.len(), 1);
        assert!(repair.coordination.as_ref().unwrap().is_noop());
        assert_eq!(repair.backends.len(), 2);
        assert!(repair.backends.iter().all(|b| b.instance_id != victim.id));
    }
}
