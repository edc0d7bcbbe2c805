//! Fleet provisioner: runs planning passes against the cloud.
//!
//! Each role has a ledger guarded by an async mutex. A pass holds the
//! mutex from observation to the last executed action; a second pass for
//! the same role is refused rather than queued. Passes for different
//! roles never contend.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use keygrid_cloud::{Caller, CloudError, CloudProvider, CloudResult, LaunchRequest, with_retry};
use keygrid_core::{BootPayload, Instance, InstanceId, RetryPolicy, Role};
use keygrid_health::InfrastructureHealth;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{ProvisionError, ProvisionResult};
use crate::planner::{FleetAction, InFlight, LaunchPlan, ObservedInstance, plan};

/// How long an issued action may stay unresolved before it is forgotten.
pub const DEFAULT_PENDING_TTL: Duration = Duration::from_secs(600);

#[derive(Debug)]
struct PendingLaunch {
    token: u64,
    instance_id: Option<InstanceId>,
    zone: String,
    issued_at: Instant,
}

#[derive(Debug, Default)]
struct Ledger {
    next_token: u64,
    launches: Vec<PendingLaunch>,
    terminating: HashMap<InstanceId, Instant>,
}

impl Ledger {
    /// Drop entries that the observation shows took effect, or that expired.
    fn settle(&mut self, observed: &[ObservedInstance], ttl: Duration) {
        let now = Instant::now();
        let seen = |id: &str| observed.iter().find(|o| o.instance.id == id);

        self.launches.retain(|p| {
            let resolved = p.instance_id.as_deref().is_some_and(|id| seen(id).is_some());
            !resolved && now.duration_since(p.issued_at) < ttl
        });
        self.terminating.retain(|id, issued_at| {
            let still_active = seen(id).is_some_and(|o| o.instance.is_active());
            still_active && now.duration_since(*issued_at) < ttl
        });
    }

    fn in_flight(&self) -> InFlight {
        InFlight {
            launching: self.launches.iter().map(|p| p.zone.clone()).collect(),
            terminating: self.terminating.keys().cloned().collect(),
        }
    }

    /// Mark planned actions as issued. Returns the ledger token of each launch.
    fn record(&mut self, actions: &[FleetAction]) -> Vec<Option<u64>> {
        let now = Instant::now();
        actions
            .iter()
            .map(|action| match action {
                FleetAction::Launch(launch) => {
                    self.next_token += 1;
                    self.launches.push(PendingLaunch {
                        token: self.next_token,
                        instance_id: None,
                        zone: launch.zone.clone(),
                        issued_at: now,
                    });
                    Some(self.next_token)
                }
                FleetAction::Terminate { instance_id, .. } => {
                    self.terminating.insert(instance_id.clone(), now);
                    None
                }
            })
            .collect()
    }

    fn confirm_launch(&mut self, token: u64, instance_id: InstanceId) {
        if let Some(p) = self.launches.iter_mut().find(|p| p.token == token) {
            p.instance_id = Some(instance_id);
        }
    }

    fn forget_launch(&mut self, token: u64) {
        self.launches.retain(|p| p.token != token);
    }
}

/// An action that still failed after its retries.
#[derive(Debug, Clone)]
pub struct ActionFailure {
    pub action: String,
    pub error: CloudError,
}

/// Outcome of one [`FleetProvisioner::reconcile_fleet`] pass.
#[derive(Debug, Clone)]
pub struct FleetReport {
    pub role: String,
    pub target: u32,
    /// Active instances at observation time.
    pub observed_active: usize,
    pub launched: Vec<InstanceId>,
    pub terminated: Vec<InstanceId>,
    pub failures: Vec<ActionFailure>,
}

impl FleetReport {
    pub fn is_noop(&self) -> bool {
        self.launched.is_empty() && self.terminated.is_empty() && self.failures.is_empty()
    }

    pub fn is_degraded(&self) -> bool {
        !self.failures.is_empty()
    }

    /// `FleetDegraded` if any action exhausted its retries.
    pub fn into_result(self) -> ProvisionResult<Self> {
        match self.failures.last() {
            None => Ok(self),
            Some(last) => Err(ProvisionError::FleetDegraded {
                role: self.role.clone(),
                failures: self.failures.len(),
                last_error: last.error.clone(),
            }),
        }
    }
}

pub struct FleetProvisioner {
    cloud: Arc<dyn CloudProvider>,
    health: Arc<dyn InfrastructureHealth>,
    retry: RetryPolicy,
    pending_ttl: Duration,
    ledgers: Mutex<HashMap<String, Arc<tokio::sync::Mutex<Ledger>>>>,
}

impl FleetProvisioner {
    pub fn new(
        cloud: Arc<dyn CloudProvider>,
        health: Arc<dyn InfrastructureHealth>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            cloud,
            health,
            retry,
            pending_ttl: DEFAULT_PENDING_TTL,
            ledgers: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_pending_ttl(mut self, ttl: Duration) -> Self {
        self.pending_ttl = ttl;
        self
    }

    /// One ledger per fleet, keyed by the fleet tag value.
    fn ledger(&self, role: &Role) -> Arc<tokio::sync::Mutex<Ledger>> {
        let mut ledgers = self.ledgers.lock().expect("ledger lock");
        ledgers.entry(role.fleet_tag().value).or_default().clone()
    }

    /// Plan one pass from a given observation.
    ///
    /// The returned actions are recorded as in flight, so an identical
    /// second call returns nothing. Launches executed outside
    /// [`reconcile_fleet`](Self::reconcile_fleet) never report their
    /// instance id and clear only when the pending TTL expires.
    pub fn reconcile(
        &self,
        role: &Role,
        payload: &BootPayload,
        observed: &[ObservedInstance],
    ) -> ProvisionResult<Vec<FleetAction>> {
        let ledger = self.ledger(role);
        let mut ledger = ledger
            .try_lock()
            .map_err(|_| ProvisionError::ReconcileInProgress(role.name.clone()))?;
        let (actions, _) = self.plan_locked(&mut ledger, role, payload, observed);
        Ok(actions)
    }

    /// List the role's instances in its own cluster and attach
    /// infrastructure liveness.
    pub async fn observe(&self, role: &Role) -> CloudResult<Vec<ObservedInstance>> {
        let cloud = self.cloud.as_ref();
        let tag = &role.fleet_tag();
        let caller = &Caller::Orchestrator;
        let instances = with_retry(&self.retry, "list_instances", move || {
            cloud.list_instances(caller, tag)
        })
        .await?;
        Ok(instances
            .into_iter()
            .map(|instance| ObservedInstance {
                liveness: self.health.liveness(&instance),
                instance,
            })
            .collect())
    }

    /// Observe, plan, and execute one pass for `role`.
    pub async fn reconcile_fleet(
        &self,
        role: &Role,
        payload: &BootPayload,
    ) -> ProvisionResult<FleetReport> {
        let ledger = self.ledger(role);
        let mut ledger = ledger
            .try_lock()
            .map_err(|_| ProvisionError::ReconcileInProgress(role.name.clone()))?;

        let observed = self.observe(role).await?;
        let (actions, tokens) = self.plan_locked(&mut ledger, role, payload, &observed);

        let mut report = FleetReport {
            role: role.name.clone(),
            target: role.desired_size,
            observed_active: observed.iter().filter(|o| o.instance.is_active()).count(),
            launched: Vec::new(),
            terminated: Vec::new(),
            failures: Vec::new(),
        };

        for (action, token) in actions.into_iter().zip(tokens) {
            match action {
                FleetAction::Launch(launch) => {
                    let zone = launch.zone.clone();
                    match self.launch(launch).await {
                        Ok(instance) => {
                            if let Some(token) = token {
                                ledger.confirm_launch(token, instance.id.clone());
                            }
                            report.launched.push(instance.id);
                        }
                        Err(error) => {
                            if let Some(token) = token {
                                ledger.forget_launch(token);
                            }
                            warn!(role = %role.name, %zone, %error, "launch failed after retries");
                            report.failures.push(ActionFailure {
                                action: format!("launch in {zone}"),
                                error,
                            });
                        }
                    }
                }
                FleetAction::Terminate { instance_id, reason } => {
                    let cloud = self.cloud.as_ref();
                    let id = instance_id.as_str();
                    match with_retry(&self.retry, "terminate_instance", move || {
                        cloud.terminate_instance(id)
                    })
                    .await
                    {
                        Ok(()) => {
                            info!(role = %role.name, instance = %instance_id, ?reason, "instance terminated");
                            report.terminated.push(instance_id);
                        }
                        Err(error) => {
                            ledger.terminating.remove(&instance_id);
                            warn!(role = %role.name, instance = %instance_id, %error, "terminate failed after retries");
                            report.failures.push(ActionFailure {
                                action: format!("terminate {instance_id}"),
                                error,
                            });
                        }
                    }
                }
            }
        }

        info!(
            role = %role.name,
            target = report.target,
            observed = report.observed_active,
            launched = report.launched.len(),
            terminated = report.terminated.len(),
            failures = report.failures.len(),
            "fleet reconciled"
        );
        Ok(report)
    }

    fn plan_locked(
        &self,
        ledger: &mut Ledger,
        role: &Role,
        payload: &BootPayload,
        observed: &[ObservedInstance],
    ) -> (Vec<FleetAction>, Vec<Option<u64>>) {
        ledger.settle(observed, self.pending_ttl);
        let in_flight = ledger.in_flight();
        let actions = plan(role, payload, observed, &in_flight);
        let tokens = ledger.record(&actions);
        debug!(
            role = %role.name,
            launching = in_flight.launching.len(),
            terminating = in_flight.terminating.len(),
            planned = actions.len(),
            "fleet planned"
        );
        (actions, tokens)
    }

    async fn launch(&self, launch: LaunchPlan) -> CloudResult<Instance> {
        let request = LaunchRequest {
            role: launch.role,
            zone: launch.zone,
            image_id: launch.image_id,
            instance_class: launch.instance_class,
            payload: launch.payload,
            tags: launch.tags,
        };
        let cloud = self.cloud.as_ref();
        with_retry(&self.retry, "launch_instance", move || {
            cloud.launch_instance(request.clone())
        })
        .await
    }
}
