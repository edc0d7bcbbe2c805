//! The load balancer front for the secret-store fleet.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

use keygrid_cloud::{BackendTarget, CloudProvider, DnsChange, FrontHandle, with_retry};
use keygrid_core::config::validate_cidr;
use keygrid_core::{FrontSpec, Instance, RetryPolicy};
use keygrid_health::{ApplicationHealth, HealthStatus, HealthTracker};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::dns::desired_record;
use crate::error::{FrontError, FrontResult};

/// Probe status of one registered backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendHealth {
    pub target: BackendTarget,
    pub status: HealthStatus,
}

impl BackendHealth {
    pub fn is_routable(&self) -> bool {
        self.status == HealthStatus::Healthy
    }
}

struct Backend {
    target: BackendTarget,
    tracker: HealthTracker,
    /// Earliest time the probe loop checks this backend again.
    next_probe: Instant,
}

impl Backend {
    fn new(target: BackendTarget, spec: &FrontSpec) -> Self {
        Self {
            target,
            tracker: HealthTracker::from_spec(&spec.health),
            next_probe: Instant::now(),
        }
    }
}

pub struct LoadBalancerFront {
    spec: FrontSpec,
    cloud: Arc<dyn CloudProvider>,
    probe: Arc<dyn ApplicationHealth>,
    retry: RetryPolicy,
    handle: RwLock<Option<FrontHandle>>,
    /// Keyed by instance id.
    backends: RwLock<BTreeMap<String, Backend>>,
    counter: AtomicUsize,
}

impl LoadBalancerFront {
    pub fn new(
        spec: FrontSpec,
        cloud: Arc<dyn CloudProvider>,
        probe: Arc<dyn ApplicationHealth>,
    ) -> Self {
        Self {
            spec,
            cloud,
            probe,
            retry: RetryPolicy::default(),
            handle: RwLock::new(None),
            backends: RwLock::new(BTreeMap::new()),
            counter: AtomicUsize::new(0),
        }
    }

    /// Retry budget for the front's cloud calls.
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn spec(&self) -> &FrontSpec {
        &self.spec
    }

    /// Address of the front once it exists.
    pub fn address(&self) -> Option<String> {
        self.handle
            .read()
            .expect("front lock")
            .as_ref()
            .map(|h| h.address.clone())
    }

    /// Create the front if missing. Refuses to open a listener without an
    /// explicit allow list.
    pub async fn ensure(&self) -> FrontResult<FrontHandle> {
        if self.spec.allowed_cidrs.is_empty() {
            return Err(FrontError::NoAllowedCidrs(self.spec.name.clone()));
        }
        for cidr in &self.spec.allowed_cidrs {
            if validate_cidr(cidr).is_err() {
                warn!(front = %self.spec.name, %cidr, "allowed cidr rejected");
                return Err(FrontError::InvalidCidr(cidr.clone()));
            }
        }

        let cloud = self.cloud.as_ref();
        let spec = &self.spec;
        let handle = with_retry(&self.retry, "ensure_front", move || cloud.ensure_front(spec)).await?;
        info!(
            front = %handle.name,
            address = %handle.address,
            port = self.spec.listener_port,
            cidrs = ?self.spec.allowed_cidrs,
            "front ready"
        );
        *self.handle.write().expect("front lock") = Some(handle.clone());
        Ok(handle)
    }

    /// Replace the backend set with the active members of `instances`.
    ///
    /// Backends that stay keep their probe history unless their address
    /// changed. New backends start unknown and out of rotation.
    pub async fn register_backends(&self, instances: &[Instance]) -> FrontResult<Vec<BackendTarget>> {
        if self.handle.read().expect("front lock").is_none() {
            return Err(FrontError::NotEnsured(self.spec.name.clone()));
        }

        let mut targets: Vec<BackendTarget> = instances
            .iter()
            .filter(|i| i.is_active())
            .map(|i| BackendTarget {
                instance_id: i.id.clone(),
                address: i.address.clone(),
                port: self.spec.backend_port,
            })
            .collect();
        targets.sort();

        let cloud = self.cloud.as_ref();
        let (name, registered) = (self.spec.name.as_str(), targets.as_slice());
        with_retry(&self.retry, "register_backends", move || {
            cloud.register_backends(name, registered)
        })
        .await?;

        let mut backends = self.backends.write().expect("backends lock");
        let mut next = BTreeMap::new();
        for target in &targets {
            let backend = match backends.remove(&target.instance_id) {
                Some(existing) if existing.target == *target => existing,
                _ => Backend::new(target.clone(), &self.spec),
            };
            next.insert(target.instance_id.clone(), backend);
        }
        let removed = backends.len();
        *backends = next;

        debug!(front = %self.spec.name, backends = targets.len(), removed, "backends registered");
        Ok(targets)
    }

    /// Probe every registered backend once and fold the results in.
    pub async fn probe(&self) -> Vec<BackendHealth> {
        self.probe_where(|_| true).await
    }

    /// Probe only the backends whose next probe is due. A failing backend
    /// is probed less often as its tracker backs off.
    pub async fn probe_due(&self) -> Vec<BackendHealth> {
        let now = Instant::now();
        self.probe_where(|b| b.next_probe <= now).await
    }

    async fn probe_where(&self, due: impl Fn(&Backend) -> bool) -> Vec<BackendHealth> {
        let targets: Vec<BackendTarget> = self
            .backends
            .read()
            .expect("backends lock")
            .values()
            .filter(|b| due(b))
            .map(|b| b.target.clone())
            .collect();

        let mut results = Vec::with_capacity(targets.len());
        for target in targets {
            let result = self.probe.probe(&target.endpoint()).await;
            results.push((target, result));
        }

        let now = Instant::now();
        let mut backends = self.backends.write().expect("backends lock");
        let mut report = Vec::with_capacity(results.len());
        for (target, result) in results {
            // Backend may have been replaced while probing.
            let Some(backend) = backends.get_mut(&target.instance_id) else {
                continue;
            };
            if backend.target != target {
                continue;
            }
            let before = backend.tracker.status();
            let status = backend.tracker.record(result);
            backend.next_probe = now + backend.tracker.next_interval();
            if status != before {
                info!(
                    front = %self.spec.name,
                    backend = %target.endpoint(),
                    instance = %target.instance_id,
                    ?before,
                    ?status,
                    "backend status changed"
                );
            }
            report.push(BackendHealth { target, status });
        }
        report
    }

    pub fn backend_health(&self) -> Vec<BackendHealth> {
        self.backends
            .read()
            .expect("backends lock")
            .values()
            .map(|b| BackendHealth {
                target: b.target.clone(),
                status: b.tracker.status(),
            })
            .collect()
    }

    /// Backends currently in rotation.
    pub fn healthy_backends(&self) -> Vec<BackendTarget> {
        self.backends
            .read()
            .expect("backends lock")
            .values()
            .filter(|b| b.tracker.is_routable())
            .map(|b| b.target.clone())
            .collect()
    }

    /// Round robin over healthy backends. `None` when nothing is routable.
    pub fn next_backend(&self) -> Option<BackendTarget> {
        let healthy = self.healthy_backends();
        if healthy.is_empty() {
            return None;
        }
        let idx = self.counter.fetch_add(1, Ordering::Relaxed) % healthy.len();
        Some(healthy[idx].clone())
    }

    /// Point the configured DNS name at the front. `None` when no binding
    /// is configured.
    pub async fn publish_dns(&self) -> FrontResult<Option<DnsChange>> {
        let Some(binding) = &self.spec.dns else {
            return Ok(None);
        };
        let handle = self
            .handle
            .read()
            .expect("front lock")
            .clone()
            .ok_or_else(|| FrontError::NotEnsured(self.spec.name.clone()))?;

        let record = desired_record(binding, &handle);
        let cloud = self.cloud.as_ref();
        let desired = &record;
        let change = with_retry(&self.retry, "upsert_dns_record", move || {
            cloud.upsert_dns_record(desired)
        })
        .await?;
        info!(name = %record.name, target = %record.target, ?change, "dns record published");
        Ok(Some(change))
    }
}
