//! In-process cloud used by tests and by `keygridd` without a real API.
//!
//! Each zone gets its own `10.0.{n}.0/24` subnet. Addresses are handed out
//! lowest-first and return to the pool once their instance is terminated,
//! so a replacement often inherits its predecessor's address. Grants
//! become visible only after `grant_delay`, which models permission
//! propagation.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use keygrid_core::{
    DiscoveryTag, FrontSpec, GrantAction, Instance, LifecycleState, PermissionGrant, StatusCheck,
};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info};

use crate::error::{CloudError, CloudResult};
use crate::provider::{
    BackendTarget, Caller, CloudProvider, DnsChange, DnsRecord, FrontHandle, LaunchRequest,
};

const FIRST_HOST: u8 = 10;
const LAST_HOST: u8 = 250;

/// Counters of mutating and listing calls, for assertions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallStats {
    pub launches: u32,
    pub terminations: u32,
    pub lists: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct FrontRecord {
    spec: FrontSpec,
    address: String,
    backends: Vec<BackendTarget>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct World {
    instances: BTreeMap<String, Instance>,
    next_id: u64,
    clock: u64,
    zones: Vec<String>,
    fronts: BTreeMap<String, FrontRecord>,
    dns: BTreeMap<String, DnsRecord>,
    grants: BTreeMap<String, PermissionGrant>,
    #[serde(skip)]
    grant_visible_at: HashMap<String, Instant>,
    #[serde(skip)]
    launch_failures: u32,
    #[serde(skip)]
    list_throttles: u32,
    #[serde(skip)]
    front_throttles: u32,
    #[serde(skip)]
    calls: CallStats,
}

impl World {
    fn allocate_address(&mut self, zone: &str) -> CloudResult<String> {
        let idx = match self.zones.iter().position(|z| z == zone) {
            Some(idx) => idx,
            None => {
                self.zones.push(zone.to_string());
                self.zones.len() - 1
            }
        };
        let prefix = format!("10.0.{idx}.");
        let used: BTreeSet<u8> = self
            .instances
            .values()
            .filter(|i| i.zone == zone && i.state != LifecycleState::Terminated)
            .filter_map(|i| i.address.strip_prefix(&prefix)?.parse().ok())
            .collect();
        (FIRST_HOST..=LAST_HOST)
            .find(|host| !used.contains(host))
            .map(|host| format!("{prefix}{host}"))
            .ok_or_else(|| CloudError::Capacity {
                zone: zone.to_string(),
                reason: "subnet exhausted".to_string(),
            })
    }

    fn tick(&mut self) -> u64 {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();
        self.clock = (self.clock + 1).max(now);
        self.clock
    }

    fn authorize(&self, caller: &Caller, tag: &DiscoveryTag) -> CloudResult<()> {
        let Caller::Instance { instance_id, role } = caller else {
            return Ok(());
        };
        let owns_tag = self
            .instances
            .get(instance_id)
            .is_some_and(|i| i.is_active() && i.has_tag(tag));
        if owns_tag {
            return Ok(());
        }
        let now = Instant::now();
        let granted = self.grants.iter().any(|(key, grant)| {
            grant.permits(role, GrantAction::ListInstances, tag)
                && self.grant_visible_at.get(key).is_none_or(|at| now >= *at)
        });
        if granted {
            Ok(())
        } else {
            Err(CloudError::Unauthorized {
                caller: caller.to_string(),
                action: GrantAction::ListInstances.label().to_string(),
                scope: tag.to_string(),
            })
        }
    }

    /// Consume one injected front-API throttle, if any are pending.
    fn throttle_front_call(&mut self) -> CloudResult<()> {
        if self.front_throttles > 0 {
            self.front_throttles -= 1;
            return Err(CloudError::Throttled);
        }
        Ok(())
    }

    fn instance_mut(&mut self, id: &str) -> CloudResult<&mut Instance> {
        self.instances
            .get_mut(id)
            .ok_or_else(|| CloudError::InstanceNotFound(id.to_string()))
    }
}

pub struct SimulatedCloud {
    world: Mutex<World>,
    grant_delay: Duration,
}

impl Default for SimulatedCloud {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedCloud {
    pub fn new() -> Self {
        Self {
            world: Mutex::new(World {
                next_id: 1,
                ..World::default()
            }),
            grant_delay: Duration::ZERO,
        }
    }

    /// Delay between `put_grant` and the grant taking effect.
    pub fn with_grant_delay(mut self, delay: Duration) -> Self {
        self.grant_delay = delay;
        self
    }

    /// Load a snapshot written by [`save`](Self::save). A missing file
    /// yields an empty cloud. Loaded grants are visible immediately.
    pub fn load(path: &Path) -> CloudResult<Self> {
        if !path.exists() {
            return Ok(Self::new());
        }
        let content = std::fs::read_to_string(path)
            .map_err(|e| CloudError::Snapshot(format!("{}: {e}", path.display())))?;
        let world: World =
            serde_json::from_str(&content).map_err(|e| CloudError::Snapshot(e.to_string()))?;
        debug!(?path, instances = world.instances.len(), "simulated cloud loaded");
        Ok(Self {
            world: Mutex::new(world),
            grant_delay: Duration::ZERO,
        })
    }

    pub fn save(&self, path: &Path) -> CloudResult<()> {
        let json = {
            let world = self.world.lock().expect("cloud lock");
            serde_json::to_string_pretty(&*world).map_err(|e| CloudError::Snapshot(e.to_string()))?
        };
        std::fs::write(path, json)
            .map_err(|e| CloudError::Snapshot(format!("{}: {e}", path.display())))?;
        Ok(())
    }

    /// Make the next `n` launches fail with a capacity error.
    pub fn fail_next_launches(&self, n: u32) {
        self.world.lock().expect("cloud lock").launch_failures = n;
    }

    /// Make the next `n` listings fail as throttled.
    pub fn throttle_next_lists(&self, n: u32) {
        self.world.lock().expect("cloud lock").list_throttles = n;
    }

    /// Make the next `n` front, backend, or DNS calls fail as throttled.
    pub fn throttle_next_front_calls(&self, n: u32) {
        self.world.lock().expect("cloud lock").front_throttles = n;
    }

    pub fn set_status_check(&self, instance_id: &str, check: StatusCheck) -> CloudResult<()> {
        let mut world = self.world.lock().expect("cloud lock");
        world.instance_mut(instance_id)?.status_check = check;
        Ok(())
    }

    pub fn set_state(&self, instance_id: &str, state: LifecycleState) -> CloudResult<()> {
        let mut world = self.world.lock().expect("cloud lock");
        world.instance_mut(instance_id)?.state = state;
        Ok(())
    }

    /// Finish booting every active instance: running with passing checks.
    pub fn mark_all_ready(&self) {
        let mut world = self.world.lock().expect("cloud lock");
        for inst in world.instances.values_mut().filter(|i| i.is_active()) {
            inst.state = LifecycleState::Running;
            inst.status_check = StatusCheck::Ok;
        }
    }

    /// Every instance ever launched, terminated ones included.
    pub fn instances(&self) -> Vec<Instance> {
        let world = self.world.lock().expect("cloud lock");
        world.instances.values().cloned().collect()
    }

    pub fn backends(&self, front: &str) -> Vec<BackendTarget> {
        let world = self.world.lock().expect("cloud lock");
        world
            .fronts
            .get(front)
            .map(|f| f.backends.clone())
            .unwrap_or_default()
    }

    pub fn dns_records(&self) -> Vec<DnsRecord> {
        let world = self.world.lock().expect("cloud lock");
        world.dns.values().cloned().collect()
    }

    pub fn calls(&self) -> CallStats {
        self.world.lock().expect("cloud lock").calls
    }
}

#[async_trait]
impl CloudProvider for SimulatedCloud {
    async fn launch_instance(&self, request: LaunchRequest) -> CloudResult<Instance> {
        let mut world = self.world.lock().expect("cloud lock");
        world.calls.launches += 1;
        if world.launch_failures > 0 {
            world.launch_failures -= 1;
            return Err(CloudError::Capacity {
                zone: request.zone,
                reason: "injected launch failure".to_string(),
            });
        }

        let address = world.allocate_address(&request.zone)?;
        let id = format!("i-{:08x}", world.next_id);
        world.next_id += 1;
        let launched_at = world.tick();

        let instance = Instance {
            id: id.clone(),
            role: request.role,
            address,
            zone: request.zone,
            image_id: request.image_id,
            instance_class: request.instance_class,
            payload_digest: request.payload.digest,
            tags: request.tags,
            state: LifecycleState::Pending,
            status_check: StatusCheck::Initializing,
            launched_at,
        };
        info!(
            instance = %instance.id,
            role = %instance.role,
            zone = %instance.zone,
            address = %instance.address,
            "instance launched"
        );
        world.instances.insert(id, instance.clone());
        Ok(instance)
    }

    async fn list_instances(&self, caller: &Caller, tag: &DiscoveryTag) -> CloudResult<Vec<Instance>> {
        let mut world = self.world.lock().expect("cloud lock");
        world.calls.lists += 1;
        if world.list_throttles > 0 {
            world.list_throttles -= 1;
            return Err(CloudError::Throttled);
        }
        world.authorize(caller, tag)?;
        Ok(world
            .instances
            .values()
            .filter(|i| i.has_tag(tag))
            .cloned()
            .collect())
    }

    async fn terminate_instance(&self, instance_id: &str) -> CloudResult<()> {
        let mut world = self.world.lock().expect("cloud lock");
        world.calls.terminations += 1;
        let instance = world.instance_mut(instance_id)?;
        if instance.state != LifecycleState::Terminated {
            instance.state = LifecycleState::Terminated;
            info!(instance = %instance_id, address = %instance.address, "instance terminated");
        }
        Ok(())
    }

    async fn ensure_front(&self, spec: &FrontSpec) -> CloudResult<FrontHandle> {
        if spec.allowed_cidrs.is_empty() {
            return Err(CloudError::Api(format!(
                "front {} has no allowed CIDR blocks",
                spec.name
            )));
        }
        let mut world = self.world.lock().expect("cloud lock");
        world.throttle_front_call()?;
        let record = world
            .fronts
            .entry(spec.name.clone())
            .or_insert_with(|| {
                info!(front = %spec.name, port = spec.listener_port, "front created");
                FrontRecord {
                    spec: spec.clone(),
                    address: format!("{}.lb.keygrid.internal", spec.name),
                    backends: Vec::new(),
                }
            });
        record.spec = spec.clone();
        Ok(FrontHandle {
            name: spec.name.clone(),
            address: record.address.clone(),
        })
    }

    async fn register_backends(&self, front: &str, backends: &[BackendTarget]) -> CloudResult<()> {
        let mut world = self.world.lock().expect("cloud lock");
        world.throttle_front_call()?;
        let record = world
            .fronts
            .get_mut(front)
            .ok_or_else(|| CloudError::FrontNotFound(front.to_string()))?;
        let mut sorted = backends.to_vec();
        sorted.sort();
        debug!(%front, count = sorted.len(), "backends registered");
        record.backends = sorted;
        Ok(())
    }

    async fn upsert_dns_record(&self, record: &DnsRecord) -> CloudResult<DnsChange> {
        let mut world = self.world.lock().expect("cloud lock");
        world.throttle_front_call()?;
        let key = format!("{}/{}", record.zone, record.name);
        let change = match world.dns.get(&key) {
            None => DnsChange::Created,
            Some(existing) if existing == record => DnsChange::Unchanged,
            Some(_) => DnsChange::Updated,
        };
        if change != DnsChange::Unchanged {
            info!(name = %record.name, target = %record.target, ?change, "dns record written");
            world.dns.insert(key, record.clone());
        }
        Ok(change)
    }

    async fn put_grant(&self, grant: &PermissionGrant) -> CloudResult<bool> {
        let mut world = self.world.lock().expect("cloud lock");
        let key = grant.key();
        if world.grants.contains_key(&key) {
            return Ok(false);
        }
        world.grants.insert(key.clone(), grant.clone());
        if !self.grant_delay.is_zero() {
            let visible_at = Instant::now() + self.grant_delay;
            world.grant_visible_at.insert(key.clone(), visible_at);
        }
        info!(grant = %key, delay = ?self.grant_delay, "grant stored");
        Ok(true)
    }

    async fn list_grants(&self) -> CloudResult<Vec<PermissionGrant>> {
        let world = self.world.lock().expect("cloud lock");
        Ok(world.grants.values().cloned().collect())
    }
}
