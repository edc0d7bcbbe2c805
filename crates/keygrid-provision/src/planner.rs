//! Pure fleet planning.
//!
//! [`plan`] compares a role's desired state with what the cloud reports and
//! returns the launches and terminations that close the gap. It performs
//! no I/O and keeps no state; everything it knows is in its arguments.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

use keygrid_core::{BootPayload, Instance, InstanceId, Role};
use keygrid_health::Liveness;

/// An instance as listed, paired with its infrastructure liveness.
#[derive(Debug, Clone, PartialEq)]
pub struct ObservedInstance {
    pub instance: Instance,
    pub liveness: Liveness,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminateReason {
    /// Failed infrastructure checks.
    Dead,
    /// Above target size.
    Surplus,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LaunchPlan {
    pub role: String,
    pub zone: String,
    pub image_id: String,
    pub instance_class: String,
    pub payload: BootPayload,
    pub tags: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FleetAction {
    Launch(LaunchPlan),
    Terminate {
        instance_id: InstanceId,
        reason: TerminateReason,
    },
}

impl FleetAction {
    pub fn is_launch(&self) -> bool {
        matches!(self, FleetAction::Launch(_))
    }
}

/// Actions already issued whose effect is not yet visible.
#[derive(Debug, Clone, Default)]
pub struct InFlight {
    /// Zone of each unresolved launch.
    pub launching: Vec<String>,
    /// Instances already told to terminate.
    pub terminating: BTreeSet<InstanceId>,
}

/// Plan the actions that move `observed` toward `role.desired_size`
/// instances running `payload`.
pub fn plan(
    role: &Role,
    payload: &BootPayload,
    observed: &[ObservedInstance],
    in_flight: &InFlight,
) -> Vec<FleetAction> {
    let mut actions = Vec::new();

    let (mut dead, mut serving): (Vec<&ObservedInstance>, Vec<&ObservedInstance>) = observed
        .iter()
        .filter(|o| o.instance.is_active() && !in_flight.terminating.contains(&o.instance.id))
        .partition(|o| o.liveness == Liveness::Dead);

    dead.sort_by(|a, b| a.instance.id.cmp(&b.instance.id));
    actions.extend(dead.into_iter().map(|o| FleetAction::Terminate {
        instance_id: o.instance.id.clone(),
        reason: TerminateReason::Dead,
    }));

    let target = role.desired_size as usize;
    let effective = serving.len() + in_flight.launching.len();

    match effective.cmp(&target) {
        Ordering::Less => {
            let mut occupancy = zone_occupancy(role, &serving, in_flight);
            for _ in effective..target {
                let Some(zone) = least_occupied(role, &occupancy) else {
                    break;
                };
                *occupancy.entry(zone.clone()).or_default() += 1;
                actions.push(launch(role, zone, payload));
            }
        }
        Ordering::Greater => {
            serving.sort_by(|a, b| surplus_order(role, payload, a, b));
            let surplus = (effective - target).min(serving.len());
            actions.extend(serving.iter().take(surplus).map(|o| FleetAction::Terminate {
                instance_id: o.instance.id.clone(),
                reason: TerminateReason::Surplus,
            }));
        }
        Ordering::Equal => {
            let has_stale = serving.iter().any(|o| is_stale(role, payload, &o.instance));
            if has_stale && in_flight.launching.is_empty() {
                let occupancy = zone_occupancy(role, &serving, in_flight);
                if let Some(zone) = least_occupied(role, &occupancy) {
                    actions.push(launch(role, zone, payload));
                }
            }
        }
    }

    actions
}

/// Whether an instance belongs to an older generation of the role.
pub fn is_stale(role: &Role, payload: &BootPayload, instance: &Instance) -> bool {
    instance.payload_digest != payload.digest || instance.image_id != role.image_id
}

fn launch(role: &Role, zone: String, payload: &BootPayload) -> FleetAction {
    FleetAction::Launch(LaunchPlan {
        role: role.name.clone(),
        zone,
        image_id: role.image_id.clone(),
        instance_class: role.instance_class.clone(),
        payload: payload.clone(),
        tags: role.instance_tags(),
    })
}

fn zone_occupancy(
    role: &Role,
    serving: &[&ObservedInstance],
    in_flight: &InFlight,
) -> BTreeMap<String, usize> {
    let mut occupancy: BTreeMap<String, usize> =
        role.zones.iter().map(|z| (z.clone(), 0)).collect();
    let zones = serving
        .iter()
        .map(|o| &o.instance.zone)
        .chain(in_flight.launching.iter());
    for zone in zones {
        if let Some(count) = occupancy.get_mut(zone) {
            *count += 1;
        }
    }
    occupancy
}

/// Least occupied zone; ties go to the zone listed first on the role.
fn least_occupied(role: &Role, occupancy: &BTreeMap<String, usize>) -> Option<String> {
    let mut best: Option<(&String, usize)> = None;
    for zone in &role.zones {
        let count = occupancy.get(zone).copied().unwrap_or_default();
        if best.is_none_or(|(_, c)| count < c) {
            best = Some((zone, count));
        }
    }
    best.map(|(zone, _)| zone.clone())
}

/// Termination preference: stale generation, then oldest, then id.
fn surplus_order(
    role: &Role,
    payload: &BootPayload,
    a: &ObservedInstance,
    b: &ObservedInstance,
) -> Ordering {
    let stale_a = is_stale(role, payload, &a.instance);
    let stale_b = is_stale(role, payload, &b.instance);
    stale_b
        .cmp(&stale_a)
        .then(a.instance.launched_at.cmp(&b.instance.launched_at))
        .then_with(|| a.instance.id.cmp(&b.instance.id))
}
