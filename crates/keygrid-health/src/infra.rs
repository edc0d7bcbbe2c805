//! Infrastructure-level health, owned by the fleet provisioner.
//!
//! Derived only from what the cloud reports about the VM: lifecycle state
//! and status checks. Whether the software on it is serving is not part
//! of this signal.

use keygrid_core::{Instance, LifecycleState, StatusCheck};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Alive,
    /// Booting; counts toward the fleet but is not yet checked.
    Starting,
    /// Must be replaced.
    Dead,
}

pub trait InfrastructureHealth: Send + Sync {
    fn liveness(&self, instance: &Instance) -> Liveness;
}

/// Liveness from cloud lifecycle state and status checks.
#[derive(Debug, Clone, Copy, Default)]
pub struct StatusCheckHealth;

impl InfrastructureHealth for StatusCheckHealth {
    fn liveness(&self, instance: &Instance) -> Liveness {
        match (instance.state, instance.status_check) {
            (LifecycleState::Pending, _) => Liveness::Starting,
            (LifecycleState::Running, StatusCheck::Initializing) => Liveness::Starting,
            (LifecycleState::Running, StatusCheck::Ok) => Liveness::Alive,
            (LifecycleState::Running, StatusCheck::Impaired) => Liveness::Dead,
            (
                LifecycleState::ShuttingDown | LifecycleState::Terminated | LifecycleState::Stopped,
                _,
            ) => Liveness::Dead,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn instance(state: LifecycleState, check: StatusCheck) -> Instance {
        Instance {
            id: "i-1".into(),
            role: "vault".into(),
            address: "10.0.0.10".into(),
            zone: "a".into(),
            image_id: "ami".into(),
            instance_class: "small".into(),
            payload_digest: "d".into(),
            tags: BTreeMap::new(),
            state,
            status_check: check,
            launched_at: 1,
        }
    }

    #[test]
    fn liveness_mapping() {
        let h = StatusCheckHealth;
        let cases = [
            (LifecycleState::Pending, StatusCheck::Initializing, Liveness::Starting),
            (LifecycleState::Running, StatusCheck::Initializing, Liveness::Starting),
            (LifecycleState::Running, StatusCheck::Ok, Liveness::Alive),
            (LifecycleState::Running, StatusCheck::Impaired, Liveness::Dead),
            (LifecycleState::Stopped, StatusCheck::Ok, Liveness::Dead),
            (LifecycleState::Terminated, StatusCheck::Ok, Liveness::Dead),
        ];
        for (state, check, expected) in cases {
            assert_eq!(h.liveness(&instance(state, check)), expected, "{state:?}/{check:?}");
        }
    }
}
