//! Cross-fleet permission binding.

use std::sync::Arc;

use keygrid_cloud::{CloudProvider, CloudResult, with_retry};
use keygrid_core::{DiscoveryTag, GrantAction, PermissionGrant, RetryPolicy};
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GrantOutcome {
    Created,
    AlreadyPresent,
}

/// Lets one fleet perform an action scoped to another fleet's tag.
pub struct PermissionBinder {
    cloud: Arc<dyn CloudProvider>,
    retry: RetryPolicy,
}

impl PermissionBinder {
    pub fn new(cloud: Arc<dyn CloudProvider>, retry: RetryPolicy) -> Self {
        Self { cloud, retry }
    }

    /// Grant `grantee` permission to perform `action` on `scope`.
    ///
    /// Idempotent. The grant may take a while to become visible to the
    /// grantee's instances.
    pub async fn grant(
        &self,
        grantor: &str,
        grantee: &str,
        action: GrantAction,
        scope: &DiscoveryTag,
    ) -> CloudResult<(PermissionGrant, GrantOutcome)> {
        let grant = PermissionGrant {
            grantor: grantor.to_string(),
            grantee: grantee.to_string(),
            action,
            scope: scope.clone(),
        };

        let cloud = self.cloud.as_ref();
        let g = &grant;
        let created = with_retry(&self.retry, "put_grant", move || cloud.put_grant(g)).await?;
        let outcome = if created {
            GrantOutcome::Created
        } else {
            GrantOutcome::AlreadyPresent
        };

        info!(
            grantor,
            grantee,
            action = action.label(),
            %scope,
            ?outcome,
            "permission bound"
        );
        Ok((grant, outcome))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keygrid_cloud::SimulatedCloud;
    use std::time::Duration;

    fn binder(cloud: &Arc<SimulatedCloud>) -> PermissionBinder {
        PermissionBinder::new(
            cloud.clone(),
            RetryPolicy::new(3, Duration::from_millis(10), Duration::from_millis(10)),
        )
    }

    #[tokio::test]
    async fn grant_is_idempotent() {
        let cloud = Arc::new(SimulatedCloud::new());
        let scope = DiscoveryTag::new("keygrid-cluster", "prod-consul");

        let (grant, first) = binder(&cloud)
            .grant("consul", "vault", GrantAction::ListInstances, &scope)
            .await
            .unwrap();
        assert_eq!(first, GrantOutcome::Created);
        assert!(grant.permits("vault", GrantAction::ListInstances, &scope));

        let (_, second) = binder(&cloud)
            .grant("consul", "vault", GrantAction::ListInstances, &scope)
            .await
            .unwrap();
        assert_eq!(second, GrantOutcome::AlreadyPresent);
        assert_eq!(cloud.list_grants().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn distinct_scopes_are_distinct_grants() {
        let cloud = Arc::new(SimulatedCloud::new());
        let b = binder(&cloud);
        b.grant("consul", "vault", GrantAction::ListInstances, &DiscoveryTag::new("k", "a"))
            .await
            .unwrap();
        let (_, outcome) = b
            .grant("consul", "vault", GrantAction::ListInstances, &DiscoveryTag::new("k", "b"))
            .await
            .unwrap();
        assert_eq!(outcome, GrantOutcome::Created);
        assert_eq!(cloud.list_grants().await.unwrap().len(), 2);
    }
}
