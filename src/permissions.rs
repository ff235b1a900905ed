use async_trait::async_trait;

use crate::event_sourcing::Agent;

/// Decides whether an agent may perform an action. Permission names are
/// feature-defined strings such as `offer:update`.
#[async_trait]
pub trait PermissionsService: Send + Sync {
    async fn has_permission(&self, agent: &Agent, permission: &str) -> bool;
}

/// Grants everything
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

#[async_trait]
impl PermissionsService for AllowAll {
    async fn has_permission(&self, _agent: &Agent, _permission: &str) -> bool {
        true
    }
}

/// Grants nothing
#[derive(Debug, Clone, Copy, Default)]
pub struct DenyAll;

#[async_trait]
impl PermissionsService for DenyAll {
    async fn has_permission(&self, agent: &Agent, permission: &str) -> bool {
        tracing::debug!(agent = %agent, permission, "Permission denied");
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_allow_all() {
        let user = Agent::user("user-1").unwrap();
        assert!(AllowAll.has_permission(&user, "offer:update").await);
        assert!(AllowAll.has_permission(&Agent::system(), "offer:delete").await);
    }

    #[tokio::test]
    async fn test_deny_all() {
        let user = Agent::user("user-1").unwrap();
        assert!(!DenyAll.has_permission(&user, "offer:update").await);
        assert!(!DenyAll.has_permission(&Agent::system(), "offer:update").await);
    }
}
