use crate::error::BackendError;
use crate::types::{Action, EntityId, Principal, Privilege, PrivilegeSet};
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Arc;

/// Read side of an authorization backend.
///
/// This is all the enforcement engine needs; program containers that may only
/// fetch privileges implement just this trait.
#[async_trait]
pub trait PrivilegesFetcher: Send + Sync {
    /// Returns every privilege currently granted to a principal.
    async fn list_privileges(
        &self,
        principal: &Principal,
    ) -> std::result::Result<PrivilegeSet, BackendError>;

    /// Checks a single privilege against the backend.
    ///
    /// Used when caching is disabled. Backends with a native check should
    /// override the default list-and-contains implementation.
    async fn enforce(
        &self,
        entity: &EntityId,
        principal: &Principal,
        action: Action,
    ) -> std::result::Result<bool, BackendError> {
        let privileges = self.list_privileges(principal).await?;
        Ok(privileges.contains(&Privilege::new(entity.clone(), action)))
    }
}

/// Write side of an authorization backend.
#[async_trait]
pub trait PrivilegeManager: Send + Sync {
    /// Grants actions on an entity to a principal.
    async fn grant(
        &self,
        entity: &EntityId,
        principal: &Principal,
        actions: &HashSet<Action>,
    ) -> std::result::Result<(), BackendError>;

    /// Revokes every privilege on an entity, for all principals.
    async fn revoke_all(&self, entity: &EntityId) -> std::result::Result<(), BackendError>;

    /// Revokes actions on an entity from a principal.
    async fn revoke(
        &self,
        entity: &EntityId,
        principal: &Principal,
        actions: &HashSet<Action>,
    ) -> std::result::Result<(), BackendError>;
}

/// Composite backend trait.
pub trait AuthorizerClient: PrivilegesFetcher + PrivilegeManager {}

impl<T> AuthorizerClient for T where T: PrivilegesFetcher + PrivilegeManager {}

#[async_trait]
impl<T> PrivilegesFetcher for Arc<T>
where
    T: PrivilegesFetcher + ?Sized,
{
    async fn list_privileges(
        &self,
        principal: &Principal,
    ) -> std::result::Result<PrivilegeSet, BackendError> {
        (**self).list_privileges(principal).await
    }

    async fn enforce(
        &self,
        entity: &EntityId,
        principal: &Principal,
        action: Action,
    ) -> std::result::Result<bool, BackendError> {
        (**self).enforce(entity, principal, action).await
    }
}
