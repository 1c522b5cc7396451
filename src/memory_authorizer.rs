use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;

use crate::authorizer::{PrivilegeManager, PrivilegesFetcher};
use crate::error::BackendError;
use crate::types::{Action, EntityId, Principal, Privilege, PrivilegeSet};

/// In-memory authorization backend for tests and demos.
///
/// Clones share state, so a test can keep one handle to grant and revoke
/// while the engine owns another.
#[derive(Debug, Default, Clone)]
pub struct MemoryAuthorizer {
    inner: Arc<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    privileges: RwLock<HashMap<Principal, PrivilegeSet>>,
    unavailable: AtomicBool,
    list_calls: AtomicUsize,
}

/// Error returned while the backend is marked unavailable.
#[derive(Debug)]
pub struct Unavailable;

impl fmt::Display for Unavailable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("in-memory authorizer is unavailable")
    }
}

impl std::error::Error for Unavailable {}

impl MemoryAuthorizer {
    /// Creates an empty backend.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent call fail until set back to `true`.
    pub fn set_available(&self, available: bool) {
        self.inner.unavailable.store(!available, Ordering::SeqCst);
    }

    /// Number of `list_privileges` calls served so far, including failed ones.
    pub fn list_calls(&self) -> usize {
        self.inner.list_calls.load(Ordering::SeqCst)
    }

    fn check_available(&self) -> std::result::Result<(), BackendError> {
        if self.inner.unavailable.load(Ordering::SeqCst) {
            return Err(Box::new(Unavailable));
        }
        Ok(())
    }
}

#[async_trait]
impl PrivilegesFetcher for MemoryAuthorizer {
    async fn list_privileges(
        &self,
        principal: &Principal,
    ) -> std::result::Result<PrivilegeSet, BackendError> {
        self.inner.list_calls.fetch_add(1, Ordering::SeqCst);
        self.check_available()?;
        let guard = self.inner.privileges.read().expect("poisoned lock");
        Ok(guard.get(principal).cloned().unwrap_or_default())
    }
}

#[async_trait]
impl PrivilegeManager for MemoryAuthorizer {
    async fn grant(
        &self,
        entity: &EntityId,
        principal: &Principal,
        actions: &HashSet<Action>,
    ) -> std::result::Result<(), BackendError> {
        self.check_available()?;
        let mut guard = self.inner.privileges.write().expect("poisoned lock");
        guard.entry(principal.clone()).or_default().extend(
            actions
                .iter()
                .map(|action| Privilege::new(entity.clone(), *action)),
        );
        Ok(())
    }

    async fn revoke_all(&self, entity: &EntityId) -> std::result::Result<(), BackendError> {
        self.check_available()?;
        let mut guard = self.inner.privileges.write().expect("poisoned lock");
        for privileges in guard.values_mut() {
            privileges.retain(|privilege| privilege.entity() != entity);
        }
        Ok(())
    }

    async fn revoke(
        &self,
        entity: &EntityId,
        principal: &Principal,
        actions: &HashSet<Action>,
    ) -> std::result::Result<(), BackendError> {
        self.check_available()?;
        let mut guard = self.inner.privileges.write().expect("poisoned lock");
        if let Some(privileges) = guard.get_mut(principal) {
            privileges.retain(|privilege| {
                privilege.entity() != entity || !actions.contains(&privilege.action())
            });
        }
        Ok(())
    }
}
