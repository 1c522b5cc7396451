use std::collections::HashSet;
use std::sync::Arc;

use dashmap::DashMap;

use crate::types::{Principal, PrivilegeSet};

/// Process-local cache of each principal's complete privilege set.
///
/// Entries are replaced whole: a reader sees either the previous set or the
/// new one, never a mix. The map is sharded, so there is no lock over the
/// whole cache and none is held while the backend is called.
#[derive(Debug, Default)]
pub struct PrivilegeCache {
    entries: DashMap<Principal, Arc<PrivilegeSet>>,
}

impl PrivilegeCache {
    /// Creates an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the cached set for a principal.
    ///
    /// `Some` of an empty set means the principal was fetched and holds no
    /// privileges; `None` means it was never fetched.
    pub fn get(&self, principal: &Principal) -> Option<Arc<PrivilegeSet>> {
        self.entries
            .get(principal)
            .map(|entry| Arc::clone(entry.value()))
    }

    /// Replaces (or creates) a principal's entry and returns the stored set.
    /// Last writer wins.
    pub fn put(&self, principal: Principal, privileges: PrivilegeSet) -> Arc<PrivilegeSet> {
        let privileges = Arc::new(privileges);
        self.entries.insert(principal, Arc::clone(&privileges));
        privileges
    }

    /// Point-in-time snapshot of the cached principals.
    pub fn keys(&self) -> HashSet<Principal> {
        self.entries
            .iter()
            .map(|entry| entry.key().clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drops every entry.
    pub fn clear(&self) {
        self.entries.clear();
    }
}
