//! Privilege-caching authorization enforcement.
//!
//! This crate decides whether a principal may perform an action on a platform
//! entity. Privileges come from a pluggable backend and are cached per
//! principal; a background task refreshes the cache so steady-state checks
//! never leave the process. The engine fails closed: when privileges cannot be
//! determined the check is rejected, never allowed.
//! Use [`EnforcementEngine`] for enforcement and [`EnforcementConfig`] for the
//! two toggles (authorization on/off, caching on/off).
//!
//! # Examples
//!
//! Enforcement backed by the in-memory authorizer (enable `memory-authorizer`):
//! ```no_run
//! use authz_enforcer::{Action, EngineBuilder, EnforcementConfig, EntityId, Principal};
//! # #[cfg(feature = "memory-authorizer")]
//! # async fn demo() -> authz_enforcer::Result<()> {
//! use authz_enforcer::MemoryAuthorizer;
//! let backend = MemoryAuthorizer::new();
//! let config = EnforcementConfig::default().with_authorization_enabled(true);
//! let engine = EngineBuilder::new(backend).config(config).build()?;
//! engine.start()?;
//! let ns = EntityId::namespace("ns")?;
//! let alice = Principal::user("alice")?;
//! let _ = engine.enforce(&ns, &alice, Action::Read).await;
//! engine.shutdown().await;
//! # Ok(())
//! # }
//! ```
//!
//! Loading the toggles from site properties:
//! ```
//! use authz_enforcer::EnforcementConfig;
//! let config = EnforcementConfig::from_properties([
//!     ("authorization.enabled", "true"),
//!     ("authorization.cache.refresh-interval", "30s"),
//! ])
//! .unwrap();
//! assert!(config.caching_active());
//! ```
#![forbid(unsafe_code)]

mod authorizer;
mod cache;
pub mod config;
mod engine;
mod error;
mod sync;
mod types;

#[cfg(feature = "memory-authorizer")]
mod memory_authorizer;

#[cfg(feature = "axum")]
pub mod axum;

pub use crate::authorizer::{AuthorizerClient, PrivilegeManager, PrivilegesFetcher};
pub use crate::cache::PrivilegeCache;
pub use crate::config::EnforcementConfig;
pub use crate::engine::{EnforcementEngine, EngineBuilder};
pub use crate::error::{BackendError, BackendTimeout, Error, Result};
pub use crate::sync::{PrivilegeSync, SyncHandle, SyncReport};
pub use crate::types::{
    Action, EntityId, EntityKind, Principal, PrincipalType, Privilege, PrivilegeSet,
};

#[cfg(feature = "memory-authorizer")]
pub use crate::memory_authorizer::{MemoryAuthorizer, Unavailable};
