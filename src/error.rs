use crate::types::{Action, EntityId, Principal};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Backend-layer error type.
pub type BackendError = Box<dyn std::error::Error + Send + Sync>;

/// Crate result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors returned by this crate.
#[derive(Debug, Error)]
pub enum Error {
    /// The principal does not hold the privilege.
    #[error("principal {principal} is not authorized to perform {action} on {entity}")]
    PermissionDenied {
        principal: Principal,
        entity: EntityId,
        action: Action,
    },
    /// The authorization backend failed or timed out.
    #[error("authorization backend unavailable: {0}")]
    BackendUnavailable(#[source] BackendError),
    /// Invalid or missing configuration.
    #[error("invalid configuration: {0}")]
    Configuration(String),
    /// Invalid identifier input.
    #[error("invalid id: {0}")]
    InvalidId(String),
}

impl Error {
    /// Returns true for policy rejections.
    pub fn is_permission_denied(&self) -> bool {
        matches!(self, Self::PermissionDenied { .. })
    }

    /// Returns true for infrastructure failures talking to the backend.
    pub fn is_backend_unavailable(&self) -> bool {
        matches!(self, Self::BackendUnavailable(_))
    }

    pub(crate) fn denied(principal: &Principal, entity: &EntityId, action: Action) -> Self {
        Self::PermissionDenied {
            principal: principal.clone(),
            entity: entity.clone(),
            action,
        }
    }
}

impl From<BackendError> for Error {
    fn from(error: BackendError) -> Self {
        Self::BackendUnavailable(error)
    }
}

/// A backend call that did not complete within the configured timeout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendTimeout {
    /// Backend operation that timed out.
    pub operation: &'static str,
    /// Configured limit.
    pub timeout: Duration,
}

impl fmt::Display for BackendTimeout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} timed out after {}",
            self.operation,
            humantime::format_duration(self.timeout)
        )
    }
}

impl std::error::Error for BackendTimeout {}
