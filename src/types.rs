use crate::error::{Error, Result};
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

const MAX_NAME_LEN: usize = 128;

fn validate_name(value: &str, kind: &str, allowed: fn(char) -> bool) -> Result<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(Error::InvalidId(format!("{kind} must not be empty")));
    }
    if trimmed.len() > MAX_NAME_LEN {
        return Err(Error::InvalidId(format!(
            "{kind} length must be <= {MAX_NAME_LEN}"
        )));
    }
    if !trimmed.chars().all(allowed) {
        return Err(Error::InvalidId(format!(
            "{kind} contains invalid characters"
        )));
    }
    Ok(trimmed.to_string())
}

fn is_entity_name_char(ch: char) -> bool {
    ch.is_ascii_alphanumeric() || matches!(ch, '_' | '-')
}

fn is_principal_name_char(ch: char) -> bool {
    ch.is_ascii_alphanumeric() || matches!(ch, '_' | '-' | '.' | '@')
}

fn entity_name(value: &str, kind: &str) -> Result<String> {
    validate_name(value, kind, is_entity_name_char)
}

/// Kind of an authenticated identity.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum PrincipalType {
    User,
    Group,
    Role,
}

impl PrincipalType {
    /// Returns the lowercase name used in display and parsing.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Group => "group",
            Self::Role => "role",
        }
    }
}

impl fmt::Display for PrincipalType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PrincipalType {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "user" => Ok(Self::User),
            "group" => Ok(Self::Group),
            "role" => Ok(Self::Role),
            other => Err(Error::InvalidId(format!("unknown principal type `{other}`"))),
        }
    }
}

/// An identity subject to authorization checks.
///
/// Compared by value, so two principals with the same name and type share a
/// cache entry.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Principal {
    name: String,
    #[cfg_attr(feature = "serde", serde(rename = "type"))]
    kind: PrincipalType,
}

impl Principal {
    /// Creates a principal with a validated name.
    pub fn new(name: impl AsRef<str>, kind: PrincipalType) -> Result<Self> {
        let name = validate_name(name.as_ref(), "principal name", is_principal_name_char)?;
        Ok(Self { name, kind })
    }

    /// Creates a user principal.
    pub fn user(name: impl AsRef<str>) -> Result<Self> {
        Self::new(name, PrincipalType::User)
    }

    /// Creates a group principal.
    pub fn group(name: impl AsRef<str>) -> Result<Self> {
        Self::new(name, PrincipalType::Group)
    }

    /// Creates a role principal.
    pub fn role(name: impl AsRef<str>) -> Result<Self> {
        Self::new(name, PrincipalType::Role)
    }

    /// Creates a principal from a trusted name without validation.
    pub fn from_string(name: String, kind: PrincipalType) -> Self {
        Self { name, kind }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> PrincipalType {
        self.kind
    }
}

impl fmt::Display for Principal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.name)
    }
}

impl FromStr for Principal {
    type Err = Error;

    /// Parses `type:name`, e.g. `user:alice`.
    fn from_str(value: &str) -> Result<Self> {
        let (kind, name) = value
            .trim()
            .split_once(':')
            .ok_or_else(|| Error::InvalidId("principal must be in type:name format".to_string()))?;
        Self::new(name, kind.parse()?)
    }
}

/// Discriminant of an [`EntityId`].
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum EntityKind {
    Namespace,
    Dataset,
    Stream,
    Application,
    Program,
}

impl EntityKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Namespace => "namespace",
            Self::Dataset => "dataset",
            Self::Stream => "stream",
            Self::Application => "application",
            Self::Program => "program",
        }
    }

    fn segments(self) -> usize {
        match self {
            Self::Namespace => 1,
            Self::Dataset | Self::Stream | Self::Application => 2,
            Self::Program => 3,
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityKind {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "namespace" => Ok(Self::Namespace),
            "dataset" => Ok(Self::Dataset),
            "stream" => Ok(Self::Stream),
            "application" => Ok(Self::Application),
            "program" => Ok(Self::Program),
            other => Err(Error::InvalidId(format!("unknown entity kind `{other}`"))),
        }
    }
}

/// Addressable platform resource.
///
/// Enforcement treats entities as opaque keys: a privilege on a namespace says
/// nothing about the datasets inside it.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(tag = "entity", rename_all = "lowercase"))]
pub enum EntityId {
    Namespace {
        namespace: String,
    },
    Dataset {
        namespace: String,
        dataset: String,
    },
    Stream {
        namespace: String,
        stream: String,
    },
    Application {
        namespace: String,
        application: String,
    },
    Program {
        namespace: String,
        application: String,
        program: String,
    },
}

impl EntityId {
    /// Creates a validated namespace id.
    pub fn namespace(name: impl AsRef<str>) -> Result<Self> {
        Ok(Self::Namespace {
            namespace: entity_name(name.as_ref(), "namespace name")?,
        })
    }

    /// Creates a dataset inside this namespace.
    pub fn dataset(&self, name: impl AsRef<str>) -> Result<Self> {
        Ok(Self::Dataset {
            namespace: self.namespace_child("dataset")?,
            dataset: entity_name(name.as_ref(), "dataset name")?,
        })
    }

    /// Creates a stream inside this namespace.
    pub fn stream(&self, name: impl AsRef<str>) -> Result<Self> {
        Ok(Self::Stream {
            namespace: self.namespace_child("stream")?,
            stream: entity_name(name.as_ref(), "stream name")?,
        })
    }

    /// Creates an application inside this namespace.
    pub fn application(&self, name: impl AsRef<str>) -> Result<Self> {
        Ok(Self::Application {
            namespace: self.namespace_child("application")?,
            application: entity_name(name.as_ref(), "application name")?,
        })
    }

    /// Creates a program inside this application.
    pub fn program(&self, name: impl AsRef<str>) -> Result<Self> {
        let Self::Application {
            namespace,
            application,
        } = self
        else {
            return Err(Error::InvalidId(format!(
                "a program must belong to an application, not a {}",
                self.kind()
            )));
        };
        Ok(Self::Program {
            namespace: namespace.clone(),
            application: application.clone(),
            program: entity_name(name.as_ref(), "program name")?,
        })
    }

    fn namespace_child(&self, child: &str) -> Result<String> {
        match self {
            Self::Namespace { namespace } => Ok(namespace.clone()),
            other => Err(Error::InvalidId(format!(
                "a {child} must belong to a namespace, not a {}",
                other.kind()
            ))),
        }
    }

    pub fn kind(&self) -> EntityKind {
        match self {
            Self::Namespace { .. } => EntityKind::Namespace,
            Self::Dataset { .. } => EntityKind::Dataset,
            Self::Stream { .. } => EntityKind::Stream,
            Self::Application { .. } => EntityKind::Application,
            Self::Program { .. } => EntityKind::Program,
        }
    }

    /// Namespace this entity lives in.
    pub fn namespace_name(&self) -> &str {
        match self {
            Self::Namespace { namespace }
            | Self::Dataset { namespace, .. }
            | Self::Stream { namespace, .. }
            | Self::Application { namespace, .. }
            | Self::Program { namespace, .. } => namespace,
        }
    }

    /// Containing entity, if any. Informational only.
    pub fn parent(&self) -> Option<Self> {
        match self {
            Self::Namespace { .. } => None,
            Self::Dataset { namespace, .. }
            | Self::Stream { namespace, .. }
            | Self::Application { namespace, .. } => Some(Self::Namespace {
                namespace: namespace.clone(),
            }),
            Self::Program {
                namespace,
                application,
                ..
            } => Some(Self::Application {
                namespace: namespace.clone(),
                application: application.clone(),
            }),
        }
    }

    fn segments(&self) -> Vec<&str> {
        match self {
            Self::Namespace { namespace } => vec![namespace.as_str()],
            Self::Dataset { namespace, dataset } => vec![namespace.as_str(), dataset.as_str()],
            Self::Stream { namespace, stream } => vec![namespace.as_str(), stream.as_str()],
            Self::Application {
                namespace,
                application,
            } => vec![namespace.as_str(), application.as_str()],
            Self::Program {
                namespace,
                application,
                program,
            } => vec![namespace.as_str(), application.as_str(), program.as_str()],
        }
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind(), self.segments().join("."))
    }
}

impl FromStr for EntityId {
    type Err = Error;

    /// Parses `kind:seg[.seg...]`, e.g. `dataset:ns.ds`.
    fn from_str(value: &str) -> Result<Self> {
        let (kind, path) = value
            .trim()
            .split_once(':')
            .ok_or_else(|| Error::InvalidId("entity must be in kind:path format".to_string()))?;
        let kind: EntityKind = kind.parse()?;
        let parts: Vec<&str> = path.split('.').collect();
        if parts.len() != kind.segments() {
            return Err(Error::InvalidId(format!(
                "{kind} id must have {} segment(s)",
                kind.segments()
            )));
        }
        let namespace = Self::namespace(parts[0])?;
        match kind {
            EntityKind::Namespace => Ok(namespace),
            EntityKind::Dataset => namespace.dataset(parts[1]),
            EntityKind::Stream => namespace.stream(parts[1]),
            EntityKind::Application => namespace.application(parts[1]),
            EntityKind::Program => namespace.application(parts[1])?.program(parts[2]),
        }
    }
}

/// Operation a principal may perform on an entity.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum Action {
    Read,
    Write,
    Execute,
    Admin,
}

impl Action {
    /// Every action, in declaration order.
    pub const ALL: [Action; 4] = [Self::Read, Self::Write, Self::Execute, Self::Admin];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Write => "write",
            Self::Execute => "execute",
            Self::Admin => "admin",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Action {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "read" => Ok(Self::Read),
            "write" => Ok(Self::Write),
            "execute" => Ok(Self::Execute),
            "admin" => Ok(Self::Admin),
            other => Err(Error::InvalidId(format!("unknown action `{other}`"))),
        }
    }
}

/// A granted `(entity, action)` pair.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Privilege {
    entity: EntityId,
    action: Action,
}

impl Privilege {
    pub fn new(entity: EntityId, action: Action) -> Self {
        Self { entity, action }
    }

    pub fn entity(&self) -> &EntityId {
        &self.entity
    }

    pub fn action(&self) -> Action {
        self.action
    }
}

impl fmt::Display for Privilege {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} on {}", self.action, self.entity)
    }
}

/// A principal's complete authorization state.
pub type PrivilegeSet = HashSet<Privilege>;
