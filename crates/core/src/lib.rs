//! kcopy core types and errors

#![forbid(unsafe_code)]

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Group/Version/Resource coordinate of an API resource type.
///
/// An empty `group` is the core group. `version` may only be empty before resolution.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceCoordinate {
    pub group: String,
    pub version: String,
    pub resource: String,
}

impl ResourceCoordinate {
    pub fn new(group: impl Into<String>, version: impl Into<String>, resource: impl Into<String>) -> Self {
        Self { group: group.into(), version: version.into(), resource: resource.into() }
    }

    pub fn is_core(&self) -> bool { self.group.is_empty() }

    /// `apiVersion` as written in object manifests (`v1`, `apps/v1`).
    pub fn api_version(&self) -> String {
        if self.group.is_empty() { self.version.clone() } else { format!("{}/{}", self.group, self.version) }
    }
}

impl fmt::Display for ResourceCoordinate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.group.is_empty() {
            write!(f, "{}/{}", self.version, self.resource)
        } else {
            write!(f, "{}/{}/{}", self.group, self.version, self.resource)
        }
    }
}

/// One resource type served by an API surface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveredResource {
    pub group: String,
    pub version: String,
    /// Plural resource name (`pods`).
    pub resource: String,
    pub kind: String,
    pub namespaced: bool,
    /// Whether `version` is the preferred version of its group.
    pub preferred: bool,
}

impl DiscoveredResource {
    pub fn coordinate(&self) -> ResourceCoordinate {
        ResourceCoordinate::new(self.group.clone(), self.version.clone(), self.resource.clone())
    }
}

/// A fully resolved resource type: coordinate plus what list/apply and ordering need.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResolvedResource {
    pub coordinate: ResourceCoordinate,
    pub kind: String,
    pub namespaced: bool,
}

impl From<&DiscoveredResource> for ResolvedResource {
    fn from(d: &DiscoveredResource) -> Self {
        Self { coordinate: d.coordinate(), kind: d.kind.clone(), namespaced: d.namespaced }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    Download,
    Upload,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Download => f.write_str("download"),
            Direction::Upload => f.write_str("upload"),
        }
    }
}

/// Copy of a single object in one direction.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CopyTask {
    pub coordinate: ResourceCoordinate,
    pub object_name: String,
    /// Empty for cluster-scoped objects.
    pub namespace: String,
    pub direction: Direction,
}

impl CopyTask {
    pub fn new(coordinate: ResourceCoordinate, namespace: Option<&str>, object_name: impl Into<String>, direction: Direction) -> Self {
        Self { coordinate, object_name: object_name.into(), namespace: namespace.unwrap_or_default().to_string(), direction }
    }

    pub fn namespace(&self) -> Option<&str> {
        if self.namespace.is_empty() { None } else { Some(&self.namespace) }
    }

    /// `namespace/name` or `name`.
    pub fn object_key(&self) -> String {
        match self.namespace() {
            Some(ns) => format!("{}/{}", ns, self.object_name),
            None => self.object_name.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Outcome {
    Success,
    Failure,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CopyResult {
    pub task: CopyTask,
    pub outcome: Outcome,
    pub error: Option<CopyError>,
}

impl CopyResult {
    pub fn success(task: CopyTask) -> Self { Self { task, outcome: Outcome::Success, error: None } }

    pub fn failure(task: CopyTask, error: CopyError) -> Self { Self { task, outcome: Outcome::Failure, error: Some(error) } }

    pub fn is_success(&self) -> bool { self.outcome == Outcome::Success }
}

/// Error taxonomy shared by every kcopy crate.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
pub enum CopyError {
    /// Fatal: aborts the run before any network or disk work.
    #[error("configuration: {0}")]
    Configuration(String),
    #[error("invalid resource token {0:?} (expect [group/][version/]resource)")]
    InvalidResourceToken(String),
    #[error("unknown resource: {0}")]
    UnknownResource(String),
    #[error("ambiguous resource {token:?}: matches {}", candidates.join(", "))]
    AmbiguousResource { token: String, candidates: Vec<String> },
    #[error("transport: {0}")]
    Transport(String),
    #[error("persistence: {}: {reason}", path.display())]
    Persistence { path: PathBuf, reason: String },
    #[error("cancelled")]
    Cancelled,
    #[error("internal: {0}")]
    Internal(String),
}

impl CopyError {
    pub fn persistence(path: impl Into<PathBuf>, reason: impl fmt::Display) -> Self {
        CopyError::Persistence { path: path.into(), reason: reason.to_string() }
    }

    /// Only configuration errors abort a run without producing a report.
    pub fn is_fatal(&self) -> bool { matches!(self, CopyError::Configuration(_)) }

    pub fn is_resolution(&self) -> bool {
        matches!(self, CopyError::InvalidResourceToken(_) | CopyError::UnknownResource(_) | CopyError::AmbiguousResource { .. })
    }
}

pub type CopyOutcome<T> = Result<T, CopyError>;

/// Object name from `metadata.name`.
pub fn object_name(obj: &serde_json::Value) -> Option<&str> {
    obj.get("metadata").and_then(|m| m.get("name")).and_then(|v| v.as_str())
}

/// Object namespace from `metadata.namespace`.
pub fn object_namespace(obj: &serde_json::Value) -> Option<&str> {
    obj.get("metadata").and_then(|m| m.get("namespace")).and_then(|v| v.as_str()).filter(|s| !s.is_empty())
}

pub mod prelude {
    pub use super::{CopyError, CopyOutcome, CopyResult, CopyTask, Direction, DiscoveredResource, Outcome, ResolvedResource, ResourceCoordinate};
}
