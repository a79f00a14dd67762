//! watt core types: resources, collection keys, watch events and errors.

#![forbid(unsafe_code)]

use std::fmt;

use serde::{Deserialize, Serialize};

pub mod names;
mod resource;

pub use resource::{ObjectKey, Resource};

/// Errors surfaced by the watch/cache engine and its collaborators.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
pub enum WattError {
    #[error("unknown_kind: {0}")]
    UnknownKind(String),
    #[error("connection_failure: {0}")]
    ConnectionFailure(String),
    #[error("no_such_watch: {0}")]
    NoSuchWatch(String),
    #[error("remote_rejected: {0}")]
    RemoteRejected(String),
    #[error("already_started: {0}")]
    AlreadyStarted(String),
    #[error("stopped")]
    Stopped,
    #[error("invalid: {0}")]
    Invalid(String),
}

pub type WattResult<T> = Result<T, WattError>;

/// What the resolver knows about one served collection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceInfo {
    pub group: String,
    pub version: String,
    /// Plural resource name, e.g. `deployments`.
    pub plural: String,
    pub kind: String,
    pub namespaced: bool,
}

impl ResourceInfo {
    /// `apiVersion` string as it appears on objects (`v1`, `apps/v1`).
    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }

    /// Collection key for this resource scoped to `namespace` (empty = all).
    ///
    /// Cluster-scoped kinds ignore the namespace.
    pub fn key(&self, namespace: &str) -> CollectionKey {
        let namespace = if self.namespaced { namespace.to_string() } else { String::new() };
        CollectionKey {
            group: self.group.clone(),
            version: self.version.clone(),
            plural: self.plural.clone(),
            namespace,
        }
    }
}

/// Identifies one tracked watch: group/version/plural plus an optional namespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CollectionKey {
    pub group: String,
    pub version: String,
    pub plural: String,
    /// Empty means every namespace.
    pub namespace: String,
}

impl CollectionKey {
    /// True when both keys address the same collection, whatever their namespace.
    pub fn same_collection(&self, other: &CollectionKey) -> bool {
        self.group == other.group && self.version == other.version && self.plural == other.plural
    }

    pub fn all_namespaces(&self) -> CollectionKey {
        CollectionKey { namespace: String::new(), ..self.clone() }
    }
}

impl fmt::Display for CollectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.plural, self.version)?;
        if !self.group.is_empty() {
            write!(f, ".{}", self.group)?;
        }
        if !self.namespace.is_empty() {
            write!(f, "@{}", self.namespace)?;
        }
        Ok(())
    }
}

/// Change kinds carried by a watch stream.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum EventKind {
    Added,
    Modified,
    Deleted,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Added => "added",
            EventKind::Modified => "modified",
            EventKind::Deleted => "deleted",
        }
    }
}

/// One record from a watch stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WatchEvent {
    Change(EventKind, Resource),
    /// Progress marker: the collection has reached `resource_version`, nothing changed.
    Bookmark { resource_version: String },
}

impl WatchEvent {
    pub fn added(r: Resource) -> Self { WatchEvent::Change(EventKind::Added, r) }
    pub fn modified(r: Resource) -> Self { WatchEvent::Change(EventKind::Modified, r) }
    pub fn deleted(r: Resource) -> Self { WatchEvent::Change(EventKind::Deleted, r) }
}

/// Server-side field and label selectors applied to every list and watch.
///
/// Both use the API server's selector syntax (`a=b,c!=d`); `None` selects everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Selector {
    pub fields: Option<String>,
    pub labels: Option<String>,
}

impl Selector {
    pub fn new(fields: Option<String>, labels: Option<String>) -> Self {
        let keep = |s: Option<String>| s.map(|s| s.trim().to_string()).filter(|s| !s.is_empty());
        Self { fields: keep(fields), labels: keep(labels) }
    }

    pub fn is_empty(&self) -> bool { self.fields.is_none() && self.labels.is_none() }
}

/// Result of a full listing: every object plus the collection-wide version token.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ListResult {
    pub items: Vec<Resource>,
    pub resource_version: String,
}

pub mod prelude {
    pub use super::{
        CollectionKey, EventKind, ListResult, ObjectKey, Resource, ResourceInfo, Selector, WatchEvent,
        WattError, WattResult,
    };
}
