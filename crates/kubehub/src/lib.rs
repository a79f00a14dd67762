//! watt kubehub: resource-type resolution and per-collection list/watch/status handles.
//!
//! The watch engine only sees the traits defined here. [`KubeHub`] backs them with a
//! live API server; [`mock::MockCluster`] backs them with an in-memory cluster.

#![forbid(unsafe_code)]

use std::sync::Arc;

use futures::stream::BoxStream;
use watt_core::{ListResult, Resource, ResourceInfo, Selector, WatchEvent, WattResult};

mod kube_hub;
pub mod mock;

pub use kube_hub::{KubeCollection, KubeHub};

/// Unbounded, finite-per-connection sequence of watch records.
pub type WatchStream = BoxStream<'static, WattResult<WatchEvent>>;

/// Longest server-side watch timeout the API client accepts (it rejects 295s and above).
pub const MAX_WATCH_TIMEOUT_SECS: u32 = 294;

/// Maps a short or qualified kind name to the collection serving it.
///
/// Called on every registration and query; implementations may keep their own
/// discovery data but callers never cache the answers.
pub trait ResourceResolver: Send + Sync {
    fn resolve(&self, kind: &str) -> WattResult<ResourceInfo>;
}

/// Client capability bound to one collection, optionally scoped to one namespace.
#[async_trait::async_trait]
pub trait Collection: Send + Sync {
    /// Full listing plus the collection version token to watch from.
    async fn list(&self) -> WattResult<ListResult>;

    /// Stream changes after `resource_version`. The server closes the stream after
    /// roughly `timeout_secs`, capped at [`MAX_WATCH_TIMEOUT_SECS`].
    async fn watch(&self, resource_version: &str, timeout_secs: u32) -> WattResult<WatchStream>;

    /// Replace the status sub-resource of `resource` and return the stored object.
    async fn update_status(&self, resource: &Resource) -> WattResult<Resource>;
}

/// Hands out collection handles for resolved resources.
pub trait Connector: Send + Sync {
    /// `namespace` empty means every namespace (or a cluster-scoped kind). The selector
    /// narrows both the listing and the watch stream.
    fn collection(&self, info: &ResourceInfo, namespace: &str, selector: &Selector)
        -> WattResult<Arc<dyn Collection>>;
}

/// Short names the API server does not advertise through discovery.
const SHORT_NAMES: &[(&str, &str)] = &[
    ("cm", "configmaps"),
    ("crd", "customresourcedefinitions"),
    ("crds", "customresourcedefinitions"),
    ("cj", "cronjobs"),
    ("deploy", "deployments"),
    ("ds", "daemonsets"),
    ("ep", "endpoints"),
    ("ev", "events"),
    ("hpa", "horizontalpodautoscalers"),
    ("ing", "ingresses"),
    ("netpol", "networkpolicies"),
    ("no", "nodes"),
    ("ns", "namespaces"),
    ("pdb", "poddisruptionbudgets"),
    ("po", "pods"),
    ("pv", "persistentvolumes"),
    ("pvc", "persistentvolumeclaims"),
    ("rs", "replicasets"),
    ("sa", "serviceaccounts"),
    ("sc", "storageclasses"),
    ("sts", "statefulsets"),
    ("svc", "services"),
];

/// Resolve `kind` against a discovered resource table.
///
/// Accepts plural, singular or Kind (any case), a known short name, and the
/// qualified forms `plural.group` and `plural.version.group`. When several groups
/// serve the same name the first entry in `table` wins, so callers order it by
/// preference.
pub fn resolve_in(table: &[ResourceInfo], kind: &str) -> WattResult<ResourceInfo> {
    let wanted = kind.trim().to_ascii_lowercase();
    let (name, qualifier) = match wanted.split_once('.') {
        Some((name, rest)) => (name, Some(rest)),
        None => (wanted.as_str(), None),
    };
    let name = SHORT_NAMES
        .iter()
        .find(|(short, _)| *short == name)
        .map(|(_, plural)| *plural)
        .unwrap_or(name);
    if name.is_empty() {
        return Err(watt_core::WattError::UnknownKind(kind.to_string()));
    }
    table
        .iter()
        .filter(|r| r.plural == name || r.kind.eq_ignore_ascii_case(name))
        .find(|r| match qualifier {
            None => true,
            Some(q) => {
                let q = q.trim_end_matches('.');
                q == r.group || q == format!("{}.{}", r.version, r.group).trim_end_matches('.')
            }
        })
        .cloned()
        .ok_or_else(|| watt_core::WattError::UnknownKind(kind.to_string()))
}
