//! In-memory cluster implementing the resolver, connector and collection traits.
//!
//! Every collection keeps an event log keyed by a monotonically increasing version
//! so a watch opened from an older listing token replays what it missed, like the
//! real API server does. Status updates produce a `modified` echo on open watches.
//! Field and label selectors are evaluated against each object as stored; an
//! object that stops matching simply stops being delivered.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::channel::mpsc::{unbounded, UnboundedSender};
use futures::StreamExt;
use serde_json::Value;
use tracing::debug;
use watt_core::{
    EventKind, ListResult, ObjectKey, Resource, ResourceInfo, Selector, WatchEvent, WattError, WattResult,
};

use crate::{resolve_in, Collection, Connector, ResourceResolver, WatchStream};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

type Subscriber = (View, UnboundedSender<WattResult<WatchEvent>>);

/// What one collection handle can see: a namespace (empty for all) and a selector.
#[derive(Clone, Default)]
struct View {
    namespace: String,
    selector: Selector,
}

impl View {
    fn matches(&self, obj: &Resource) -> bool {
        if !self.namespace.is_empty() && obj.namespace() != self.namespace {
            return false;
        }
        let labels = |key: &str| obj.as_map().get("metadata").and_then(|m| m.get("labels")).and_then(|l| l.get(key));
        let fields = |path: &str| {
            let mut cur = obj.as_map().get(path.split('.').next().unwrap_or_default());
            for part in path.split('.').skip(1) {
                cur = cur.and_then(|v| v.get(part));
            }
            cur
        };
        self.selector.labels.as_deref().map_or(true, |sel| selects(sel, labels))
            && self.selector.fields.as_deref().map_or(true, |sel| selects(sel, fields))
    }
}

/// Evaluate `a=b,c==d,e!=f` (a bare `a` requires presence) with `lookup` supplying values.
fn selects<'a>(selector: &str, lookup: impl Fn(&str) -> Option<&'a Value>) -> bool {
    let text = |v: Option<&Value>| match v {
        Some(Value::String(s)) => Some(s.clone()),
        Some(Value::Null) | None => None,
        Some(other) => Some(other.to_string()),
    };
    selector.split(',').map(str::trim).filter(|t| !t.is_empty()).all(|term| {
        if let Some((k, v)) = term.split_once("!=") {
            text(lookup(k.trim())).as_deref() != Some(v.trim())
        } else if let Some((k, v)) = term.split_once("==").or_else(|| term.split_once('=')) {
            text(lookup(k.trim())).as_deref() == Some(v.trim())
        } else {
            lookup(term).is_some()
        }
    })
}

#[derive(Default)]
struct BackendState {
    objects: BTreeMap<ObjectKey, Resource>,
    version: u64,
    log: Vec<(u64, EventKind, Resource)>,
    subscribers: Vec<Subscriber>,
    list_failures: usize,
    watch_failures: usize,
    reject_status: Option<String>,
    lists: usize,
    watches: usize,
}

/// Server-side state of one collection (all namespaces).
struct Backend {
    info: ResourceInfo,
    state: Mutex<BackendState>,
}

impl Backend {
    fn record(&self, st: &mut BackendState, kind: EventKind, obj: Resource) {
        st.log.push((st.version, kind, obj.clone()));
        st.subscribers.retain(|(view, tx)| {
            if !view.matches(&obj) {
                return !tx.is_closed();
            }
            tx.unbounded_send(Ok(WatchEvent::Change(kind, obj.clone()))).is_ok()
        });
    }

    fn stamp(st: &mut BackendState, obj: &mut Resource, info: &ResourceInfo) {
        st.version += 1;
        obj.fill_type_meta(info);
        let meta = obj
            .as_map_mut()
            .entry("metadata")
            .or_insert_with(|| Value::Object(Default::default()));
        if let Some(meta) = meta.as_object_mut() {
            meta.insert("resourceVersion".into(), Value::String(st.version.to_string()));
        }
    }
}

/// Fake cluster for tests and demos.
#[derive(Default)]
pub struct MockCluster {
    kinds: Mutex<Vec<ResourceInfo>>,
    backends: Mutex<BTreeMap<String, Arc<Backend>>>,
    resolves: AtomicUsize,
}

impl MockCluster {
    pub fn new() -> Self { Self::default() }

    /// Serve a new collection. Lookups resolve against kinds in registration order.
    pub fn with_kind(self, info: ResourceInfo) -> Self {
        self.add_kind(info);
        self
    }

    pub fn add_kind(&self, info: ResourceInfo) {
        lock(&self.backends).insert(
            info.plural.clone(),
            Arc::new(Backend { info: info.clone(), state: Mutex::new(BackendState::default()) }),
        );
        lock(&self.kinds).push(info);
    }

    fn backend(&self, plural: &str) -> WattResult<Arc<Backend>> {
        lock(&self.backends)
            .get(plural)
            .cloned()
            .ok_or_else(|| WattError::UnknownKind(plural.to_string()))
    }

    /// Create or replace an object; returns it as stored (with a fresh version).
    pub fn apply(&self, plural: &str, obj: Resource) -> WattResult<Resource> {
        let backend = self.backend(plural)?;
        let mut st = lock(&backend.state);
        let mut obj = obj;
        Backend::stamp(&mut st, &mut obj, &backend.info);
        let kind = if st.objects.insert(obj.key(), obj.clone()).is_some() { EventKind::Modified } else { EventKind::Added };
        backend.record(&mut st, kind, obj.clone());
        Ok(obj)
    }

    /// Delete an object. Deleting a missing object is a no-op returning `None`.
    pub fn delete(&self, plural: &str, namespace: &str, name: &str) -> WattResult<Option<Resource>> {
        let backend = self.backend(plural)?;
        let mut st = lock(&backend.state);
        let key = ObjectKey { namespace: namespace.to_string(), name: name.to_string() };
        let Some(mut obj) = st.objects.remove(&key) else { return Ok(None) };
        Backend::stamp(&mut st, &mut obj, &backend.info);
        backend.record(&mut st, EventKind::Deleted, obj.clone());
        Ok(Some(obj))
    }

    /// Deliver a `modified` event without changing the version, as a replayed echo would.
    pub fn replay_modified(&self, plural: &str, namespace: &str, name: &str) -> WattResult<()> {
        let backend = self.backend(plural)?;
        let mut st = lock(&backend.state);
        let key = ObjectKey { namespace: namespace.to_string(), name: name.to_string() };
        let obj = st.objects.get(&key).cloned().ok_or_else(|| WattError::Invalid(format!("no object {key}")))?;
        backend.record(&mut st, EventKind::Modified, obj);
        Ok(())
    }

    /// Server-side object, if present.
    pub fn object(&self, plural: &str, namespace: &str, name: &str) -> Option<Resource> {
        let backend = self.backend(plural).ok()?;
        let st = lock(&backend.state);
        st.objects.get(&ObjectKey { namespace: namespace.to_string(), name: name.to_string() }).cloned()
    }

    /// Close every open watch on a collection; reflectors see a clean end of stream.
    pub fn disconnect(&self, plural: &str) -> WattResult<()> {
        let backend = self.backend(plural)?;
        lock(&backend.state).subscribers.clear();
        Ok(())
    }

    /// Push a stream error into every open watch, then close them.
    pub fn break_watches(&self, plural: &str, message: &str) -> WattResult<()> {
        let backend = self.backend(plural)?;
        let mut st = lock(&backend.state);
        for (_, tx) in st.subscribers.drain(..) {
            let _ = tx.unbounded_send(Err(WattError::ConnectionFailure(message.to_string())));
        }
        Ok(())
    }

    /// Fail the next `n` list calls with a connection failure.
    pub fn fail_lists(&self, plural: &str, n: usize) -> WattResult<()> {
        lock(&self.backend(plural)?.state).list_failures = n;
        Ok(())
    }

    /// Fail the next `n` watch openings with a connection failure.
    pub fn fail_watches(&self, plural: &str, n: usize) -> WattResult<()> {
        lock(&self.backend(plural)?.state).watch_failures = n;
        Ok(())
    }

    /// Reject every status update on the collection with `message` (`None` to accept again).
    pub fn reject_status(&self, plural: &str, message: Option<&str>) -> WattResult<()> {
        lock(&self.backend(plural)?.state).reject_status = message.map(str::to_string);
        Ok(())
    }

    /// Number of list calls served so far.
    pub fn list_calls(&self, plural: &str) -> usize {
        self.backend(plural)
            .map(|b| {
                let n = lock(&b.state).lists;
                n
            })
            .unwrap_or(0)
    }

    /// Number of watches opened so far.
    pub fn watch_calls(&self, plural: &str) -> usize {
        self.backend(plural)
            .map(|b| {
                let n = lock(&b.state).watches;
                n
            })
            .unwrap_or(0)
    }

    /// Number of watches currently open.
    pub fn open_watches(&self, plural: &str) -> usize {
        self.backend(plural)
            .map(|b| {
                let n = lock(&b.state).subscribers.iter().filter(|(_, tx)| !tx.is_closed()).count();
                n
            })
            .unwrap_or(0)
    }

    /// Number of resolve calls served so far.
    pub fn resolve_calls(&self) -> usize { self.resolves.load(Ordering::Relaxed) }
}

impl ResourceResolver for MockCluster {
    fn resolve(&self, kind: &str) -> WattResult<ResourceInfo> {
        self.resolves.fetch_add(1, Ordering::Relaxed);
        resolve_in(&lock(&self.kinds), kind)
    }
}

impl Connector for MockCluster {
    fn collection(&self, info: &ResourceInfo, namespace: &str, selector: &Selector)
        -> WattResult<Arc<dyn Collection>> {
        let backend = self.backend(&info.plural)?;
        let namespace = if info.namespaced { namespace.to_string() } else { String::new() };
        Ok(Arc::new(MockCollection { backend, view: View { namespace, selector: selector.clone() } }))
    }
}

/// Namespace- and selector-filtered view of one backend.
struct MockCollection {
    backend: Arc<Backend>,
    view: View,
}

#[async_trait::async_trait]
impl Collection for MockCollection {
    async fn list(&self) -> WattResult<ListResult> {
        let mut st = lock(&self.backend.state);
        st.lists += 1;
        if st.list_failures > 0 {
            st.list_failures -= 1;
            return Err(WattError::ConnectionFailure(format!("{}: connection refused", self.backend.info.plural)));
        }
        let items = st.objects.values().filter(|o| self.view.matches(o)).cloned().collect();
        Ok(ListResult { items, resource_version: st.version.to_string() })
    }

    async fn watch(&self, resource_version: &str, _timeout_secs: u32) -> WattResult<WatchStream> {
        let from: u64 = resource_version
            .parse()
            .map_err(|_| WattError::Invalid(format!("bad resource version {resource_version:?}")))?;
        let mut st = lock(&self.backend.state);
        st.watches += 1;
        if st.watch_failures > 0 {
            st.watch_failures -= 1;
            return Err(WattError::ConnectionFailure(format!("{}: watch refused", self.backend.info.plural)));
        }
        let (tx, rx) = unbounded();
        for (version, kind, obj) in st.log.iter().filter(|(v, _, o)| *v > from && self.view.matches(o)) {
            debug!(version, kind = kind.as_str(), name = %obj.name(), "mock: replaying");
            let _ = tx.unbounded_send(Ok(WatchEvent::Change(*kind, obj.clone())));
        }
        st.subscribers.push((self.view.clone(), tx));
        Ok(rx.boxed())
    }

    async fn update_status(&self, resource: &Resource) -> WattResult<Resource> {
        let mut st = lock(&self.backend.state);
        if let Some(msg) = &st.reject_status {
            return Err(WattError::RemoteRejected(msg.clone()));
        }
        let key = resource.key();
        let Some(current) = st.objects.get(&key).cloned() else {
            return Err(WattError::RemoteRejected(format!("404 NotFound: {key}")));
        };
        if !resource.resource_version().is_empty() && resource.resource_version() != current.resource_version() {
            return Err(WattError::RemoteRejected(format!(
                "409 Conflict: {key} is at {}, update sent {}",
                current.resource_version(),
                resource.resource_version()
            )));
        }
        let mut updated = current;
        updated.set_status(resource.status().cloned().unwrap_or(Value::Null));
        Backend::stamp(&mut st, &mut updated, &self.backend.info);
        st.objects.insert(key, updated.clone());
        self.backend.record(&mut st, EventKind::Modified, updated.clone());
        Ok(updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn widgets() -> ResourceInfo {
        ResourceInfo {
            group: "example.io".into(),
            version: "v1".into(),
            plural: "widgets".into(),
            kind: "Widget".into(),
            namespaced: true,
        }
    }

    fn widget(ns: &str, name: &str) -> Resource {
        Resource::try_from(json!({ "metadata": { "name": name, "namespace": ns } })).unwrap()
    }

    #[tokio::test]
    async fn list_is_namespace_filtered_and_versioned() {
        let cluster = MockCluster::new().with_kind(widgets());
        cluster.apply("widgets", widget("a", "one")).unwrap();
        cluster.apply("widgets", widget("b", "two")).unwrap();
        let scoped = cluster.collection(&widgets(), "a", &Selector::default()).unwrap();
        let listing = scoped.list().await.unwrap();
        assert_eq!(listing.items.len(), 1);
        assert_eq!(listing.items[0].name(), "one");
        assert_eq!(listing.items[0].kind(), "Widget");
        assert_eq!(listing.resource_version, "2");
    }

    #[tokio::test]
    async fn watch_replays_from_version() {
        let cluster = MockCluster::new().with_kind(widgets());
        cluster.apply("widgets", widget("a", "one")).unwrap();
        let all = cluster.collection(&widgets(), "", &Selector::default()).unwrap();
        let rv = all.list().await.unwrap().resource_version;
        cluster.apply("widgets", widget("a", "two")).unwrap();
        let mut stream = all.watch(&rv, 60).await.unwrap();
        cluster.delete("widgets", "a", "one").unwrap();
        let first = stream.next().await.unwrap().unwrap();
        assert!(matches!(&first, WatchEvent::Change(EventKind::Added, r) if r.name() == "two"));
        let second = stream.next().await.unwrap().unwrap();
        assert!(matches!(&second, WatchEvent::Change(EventKind::Deleted, r) if r.name() == "one"));
        cluster.disconnect("widgets").unwrap();
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn status_update_bumps_version_and_echoes() {
        let cluster = MockCluster::new().with_kind(widgets());
        let stored = cluster.apply("widgets", widget("a", "one")).unwrap();
        let coll = cluster.collection(&widgets(), "a", &Selector::default()).unwrap();
        let mut stream = coll.watch(&stored.resource_version().to_string(), 60).await.unwrap();
        let mut body = stored.clone();
        body.set_status(json!({ "ready": true }));
        let updated = coll.update_status(&body).await.unwrap();
        assert_ne!(updated.resource_version(), stored.resource_version());
        assert_eq!(updated.status(), Some(&json!({ "ready": true })));
        match stream.next().await.unwrap().unwrap() {
            WatchEvent::Change(EventKind::Modified, echo) => {
                assert_eq!(echo.resource_version(), updated.resource_version())
            }
            other => panic!("unexpected event {other:?}"),
        }
        // stale version now conflicts
        assert!(matches!(coll.update_status(&body).await, Err(WattError::RemoteRejected(_))));
    }

    #[tokio::test]
    async fn injected_failures_are_consumed() {
        let cluster = MockCluster::new().with_kind(widgets());
        cluster.fail_lists("widgets", 1).unwrap();
        let coll = cluster.collection(&widgets(), "", &Selector::default()).unwrap();
        assert!(matches!(coll.list().await, Err(WattError::ConnectionFailure(_))));
        assert!(coll.list().await.is_ok());
        assert_eq!(cluster.list_calls("widgets"), 2);
    }

    fn labelled(ns: &str, name: &str, tier: &str, phase: &str) -> Resource {
        Resource::try_from(json!({
            "metadata": { "name": name, "namespace": ns, "labels": { "tier": tier } },
            "status": { "phase": phase },
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn selectors_filter_listing_and_watch() {
        let cluster = MockCluster::new().with_kind(widgets());
        cluster.apply("widgets", labelled("a", "web-1", "web", "Running")).unwrap();
        cluster.apply("widgets", labelled("a", "db-1", "db", "Running")).unwrap();
        cluster.apply("widgets", labelled("b", "web-2", "web", "Pending")).unwrap();

        let web = Selector::new(None, Some("tier=web".into()));
        let coll = cluster.collection(&widgets(), "", &web).unwrap();
        let listing = coll.list().await.unwrap();
        let names: Vec<&str> = listing.items.iter().map(|r| r.name()).collect();
        assert_eq!(names, vec!["web-1", "web-2"]);

        let running_web = Selector::new(Some("status.phase==Running".into()), Some("tier=web".into()));
        let coll = cluster.collection(&widgets(), "", &running_web).unwrap();
        assert_eq!(coll.list().await.unwrap().items.len(), 1);

        let not_web = Selector::new(Some("metadata.namespace=a".into()), Some("tier!=web".into()));
        let coll = cluster.collection(&widgets(), "", &not_web).unwrap();
        let mut stream = coll.watch(&listing.resource_version, 60).await.unwrap();
        cluster.apply("widgets", labelled("a", "web-3", "web", "Running")).unwrap();
        cluster.apply("widgets", labelled("b", "db-2", "db", "Running")).unwrap();
        cluster.apply("widgets", labelled("a", "db-3", "db", "Running")).unwrap();
        let first = stream.next().await.unwrap().unwrap();
        assert!(matches!(&first, WatchEvent::Change(EventKind::Added, r) if r.name() == "db-3"));
    }

    #[test]
    fn bare_selector_term_requires_presence() {
        let obj = labelled("a", "x", "web", "Running");
        let labels = |k: &str| obj.as_map().get("metadata").and_then(|m| m.get("labels")).and_then(|l| l.get(k));
        assert!(selects("tier", labels));
        assert!(!selects("zone", labels));
        assert!(selects("zone!=east", labels));
        assert!(selects("", labels));
    }
}
