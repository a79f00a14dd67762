//! watt watch registry.
//!
//! A [`Watcher`] owns one reflector and local store per registered
//! (collection, namespace) pair. Every store mutation and every listener call
//! goes through one lock, so listeners never run concurrently with each other or
//! with a store write. Queries are served from the local stores only.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Instant;

use metrics::counter;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};
use watt_core::{names, CollectionKey, Resource, ResourceInfo, WattError, WattResult};
use watt_kubehub::{Connector, KubeHub, ResourceResolver};
use watt_store::{LocalStore, Notifier, Reflector};

mod entry;

use entry::{EntryNotifier, WatchEntry};

pub use watt_store::WatchConfig;

/// Change callback. Receives the registry itself; must not block.
pub type Listener = Arc<dyn Fn(&Watcher) + Send + Sync>;

/// Registry lifecycle. Moves forward only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Unstarted,
    Starting,
    Running,
    Stopped,
}

pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

fn read<T>(l: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    l.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(l: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    l.write().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) struct Inner {
    resolver: Arc<dyn ResourceResolver>,
    connector: Arc<dyn Connector>,
    config: WatchConfig,
    entries: RwLock<BTreeMap<CollectionKey, Arc<WatchEntry>>>,
    /// Serializes store mutations with listener calls.
    notify: Mutex<()>,
    phase_tx: watch::Sender<Phase>,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

impl Inner {
    pub(crate) fn phase(&self) -> Phase { *self.phase_tx.borrow() }

    pub(crate) fn entry(&self, key: &CollectionKey) -> Option<Arc<WatchEntry>> {
        read(&self.entries).get(key).cloned()
    }

    fn entries(&self) -> Vec<Arc<WatchEntry>> { read(&self.entries).values().cloned().collect() }
}

impl Drop for Inner {
    fn drop(&mut self) { self.cancel.cancel(); }
}

/// Watch registry: registration, lifecycle, queries and status write-through.
///
/// Cheap to clone; clones share the same registry.
#[derive(Clone)]
pub struct Watcher {
    pub(crate) inner: Arc<Inner>,
}

impl Watcher {
    pub fn new(resolver: Arc<dyn ResourceResolver>, connector: Arc<dyn Connector>, config: WatchConfig) -> Self {
        let (phase_tx, _) = watch::channel(Phase::Unstarted);
        Self {
            inner: Arc::new(Inner {
                resolver,
                connector,
                config,
                entries: RwLock::new(BTreeMap::new()),
                notify: Mutex::new(()),
                phase_tx,
                cancel: CancellationToken::new(),
                tracker: TaskTracker::new(),
            }),
        }
    }

    /// Registry over a single value that both resolves kinds and opens collections.
    pub fn with_hub<H>(hub: Arc<H>, config: WatchConfig) -> Self
    where
        H: ResourceResolver + Connector + 'static,
    {
        Self::new(hub.clone(), hub, config)
    }

    /// Connect to the current cluster (kubeconfig or in-cluster) and run discovery.
    pub async fn connect(config: WatchConfig) -> WattResult<Self> {
        let hub = KubeHub::connect().await?;
        Ok(Self::with_hub(Arc::new(hub), config))
    }

    pub fn phase(&self) -> Phase { self.inner.phase() }

    /// Keys of every registered watch, sorted.
    pub fn keys(&self) -> Vec<CollectionKey> { read(&self.inner.entries).keys().cloned().collect() }

    pub fn resolve(&self, kind: &str) -> WattResult<ResourceInfo> { self.inner.resolver.resolve(kind) }

    /// Watch `kind` across every namespace.
    pub fn watch<F>(&self, kind: &str, listener: F) -> WattResult<CollectionKey>
    where
        F: Fn(&Watcher) + Send + Sync + 'static,
    {
        self.watch_namespace("", kind, listener)
    }

    /// Watch `kind` in `namespace` (empty = all namespaces).
    ///
    /// Cluster-scoped kinds ignore the namespace. Registering an existing key adds
    /// the listener to that watch instead of opening a second one.
    pub fn watch_namespace<F>(&self, namespace: &str, kind: &str, listener: F) -> WattResult<CollectionKey>
    where
        F: Fn(&Watcher) + Send + Sync + 'static,
    {
        let info = self.inner.resolver.resolve(kind)?;
        let key = info.key(namespace);
        let listener: Listener = Arc::new(listener);

        let mut entries = write(&self.inner.entries);
        if self.phase() != Phase::Unstarted {
            return Err(WattError::AlreadyStarted(key.to_string()));
        }
        if let Some(existing) = entries.get(&key) {
            existing.add_listener(listener);
            debug!(gvr = %key, "watcher: listener added to existing watch");
            return Ok(key);
        }
        let collection = self.inner.connector.collection(&info, &key.namespace, &self.inner.config.selector)?;
        let store = Arc::new(LocalStore::new());
        let notifier = Arc::new(EntryNotifier { registry: Arc::downgrade(&self.inner), key: key.clone() });
        let reflector = Reflector::new(
            key.clone(),
            Arc::clone(&collection),
            Arc::clone(&store),
            notifier,
            self.inner.config.clone(),
        );
        let entry = WatchEntry::new(key.clone(), collection, store, reflector, listener);
        entries.insert(key.clone(), Arc::new(entry));
        info!(gvr = %key, "watcher: registered");
        Ok(key)
    }

    /// Start every reflector, wait until each one has stored its first listing,
    /// then invoke every listener once.
    ///
    /// Idempotent: later callers wait for the first one to finish.
    pub async fn start(&self) -> WattResult<()> {
        let mut claimed = false;
        self.inner.phase_tx.send_if_modified(|p| {
            if *p == Phase::Unstarted {
                *p = Phase::Starting;
                claimed = true;
            }
            claimed
        });
        if !claimed {
            return self.until_running().await;
        }

        let t0 = Instant::now();
        let entries = self.inner.entries();
        for entry in &entries {
            if let Some(reflector) = entry.take_reflector() {
                self.inner.tracker.spawn(reflector.run(self.inner.cancel.clone()));
            }
        }
        self.inner.tracker.close();
        info!(watches = entries.len(), "watcher: starting");

        if let Err(e) = self.until_synced(&entries).await {
            warn!(error = %e, "watcher: start failed");
            self.stop().await;
            return Err(e);
        }

        {
            let _guard = lock(&self.inner.notify);
            let promoted = self.inner.phase_tx.send_if_modified(|p| {
                if *p == Phase::Starting {
                    *p = Phase::Running;
                    return true;
                }
                false
            });
            if !promoted {
                return Err(WattError::Stopped);
            }
            for entry in &entries {
                entry.fire(self);
            }
        }
        info!(watches = entries.len(), took_ms = %t0.elapsed().as_millis(), "watcher: running");
        Ok(())
    }

    async fn until_synced(&self, entries: &[Arc<WatchEntry>]) -> WattResult<()> {
        let all_ready = async {
            for entry in entries {
                let mut ready = entry.ready.clone();
                tokio::select! {
                    _ = self.inner.cancel.cancelled() => return Err(WattError::Stopped),
                    r = ready.wait_for(|r| *r) => {
                        r.map_err(|_| WattError::ConnectionFailure(format!("{}: reflector exited before sync", entry.key)))?;
                    }
                }
            }
            Ok::<(), WattError>(())
        };
        let Some(limit) = self.inner.config.sync_timeout else {
            return all_ready.await;
        };
        match tokio::time::timeout(limit, all_ready).await {
            Ok(r) => r,
            Err(_) => {
                let pending: Vec<String> =
                    entries.iter().filter(|e| !e.is_ready()).map(|e| e.key.to_string()).collect();
                Err(WattError::ConnectionFailure(format!(
                    "not synced after {}ms: {}",
                    limit.as_millis(),
                    pending.join(", ")
                )))
            }
        }
    }

    async fn until_running(&self) -> WattResult<()> {
        let mut rx = self.inner.phase_tx.subscribe();
        let phase = match rx.wait_for(|p| matches!(p, Phase::Running | Phase::Stopped)).await {
            Ok(p) => *p,
            Err(_) => Phase::Stopped,
        };
        match phase {
            Phase::Running => Ok(()),
            _ => Err(WattError::Stopped),
        }
    }

    /// Cancel every reflector and return once all of them exited. Terminal.
    pub async fn stop(&self) {
        let previous = self.inner.phase_tx.send_replace(Phase::Stopped);
        self.inner.cancel.cancel();
        self.inner.tracker.close();
        self.inner.tracker.wait().await;
        if previous != Phase::Stopped {
            info!("watcher: stopped");
        }
    }

    /// Start (if needed), then block until every reflector exited.
    pub async fn wait(&self) -> WattResult<()> {
        match self.start().await {
            Ok(()) | Err(WattError::Stopped) => {}
            Err(e) => return Err(e),
        }
        self.inner.tracker.wait().await;
        Ok(())
    }

    /// Every cached object of `kind`, merged across namespaces and sorted.
    ///
    /// Empty for unknown or unwatched kinds.
    pub fn list(&self, kind: &str) -> Vec<Resource> {
        match self.inner.resolver.resolve(kind) {
            Ok(info) => self.list_collection(&info),
            Err(_) => Vec::new(),
        }
    }

    fn list_collection(&self, info: &ResourceInfo) -> Vec<Resource> {
        let key = info.key("");
        let entries: Vec<Arc<WatchEntry>> =
            read(&self.inner.entries).values().filter(|e| e.key.same_collection(&key)).cloned().collect();
        let mut merged = BTreeMap::new();
        for entry in entries {
            for obj in entry.store.list() {
                merged.insert(obj.key(), obj);
            }
        }
        merged.into_values().collect()
    }

    /// Cached object by qualified name (`name.namespace`), case-insensitive.
    ///
    /// For namespaced kinds a bare name means `name.default`. A dotted name that
    /// matches nothing is retried as a bare name in `default` (`ca.crt` is
    /// `ca.crt.default`). Returns an empty resource when nothing matches.
    pub fn get(&self, kind: &str, qname: &str) -> Resource {
        let Ok(info) = self.inner.resolver.resolve(kind) else {
            return Resource::new();
        };
        let wanted = names::default_qname(qname, info.namespaced);
        let fallback =
            (info.namespaced && wanted == qname).then(|| names::qualified_name(qname, names::DEFAULT_NAMESPACE));
        let items = self.list_collection(&info);
        let find = |target: &str| items.iter().find(|r| r.qname().eq_ignore_ascii_case(target)).cloned();
        find(&wanted).or_else(|| fallback.as_deref().and_then(find)).unwrap_or_default()
    }

    pub fn exists(&self, kind: &str, qname: &str) -> bool { !self.get(kind, qname).is_empty() }

    /// Canonical `TYPE` or `TYPE/NAME[.NAMESPACE]`; `None` for malformed input or unknown types.
    pub fn canonical(&self, name: &str) -> Option<String> {
        let (kind, object) = names::split_type_name(name)?;
        let info = self.inner.resolver.resolve(kind).ok()?;
        names::canonical_object(&info, object)
    }

    /// Write `resource.status` to the server and fold the result into the cache.
    ///
    /// The watch for the resource's own namespace is used, falling back to an
    /// all-namespaces watch of the same collection.
    pub async fn update_status(&self, resource: &Resource) -> WattResult<Resource> {
        let info = self.inner.resolver.resolve(&type_query(resource))?;
        let key = info.key(resource.namespace());
        let entry = self
            .inner
            .entry(&key)
            .or_else(|| self.inner.entry(&key.all_namespaces()))
            .ok_or_else(|| WattError::NoSuchWatch(key.to_string()))?;

        match entry.collection.update_status(resource).await {
            Ok(updated) => {
                counter!("watt_update_status_total", 1u64, "result" => "ok");
                debug!(gvr = %entry.key, obj = %updated.key(), rv = %updated.resource_version(), "watcher: status updated");
                let notifier = EntryNotifier { registry: Arc::downgrade(&self.inner), key: entry.key.clone() };
                let mut pending = Some(updated.clone());
                notifier.commit(&mut || {
                    if let Some(obj) = pending.take() {
                        entry.store.insert(obj);
                    }
                    false
                });
                Ok(updated)
            }
            Err(e) => {
                counter!("watt_update_status_total", 1u64, "result" => "error");
                warn!(gvr = %entry.key, obj = %resource.key(), error = %e, "watcher: status update failed");
                Err(match e {
                    WattError::RemoteRejected(_) => e,
                    other => WattError::RemoteRejected(other.to_string()),
                })
            }
        }
    }
}

/// Resolver query for a stored object: `kind.version.group` from its type meta.
fn type_query(resource: &Resource) -> String {
    let kind = resource.kind();
    match resource.api_version().split_once('/') {
        Some((group, version)) => format!("{kind}.{version}.{group}"),
        None if !resource.api_version().is_empty() => format!("{kind}.{}.", resource.api_version()),
        None => kind.to_string(),
    }
}
