//! watt store: the local mirror of one watched collection and the reflector that
//! keeps it in step with the server.

#![forbid(unsafe_code)]

use std::sync::Arc;

use arc_swap::ArcSwap;
use rustc_hash::FxHashMap;
use watt_core::{ObjectKey, Resource};

mod config;
mod reflector;

pub use config::{Backoff, WatchConfig};
pub use reflector::Reflector;

/// Serializes store mutations with the change callback.
///
/// `commit` runs `mutate` while holding the notification lock; when it returns
/// `true` the listener is invoked before the lock is released.
pub trait Notifier: Send + Sync {
    fn commit(&self, mutate: &mut dyn FnMut() -> bool);
}

/// Counts from replacing the whole store with a fresh listing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplaceStats {
    pub added: usize,
    pub changed: usize,
    pub removed: usize,
}

impl ReplaceStats {
    pub fn any(&self) -> bool { self.added + self.changed + self.removed > 0 }
}

#[derive(Default, Clone)]
struct Snapshot {
    epoch: u64,
    items: FxHashMap<ObjectKey, Arc<Resource>>,
}

/// Thread-safe table of the last known state of each object.
///
/// Readers load an immutable snapshot and never block writers.
pub struct LocalStore {
    snap: ArcSwap<Snapshot>,
}

impl Default for LocalStore {
    fn default() -> Self { Self::new() }
}

impl LocalStore {
    pub fn new() -> Self { Self { snap: ArcSwap::from_pointee(Snapshot::default()) } }

    /// Bumped on every mutation.
    pub fn epoch(&self) -> u64 { self.snap.load().epoch }

    pub fn len(&self) -> usize { self.snap.load().items.len() }

    pub fn is_empty(&self) -> bool { self.len() == 0 }

    /// Independent copy of the stored object.
    pub fn get(&self, key: &ObjectKey) -> Option<Resource> {
        self.snap.load().items.get(key).map(|r| Resource::clone(r))
    }

    pub fn version_of(&self, key: &ObjectKey) -> Option<String> {
        self.snap.load().items.get(key).map(|r| r.resource_version().to_string())
    }

    /// Copies of every object, ordered by namespace then name.
    pub fn list(&self) -> Vec<Resource> {
        let snap = self.snap.load();
        let mut keyed: Vec<(&ObjectKey, &Arc<Resource>)> = snap.items.iter().collect();
        keyed.sort_by(|a, b| a.0.cmp(b.0));
        keyed.into_iter().map(|(_, r)| Resource::clone(r)).collect()
    }

    pub fn insert(&self, obj: Resource) {
        let obj = Arc::new(obj);
        self.snap.rcu(|cur| {
            let mut next = Snapshot::clone(cur);
            next.epoch += 1;
            next.items.insert(obj.key(), Arc::clone(&obj));
            next
        });
    }

    pub fn remove(&self, key: &ObjectKey) -> Option<Resource> {
        let mut removed = None;
        self.snap.rcu(|cur| {
            let mut next = Snapshot::clone(cur);
            removed = next.items.remove(key);
            if removed.is_some() {
                next.epoch += 1;
            }
            next
        });
        removed.map(|r| Resource::clone(&r))
    }

    /// Swap in a fresh listing and report how it differs from the old contents.
    ///
    /// Objects are compared by version token only.
    pub fn replace_all(&self, items: Vec<Resource>) -> ReplaceStats {
        let fresh: FxHashMap<ObjectKey, Arc<Resource>> =
            items.into_iter().map(|r| (r.key(), Arc::new(r))).collect();
        let mut stats = ReplaceStats::default();
        self.snap.rcu(|cur| {
            stats = ReplaceStats::default();
            for (key, obj) in &fresh {
                match cur.items.get(key) {
                    None => stats.added += 1,
                    Some(old) if old.resource_version() != obj.resource_version() => stats.changed += 1,
                    Some(_) => {}
                }
            }
            stats.removed = cur.items.keys().filter(|k| !fresh.contains_key(*k)).count();
            Snapshot { epoch: cur.epoch + 1, items: fresh.clone() }
        });
        stats
    }
}
