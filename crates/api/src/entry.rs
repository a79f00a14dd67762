use std::sync::{Arc, Mutex, Weak};

use metrics::counter;
use tokio::sync::watch;
use watt_core::CollectionKey;
use watt_kubehub::Collection;
use watt_store::{LocalStore, Notifier, Reflector};

use crate::{lock, Inner, Listener, Phase, Watcher};

/// One tracked (collection, namespace) pair.
pub(crate) struct WatchEntry {
    pub key: CollectionKey,
    pub collection: Arc<dyn Collection>,
    pub store: Arc<LocalStore>,
    pub ready: watch::Receiver<bool>,
    listeners: Mutex<Vec<Listener>>,
    /// Taken by `start`.
    reflector: Mutex<Option<Reflector>>,
}

impl WatchEntry {
    pub fn new(
        key: CollectionKey,
        collection: Arc<dyn Collection>,
        store: Arc<LocalStore>,
        reflector: Reflector,
        listener: Listener,
    ) -> Self {
        let ready = reflector.readiness();
        Self {
            key,
            collection,
            store,
            ready,
            listeners: Mutex::new(vec![listener]),
            reflector: Mutex::new(Some(reflector)),
        }
    }

    pub fn add_listener(&self, listener: Listener) { lock(&self.listeners).push(listener); }

    pub fn take_reflector(&self) -> Option<Reflector> { lock(&self.reflector).take() }

    pub fn is_ready(&self) -> bool { *self.ready.borrow() }

    /// Invoke every listener. Callers hold the registry's notify lock.
    pub fn fire(&self, watcher: &Watcher) {
        let listeners = lock(&self.listeners).clone();
        counter!("watt_notify_total", 1u64);
        for listener in listeners {
            listener(watcher);
        }
    }
}

/// Routes a reflector's store mutations through the registry's notify lock.
///
/// Holds the registry weakly: reflectors live inside it.
pub(crate) struct EntryNotifier {
    pub registry: Weak<Inner>,
    pub key: CollectionKey,
}

impl Notifier for EntryNotifier {
    fn commit(&self, mutate: &mut dyn FnMut() -> bool) {
        let Some(inner) = self.registry.upgrade() else {
            mutate();
            return;
        };
        let _guard = lock(&inner.notify);
        if !mutate() || inner.phase() != Phase::Running {
            return;
        }
        let entry = inner.entry(&self.key);
        if let Some(entry) = entry {
            entry.fire(&Watcher { inner: Arc::clone(&inner) });
        }
    }
}
