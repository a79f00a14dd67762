//! List-then-watch loop for one collection.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::StreamExt;
use metrics::{counter, histogram};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use watt_core::{CollectionKey, EventKind, Resource, WatchEvent};
use watt_kubehub::Collection;

use crate::{Backoff, LocalStore, Notifier, ReplaceStats, WatchConfig};

/// Why a watch connection stopped being read.
enum StreamEnd {
    Cancelled,
    Closed,
    Failed,
    Resync,
}

/// Keeps one [`LocalStore`] in step with one collection.
pub struct Reflector {
    key: CollectionKey,
    collection: Arc<dyn Collection>,
    store: Arc<LocalStore>,
    notifier: Arc<dyn Notifier>,
    config: WatchConfig,
    ready_tx: watch::Sender<bool>,
}

impl Reflector {
    pub fn new(
        key: CollectionKey,
        collection: Arc<dyn Collection>,
        store: Arc<LocalStore>,
        notifier: Arc<dyn Notifier>,
        config: WatchConfig,
    ) -> Self {
        let (ready_tx, _) = watch::channel(false);
        Self { key, collection, store, notifier, config, ready_tx }
    }

    /// Flips to `true` once the first listing is stored; never reverts.
    pub fn readiness(&self) -> watch::Receiver<bool> { self.ready_tx.subscribe() }

    /// Run until `cancel` fires. Connection problems are retried, never returned.
    pub async fn run(self, cancel: CancellationToken) {
        let mut backoff = Backoff::new(self.config.backoff_initial, self.config.backoff_max);
        info!(gvr = %self.key, "reflector: started");
        loop {
            let t0 = Instant::now();
            let listed = tokio::select! {
                _ = cancel.cancelled() => break,
                r = self.collection.list() => r,
            };
            let listing = match listed {
                Ok(l) => l,
                Err(e) => {
                    counter!("watt_list_errors_total", 1u64);
                    let delay = backoff.next_delay();
                    warn!(gvr = %self.key, error = %e, retry_ms = %delay.as_millis(), "reflector: list failed");
                    if sleep_or_cancel(&cancel, delay).await {
                        break;
                    }
                    continue;
                }
            };
            counter!("watt_list_total", 1u64);
            histogram!("watt_list_ms", t0.elapsed().as_secs_f64() * 1000.0);
            backoff.reset();

            let count = listing.items.len();
            let stats = self.apply_listing(listing.items);
            if !*self.ready_tx.borrow() {
                info!(gvr = %self.key, items = count, took_ms = %t0.elapsed().as_millis(), "reflector: synced");
            } else {
                debug!(gvr = %self.key, added = stats.added, changed = stats.changed, removed = stats.removed, "reflector: relisted");
            }
            self.ready_tx.send_replace(true);

            let resync_at = tokio::time::Instant::now() + self.config.resync_interval;
            match self.watch_from(&listing.resource_version, resync_at, &cancel).await {
                StreamEnd::Cancelled => break,
                StreamEnd::Resync => {
                    counter!("watt_resync_total", 1u64);
                    debug!(gvr = %self.key, "reflector: periodic resync");
                }
                StreamEnd::Closed => debug!(gvr = %self.key, "reflector: watch closed, relisting"),
                StreamEnd::Failed => {
                    if sleep_or_cancel(&cancel, backoff.next_delay()).await {
                        break;
                    }
                }
            }
        }
        info!(gvr = %self.key, "reflector: stopped");
    }

    /// Open one watch from the listing token `rv` and apply its events until it ends.
    ///
    /// Every reconnect goes through a fresh listing, so later tokens seen on the
    /// stream are never reused.
    async fn watch_from(&self, rv: &str, resync_at: tokio::time::Instant, cancel: &CancellationToken) -> StreamEnd {
        let remaining = resync_at.saturating_duration_since(tokio::time::Instant::now());
        let remaining = u32::try_from(remaining.as_secs()).unwrap_or(u32::MAX);
        let timeout = self.config.watch_timeout_secs().min(remaining).max(1);
        let opened = tokio::select! {
            _ = cancel.cancelled() => return StreamEnd::Cancelled,
            r = self.collection.watch(rv, timeout) => r,
        };
        let mut stream = match opened {
            Ok(s) => s,
            Err(e) => {
                warn!(gvr = %self.key, error = %e, rv = %rv, "reflector: watch open failed");
                return StreamEnd::Failed;
            }
        };
        let resync = tokio::time::sleep_until(resync_at);
        tokio::pin!(resync);
        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => return StreamEnd::Cancelled,
                _ = &mut resync => return StreamEnd::Resync,
                ev = stream.next() => ev,
            };
            match next {
                None => return StreamEnd::Closed,
                Some(Err(e)) => {
                    warn!(gvr = %self.key, error = %e, from = %rv, "reflector: watch stream error");
                    return StreamEnd::Failed;
                }
                Some(Ok(WatchEvent::Bookmark { resource_version })) => {
                    debug!(gvr = %self.key, rv = %resource_version, "reflector: bookmark");
                }
                Some(Ok(WatchEvent::Change(kind, obj))) => self.apply_event(kind, obj),
            }
        }
    }

    /// Run `mutate` against the store under the notifier; returns whether it changed anything.
    fn commit(&self, mutate: impl FnOnce(&LocalStore) -> bool) -> bool {
        let mut once = Some(mutate);
        let mut changed = false;
        self.notifier.commit(&mut || {
            changed = once.take().map(|f| f(self.store.as_ref())).unwrap_or(false);
            changed
        });
        changed
    }

    fn apply_listing(&self, items: Vec<Resource>) -> ReplaceStats {
        let mut stats = ReplaceStats::default();
        self.commit(|store| {
            stats = store.replace_all(items);
            stats.any()
        });
        stats
    }

    fn apply_event(&self, kind: EventKind, obj: Resource) {
        counter!("watt_watch_events_total", 1u64, "event" => kind.as_str());
        let key = obj.key();
        match kind {
            EventKind::Added => {
                self.commit(|store| {
                    store.insert(obj);
                    true
                });
            }
            EventKind::Deleted => {
                self.commit(|store| {
                    store.remove(&key);
                    true
                });
            }
            EventKind::Modified => {
                let rv = obj.resource_version().to_string();
                let applied = self.commit(|store| {
                    if !rv.is_empty() && store.version_of(&key).as_deref() == Some(rv.as_str()) {
                        return false;
                    }
                    store.insert(obj);
                    true
                });
                if !applied {
                    counter!("watt_watch_suppressed_total", 1u64);
                    debug!(gvr = %self.key, obj = %key, rv = %rv, "reflector: duplicate modified suppressed");
                }
            }
        }
    }
}

/// Sleep for `delay`; `true` when cancelled first.
async fn sleep_or_cancel(cancel: &CancellationToken, delay: Duration) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => true,
        _ = tokio::time::sleep(delay) => false,
    }
}
