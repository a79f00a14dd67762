use std::time::Duration;

use watt_core::Selector;
use watt_kubehub::MAX_WATCH_TIMEOUT_SECS;

/// Tunables for every reflector owned by one registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchConfig {
    /// Forced re-list period.
    pub resync_interval: Duration,
    /// Server-side timeout requested for each watch connection, at most
    /// [`MAX_WATCH_TIMEOUT_SECS`].
    pub watch_timeout: Duration,
    pub backoff_initial: Duration,
    pub backoff_max: Duration,
    /// Upper bound for the start barrier; `None` waits forever.
    pub sync_timeout: Option<Duration>,
    /// Field and label selectors applied to every watched collection.
    pub selector: Selector,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            resync_interval: Duration::from_secs(300),
            watch_timeout: Duration::from_secs(290),
            backoff_initial: Duration::from_millis(500),
            backoff_max: Duration::from_secs(30),
            sync_timeout: None,
            selector: Selector::default(),
        }
    }
}

impl WatchConfig {
    /// Defaults overridden by `WATT_RELIST_SECS`, `WATT_WATCH_TIMEOUT_SECS`,
    /// `WATT_WATCH_BACKOFF_MAX_SECS`, `WATT_SYNC_TIMEOUT_SECS`,
    /// `WATT_FIELD_SELECTOR` and `WATT_LABEL_SELECTOR`.
    pub fn from_env() -> Self { Self::from_lookup(|name| std::env::var(name).ok()) }

    /// Same as [`WatchConfig::from_env`] with variables read through `var`.
    pub fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Self {
        let secs = |name: &str| var(name).and_then(|s| s.trim().parse::<u64>().ok());
        let mut cfg = Self::default();
        if let Some(s) = secs("WATT_RELIST_SECS").filter(|s| *s > 0) {
            cfg.resync_interval = Duration::from_secs(s);
        }
        if let Some(s) = secs("WATT_WATCH_TIMEOUT_SECS").filter(|s| *s > 0) {
            cfg.watch_timeout = Duration::from_secs(s.min(u64::from(MAX_WATCH_TIMEOUT_SECS)));
        }
        if let Some(s) = secs("WATT_WATCH_BACKOFF_MAX_SECS") {
            cfg.backoff_max = Duration::from_secs(s).max(cfg.backoff_initial);
        }
        cfg.sync_timeout = secs("WATT_SYNC_TIMEOUT_SECS").map(Duration::from_secs);
        cfg.selector = Selector::new(var("WATT_FIELD_SELECTOR"), var("WATT_LABEL_SELECTOR"));
        cfg
    }

    /// Watch timeout in whole seconds as sent to the server.
    pub fn watch_timeout_secs(&self) -> u32 {
        u32::try_from(self.watch_timeout.as_secs()).unwrap_or(u32::MAX).clamp(1, MAX_WATCH_TIMEOUT_SECS)
    }
}

/// Capped exponential retry delay.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self { initial, max: max.max(initial), current: initial }
    }

    /// Delay to wait now; doubles the following one up to the cap.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = self.current.saturating_mul(2).min(self.max);
        delay
    }

    pub fn reset(&mut self) { self.current = self.initial; }
}
