//! Local fallback counter store.
//!
//! Fixed-window counters kept in process memory, used when no distributed
//! backend is configured or when a fail-open policy loses its backend. All
//! requests inside one window are counted together and the count drops to
//! zero at the boundary, so up to twice the threshold can pass around a
//! boundary. Counters are not shared between processes.

use chrono::{DateTime, TimeDelta, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use super::clock::Clock;

/// Counter state for one policy key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterEntry {
    /// Requests seen in the current window
    pub count: u64,
    /// End of the current window
    pub reset_at: DateTime<Utc>,
}

impl CounterEntry {
    fn fresh(now: DateTime<Utc>, window: TimeDelta) -> Self {
        Self {
            count: 0,
            reset_at: now + window,
        }
    }

    /// The window is inclusive of `reset_at` itself.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.reset_at
    }
}

/// In-process fixed-window counter map.
///
/// Increments lock only the shard holding the key, so concurrent requests for
/// the same key never lose an update.
pub struct LocalStore {
    entries: DashMap<String, CounterEntry>,
    clock: Arc<dyn Clock>,
    sweep_interval: TimeDelta,
    last_sweep: Mutex<DateTime<Utc>>,
}

impl LocalStore {
    pub fn new(clock: Arc<dyn Clock>, sweep_interval: Duration) -> Self {
        let now = clock.now();
        Self {
            entries: DashMap::new(),
            sweep_interval: TimeDelta::from_std(sweep_interval).unwrap_or(TimeDelta::seconds(60)),
            last_sweep: Mutex::new(now),
            clock,
        }
    }

    /// Count one request against `key` and return the updated entry.
    pub fn increment(&self, key: &str, window: TimeDelta) -> CounterEntry {
        let now = self.clock.now();
        self.maybe_sweep(now);

        let mut entry = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| CounterEntry::fresh(now, window));

        if entry.is_expired(now) {
            trace!(key = %key, "Local window elapsed, starting a new one");
            *entry = CounterEntry::fresh(now, window);
        }
        entry.count += 1;

        *entry
    }

    /// Current count for `key`, evicting the entry if its window has passed.
    pub fn read(&self, key: &str) -> u64 {
        let now = self.clock.now();

        match self.entries.get(key) {
            Some(entry) if !entry.is_expired(now) => return entry.count,
            Some(_) => {}
            None => return 0,
        }

        self.entries.remove_if(key, |_, entry| entry.is_expired(now));
        0
    }

    /// Snapshot of the live entry for `key`, if any.
    pub fn entry(&self, key: &str) -> Option<CounterEntry> {
        let now = self.clock.now();
        self.entries
            .get(key)
            .map(|entry| *entry)
            .filter(|entry| !entry.is_expired(now))
    }

    /// Remove every entry whose window has passed. Returns how many went.
    pub fn evict_expired(&self) -> usize {
        let now = self.clock.now();
        *self.last_sweep.lock() = now;
        self.evict_at(now)
    }

    fn evict_at(&self, now: DateTime<Utc>) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired(now));
        let removed = before.saturating_sub(self.entries.len());

        if removed > 0 {
            debug!(removed = removed, remaining = self.entries.len(), "Evicted expired local counters");
        }
        removed
    }

    fn maybe_sweep(&self, now: DateTime<Utc>) {
        let due = {
            let mut last = self.last_sweep.lock();
            if now - *last >= self.sweep_interval {
                *last = now;
                true
            } else {
                false
            }
        };

        if due {
            self.evict_at(now);
        }
    }

    /// Drop every counter.
    ///
    /// This is primarily useful for testing.
    pub fn clear(&self) {
        self.entries.clear();
    }

    /// Drop the counters whose key starts with `prefix`, leaving others intact.
    pub fn clear_by_prefix(&self, prefix: &str) -> usize {
        let before = self.entries.len();
        self.entries.retain(|key, _| !key.starts_with(prefix));
        before.saturating_sub(self.entries.len())
    }

    /// Number of tracked keys, expired or not.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Run [`evict_expired`](Self::evict_expired) on a timer until the store
    /// is dropped.
    pub fn spawn_sweeper(store: &Arc<LocalStore>, interval: Duration) -> JoinHandle<()> {
        let store = Arc::downgrade(store);
        let interval = interval.max(Duration::from_millis(1));

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;

            loop {
                ticker.tick().await;
                let Some(store) = store.upgrade() else {
                    break;
                };
                store.evict_expired();
            }
        })
    }
}

impl std::fmt::Debug for LocalStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalStore")
            .field("entries", &self.entries.len())
            .field("sweep_interval", &self.sweep_interval)
            .finish_non_exhaustive()
    }
}
