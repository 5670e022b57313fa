//! Concurrent key-value store with per-entry time-to-live.
//!
//! Expired entries are invisible to lookups immediately and are reclaimed by
//! a periodic sweep task owned by the store. The map is sharded, so a call
//! only ever holds the lock of the shard its key lives in.

use std::borrow::Borrow;
use std::hash::Hash;
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::error::{GateError, Result};

/// A stored value together with the instant it stops being visible.
#[derive(Debug)]
struct TimedEntry<V> {
    value: V,
    expires_at: Instant,
}

impl<V> TimedEntry<V> {
    fn new(value: V, now: Instant, ttl: Duration) -> Self {
        Self {
            value,
            expires_at: now + ttl,
        }
    }

    fn is_live(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

/// Handle to the running sweep task.
struct Sweeper {
    shutdown: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

/// A concurrent map whose entries expire after a per-entry TTL.
pub struct ExpiringStore<K, V> {
    entries: Arc<DashMap<K, TimedEntry<V>>>,
    cleanup_interval: Duration,
    sweeper: Mutex<Option<Sweeper>>,
}

impl<K, V> ExpiringStore<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Create an empty store swept every `cleanup_interval` once started.
    pub fn new(cleanup_interval: Duration) -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            cleanup_interval,
            sweeper: Mutex::new(None),
        }
    }

    /// Insert or replace the entry for `key`, visible for `ttl` from now.
    pub fn set(&self, key: K, value: V, ttl: Duration) {
        let now = Instant::now();
        self.entries.insert(key, TimedEntry::new(value, now, ttl));
    }

    /// Get a live value. Does not extend its TTL.
    pub fn get<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let now = Instant::now();
        self.entries
            .get(key)
            .filter(|entry| entry.is_live(now))
            .map(|entry| entry.value.clone())
    }

    /// Whether a live entry exists for `key`.
    pub fn contains<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let now = Instant::now();
        self.entries
            .get(key)
            .is_some_and(|entry| entry.is_live(now))
    }

    /// Remove the entry for `key` whether or not it has expired.
    ///
    /// Returns the removed value; removing an absent key is a no-op.
    pub fn remove<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.entries.remove(key).map(|(_, entry)| entry.value)
    }

    /// Return the live value for `key` and push its expiry to `now + ttl`,
    /// or insert the value produced by `make` if there is none.
    ///
    /// The lookup, refresh and insert happen under the key's shard lock, so
    /// concurrent callers for the same key always observe a single value.
    pub fn get_or_insert_with<F>(&self, key: K, ttl: Duration, make: F) -> V
    where
        F: FnOnce() -> V,
    {
        let now = Instant::now();
        match self.entries.entry(key) {
            Entry::Occupied(mut occupied) => {
                let entry = occupied.get_mut();
                if !entry.is_live(now) {
                    entry.value = make();
                }
                entry.expires_at = now + ttl;
                entry.value.clone()
            }
            Entry::Vacant(vacant) => {
                let value = make();
                vacant.insert(TimedEntry::new(value.clone(), now, ttl));
                value
            }
        }
    }

    /// Evict every expired entry, returning how many were removed.
    pub fn sweep(&self) -> usize {
        sweep_entries(&self.entries, Instant::now())
    }

    /// Number of stored entries, including expired ones not yet swept.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Number of entries that are still visible to lookups.
    ///
    /// Scans the whole map, holding each shard's read lock while that shard
    /// is visited; use [`len`](Self::len) on hot paths.
    pub fn live_len(&self) -> usize {
        let now = Instant::now();
        self.entries.iter().filter(|e| e.is_live(now)).count()
    }

    /// Whether the store holds no entries at all.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Interval between background sweeps.
    pub fn cleanup_interval(&self) -> Duration {
        self.cleanup_interval
    }

    /// Whether the background sweep task is running.
    pub fn is_sweeping(&self) -> bool {
        self.sweeper
            .lock()
            .as_ref()
            .is_some_and(|s| !s.handle.is_finished())
    }

    /// Spawn the periodic sweep on the current tokio runtime.
    ///
    /// Calling `start` while the sweep is already running does nothing.
    pub fn start(&self) -> Result<()> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| GateError::Runtime(format!("cannot start store sweep: {}", e)))?;

        let mut sweeper = self.sweeper.lock();
        if sweeper.as_ref().is_some_and(|s| !s.handle.is_finished()) {
            warn!("Store sweep already running");
            return Ok(());
        }

        let (shutdown, shutdown_rx) = oneshot::channel();
        let entries = Arc::downgrade(&self.entries);
        let handle = runtime.spawn(run_sweeper(entries, self.cleanup_interval, shutdown_rx));

        info!(
            cleanup_interval_secs = self.cleanup_interval.as_secs_f64(),
            "Store sweep started"
        );

        *sweeper = Some(Sweeper { shutdown, handle });
        Ok(())
    }

    /// Stop the background sweep and wait for the task to finish.
    pub async fn stop(&self) {
        let sweeper = self.sweeper.lock().take();
        let Some(Sweeper { shutdown, handle }) = sweeper else {
            return;
        };

        // The task may already be gone if the runtime is shutting down.
        let _ = shutdown.send(());
        if let Err(e) = handle.await {
            warn!(error = %e, "Store sweep task ended abnormally");
        }
        info!("Store sweep stopped");
    }
}

impl<K, V> Drop for ExpiringStore<K, V> {
    fn drop(&mut self) {
        if let Some(sweeper) = self.sweeper.get_mut().take() {
            sweeper.handle.abort();
        }
    }
}

impl<K: Eq + Hash, V> std::fmt::Debug for ExpiringStore<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExpiringStore")
            .field("entries", &self.entries.len())
            .field("cleanup_interval", &self.cleanup_interval)
            .finish()
    }
}

/// Two-phase eviction: collect expired keys, then remove each one only if
/// it is still expired, so an entry refreshed in between is kept.
///
/// The collection phase read-locks one shard at a time; writers to that
/// shard wait for its scan, writers to other shards do not.
fn sweep_entries<K, V>(entries: &DashMap<K, TimedEntry<V>>, now: Instant) -> usize
where
    K: Eq + Hash + Clone,
{
    let expired: Vec<K> = entries
        .iter()
        .filter(|entry| !entry.is_live(now))
        .map(|entry| entry.key().clone())
        .collect();

    expired
        .iter()
        .filter(|key| entries.remove_if(*key, |_, entry| !entry.is_live(now)).is_some())
        .count()
}

async fn run_sweeper<K, V>(
    entries: Weak<DashMap<K, TimedEntry<V>>>,
    period: Duration,
    mut shutdown: oneshot::Receiver<()>,
) where
    K: Eq + Hash + Clone,
{
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            _ = ticker.tick() => {
                let Some(entries) = entries.upgrade() else {
                    break;
                };
                let evicted = sweep_entries(&entries, Instant::now());
                debug!(
                    evicted = evicted,
                    remaining = entries.len(),
                    "Swept expired entries"
                );
            }
        }
    }
}
