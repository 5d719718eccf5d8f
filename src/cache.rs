//! Bounded TTL caches for secondary lookups.
//!
//! Entries expire a fixed time after they were written, no matter how
//! often they are read. When a cache is full, a write of a new key evicts
//! the entry with the oldest write timestamp (not the least recently
//! read one). Expired entries are dropped lazily on read; a background
//! purge task started by [`TtlCache::init`] sweeps the rest.
//!
//! # Example
//!
//! ```
//! use blaze_client::cache::{CacheConfig, TtlCache};
//!
//! let cache: TtlCache<u64, String> = TtlCache::new(CacheConfig::groups());
//! cache.put(7, "group".to_string());
//! assert_eq!(cache.get(&7).as_deref(), Some("group"));
//! ```

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Player stats entries live this long.
pub const DEFAULT_PLAYER_TTL: Duration = Duration::from_secs(1800);

/// Player cache capacity.
pub const DEFAULT_PLAYER_CAPACITY: usize = 1000;

/// Player cache purge interval.
pub const DEFAULT_PLAYER_PURGE_INTERVAL: Duration = Duration::from_secs(60);

/// Group entries live this long.
pub const DEFAULT_GROUP_TTL: Duration = Duration::from_secs(600);

/// Group cache capacity.
pub const DEFAULT_GROUP_CAPACITY: usize = 500;

/// Group cache purge interval.
pub const DEFAULT_GROUP_PURGE_INTERVAL: Duration = Duration::from_secs(120);

/// Configuration for one [`TtlCache`].
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Name used in logs.
    pub name: &'static str,
    /// Lifetime of an entry.
    pub ttl: Duration,
    /// Maximum number of entries.
    pub capacity: usize,
    /// Interval of the background purge.
    pub purge_interval: Duration,
}

impl CacheConfig {
    /// Settings for per-player stats.
    pub fn players() -> Self {
        Self {
            name: "players",
            ttl: DEFAULT_PLAYER_TTL,
            capacity: DEFAULT_PLAYER_CAPACITY,
            purge_interval: DEFAULT_PLAYER_PURGE_INTERVAL,
        }
    }

    /// Settings for per-player groups.
    pub fn groups() -> Self {
        Self {
            name: "groups",
            ttl: DEFAULT_GROUP_TTL,
            capacity: DEFAULT_GROUP_CAPACITY,
            purge_interval: DEFAULT_GROUP_PURGE_INTERVAL,
        }
    }

    /// Set the entry lifetime.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Set the capacity (at least 1).
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity.max(1);
        self
    }

    /// Set the purge interval.
    pub fn with_purge_interval(mut self, interval: Duration) -> Self {
        self.purge_interval = interval;
        self
    }
}

/// Counters of one cache.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub capacity: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expired: u64,
}

struct Entry<V> {
    value: V,
    stored_at: Instant,
}

struct Store<K, V> {
    entries: HashMap<K, Entry<V>>,
    hits: u64,
    misses: u64,
    evictions: u64,
    expired: u64,
}

impl<K, V> Store<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    fn lookup(&mut self, key: &K, ttl: Duration, now: Instant) -> Option<V> {
        let fresh = match self.entries.get(key) {
            Some(entry) => now.duration_since(entry.stored_at) < ttl,
            None => {
                self.misses += 1;
                return None;
            }
        };
        if !fresh {
            self.entries.remove(key);
            self.expired += 1;
            self.misses += 1;
            return None;
        }
        self.hits += 1;
        self.entries.get(key).map(|entry| entry.value.clone())
    }

    fn store(&mut self, key: K, value: V, capacity: usize, now: Instant) {
        if !self.entries.contains_key(&key) && self.entries.len() >= capacity {
            let oldest = self
                .entries
                .iter()
                .min_by_key(|(_, entry)| entry.stored_at)
                .map(|(key, _)| key.clone());
            if let Some(oldest) = oldest {
                self.entries.remove(&oldest);
                self.evictions += 1;
            }
        }
        self.entries.insert(
            key,
            Entry {
                value,
                stored_at: now,
            },
        );
    }
}

struct Shared<K, V> {
    config: CacheConfig,
    store: Mutex<Store<K, V>>,
}

impl<K, V> Shared<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let ttl = self.config.ttl;
        let mut store = self.store.lock();
        let before = store.entries.len();
        store
            .entries
            .retain(|_, entry| now.duration_since(entry.stored_at) < ttl);
        let purged = before - store.entries.len();
        store.expired += purged as u64;
        purged
    }
}

/// A bounded key → value cache with time-based expiry.
pub struct TtlCache<K, V> {
    shared: Arc<Shared<K, V>>,
    purge_task: Mutex<Option<JoinHandle<()>>>,
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Create an empty cache. No background task runs until [`init`](Self::init).
    pub fn new(config: CacheConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                store: Mutex::new(Store {
                    entries: HashMap::new(),
                    hits: 0,
                    misses: 0,
                    evictions: 0,
                    expired: 0,
                }),
            }),
            purge_task: Mutex::new(None),
        }
    }

    /// Start the background purge. Idempotent; needs a tokio runtime.
    pub fn init(&self) {
        let mut task = self.purge_task.lock();
        if task.as_ref().is_some_and(|t| !t.is_finished()) {
            return;
        }
        let weak = Arc::downgrade(&self.shared);
        let interval = self.shared.config.purge_interval;
        *task = Some(tokio::spawn(purge_loop(weak, interval)));
        tracing::debug!(cache = self.shared.config.name, "Cache purge task started");
    }

    /// Stop the background purge and wait for it to finish. Entries are kept.
    pub async fn shutdown(&self) {
        let task = self.purge_task.lock().take();
        if let Some(task) = task {
            task.abort();
            let _ = task.await;
            tracing::debug!(cache = self.shared.config.name, "Cache purge task stopped");
        }
    }

    /// Whether the purge task is running.
    pub fn is_running(&self) -> bool {
        self.purge_task
            .lock()
            .as_ref()
            .is_some_and(|t| !t.is_finished())
    }

    /// Value for `key`, unless missing or expired.
    pub fn get(&self, key: &K) -> Option<V> {
        let now = Instant::now();
        self.shared
            .store
            .lock()
            .lookup(key, self.shared.config.ttl, now)
    }

    /// Insert or overwrite `key` with a fresh timestamp.
    pub fn put(&self, key: K, value: V) {
        let now = Instant::now();
        self.shared
            .store
            .lock()
            .store(key, value, self.shared.config.capacity, now);
    }

    /// Look up several keys under one lock. Only hits are returned.
    pub fn batch_get<'a, I>(&self, keys: I) -> HashMap<K, V>
    where
        I: IntoIterator<Item = &'a K>,
        K: 'a,
    {
        let now = Instant::now();
        let ttl = self.shared.config.ttl;
        let mut store = self.shared.store.lock();
        keys.into_iter()
            .filter_map(|key| store.lookup(key, ttl, now).map(|v| (key.clone(), v)))
            .collect()
    }

    /// Insert several entries under one lock.
    pub fn batch_put<I>(&self, entries: I)
    where
        I: IntoIterator<Item = (K, V)>,
    {
        let now = Instant::now();
        let capacity = self.shared.config.capacity;
        let mut store = self.shared.store.lock();
        for (key, value) in entries {
            store.store(key, value, capacity, now);
        }
    }

    /// Drop every expired entry now. Returns how many were dropped.
    pub fn purge_expired(&self) -> usize {
        self.shared.purge_expired()
    }

    /// Number of stored entries, expired ones included until purged.
    pub fn len(&self) -> usize {
        self.shared.store.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove every entry.
    pub fn clear(&self) {
        self.shared.store.lock().entries.clear();
    }

    pub fn config(&self) -> &CacheConfig {
        &self.shared.config
    }

    pub fn stats(&self) -> CacheStats {
        let store = self.shared.store.lock();
        CacheStats {
            entries: store.entries.len(),
            capacity: self.shared.config.capacity,
            hits: store.hits,
            misses: store.misses,
            evictions: store.evictions,
            expired: store.expired,
        }
    }
}

impl<K, V> Drop for TtlCache<K, V> {
    fn drop(&mut self) {
        if let Some(task) = self.purge_task.get_mut().take() {
            task.abort();
        }
    }
}

async fn purge_loop<K, V>(shared: Weak<Shared<K, V>>, interval: Duration)
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    loop {
        tokio::time::sleep(interval).await;
        let Some(shared) = shared.upgrade() else { return };
        let purged = shared.purge_expired();
        if purged > 0 {
            tracing::debug!(cache = shared.config.name, purged, "Purged expired entries");
        }
    }
}

/// Stats of both tiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CacheTierStats {
    pub players: CacheStats,
    pub groups: CacheStats,
}

/// The player-stats and group caches, keyed by persona id.
pub struct CacheTier {
    pub players: TtlCache<u64, Value>,
    pub groups: TtlCache<u64, Value>,
}

impl Default for CacheTier {
    fn default() -> Self {
        Self::new(CacheConfig::players(), CacheConfig::groups())
    }
}

impl CacheTier {
    pub fn new(players: CacheConfig, groups: CacheConfig) -> Self {
        Self {
            players: TtlCache::new(players),
            groups: TtlCache::new(groups),
        }
    }

    /// Start both purge tasks.
    pub fn init(&self) {
        self.players.init();
        self.groups.init();
    }

    /// Stop both purge tasks.
    pub async fn shutdown(&self) {
        self.players.shutdown().await;
        self.groups.shutdown().await;
    }

    pub fn stats(&self) -> CacheTierStats {
        CacheTierStats {
            players: self.players.stats(),
            groups: self.groups.stats(),
        }
    }

    /// Empty both caches.
    pub fn clear_all(&self) {
        self.players.clear();
        self.groups.clear();
        tracing::info!("All caches cleared");
    }
}
