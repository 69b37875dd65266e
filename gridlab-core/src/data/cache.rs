//! In-memory result cache with in-flight de-duplication.
//!
//! Each entry is either `Pending` (a shared future every caller awaits) or
//! `Ready`. The pending future is stored before anyone awaits it, so
//! concurrent requests for the same key collapse into one load. The stored
//! future settles its own entry when it completes: success replaces it with
//! `Ready`, failure removes it so the next call retries cleanly. Errors are
//! never cached.
//!
//! The map lock is only held in synchronous sections, never across an await.
//!
//! A bounded cache evicts in strict insertion order (FIFO), regardless of
//! how recently an entry was read.

use super::provider::DataError;
use futures::future::{BoxFuture, FutureExt, Shared};
use std::collections::{HashMap, VecDeque};
use std::fmt::Debug;
use std::future::Future;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tracing::{debug, trace};

type SharedLoad<V> = Shared<BoxFuture<'static, Result<Arc<V>, DataError>>>;

enum Entry<V> {
    Pending { id: u64, load: SharedLoad<V> },
    Ready { id: u64, value: Arc<V> },
}

impl<V> Entry<V> {
    fn id(&self) -> u64 {
        match self {
            Entry::Pending { id, .. } | Entry::Ready { id, .. } => *id,
        }
    }
}

struct Inner<K, V> {
    entries: HashMap<K, Entry<V>>,
    /// Insertion order for FIFO eviction; `(key, id)` pairs whose id no
    /// longer matches the live entry are stale and skipped.
    order: VecDeque<(K, u64)>,
    next_id: u64,
}

/// Key → value store with single-flight loading and optional FIFO bound.
pub struct ResultCache<K, V> {
    name: String,
    cap: Option<usize>,
    inner: Arc<Mutex<Inner<K, V>>>,
}

impl<K, V> Clone for ResultCache<K, V> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            cap: self.cap,
            inner: Arc::clone(&self.inner),
        }
    }
}

fn lock<K, V>(inner: &Mutex<Inner<K, V>>) -> MutexGuard<'_, Inner<K, V>> {
    inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl<K, V> ResultCache<K, V>
where
    K: Eq + Hash + Clone + Debug + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    /// Unbounded cache.
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_cap(name, None)
    }

    /// Cache holding at most `cap` entries (clamped to at least one).
    pub fn bounded(name: impl Into<String>, cap: usize) -> Self {
        Self::with_cap(name, Some(cap))
    }

    pub fn with_cap(name: impl Into<String>, cap: Option<usize>) -> Self {
        Self {
            name: name.into(),
            cap: cap.map(|c| c.max(1)),
            inner: Arc::new(Mutex::new(Inner {
                entries: HashMap::new(),
                order: VecDeque::new(),
                next_id: 0,
            })),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn cap(&self) -> Option<usize> {
        self.cap
    }

    /// Return the cached or in-flight value for `key`, or start `loader`.
    ///
    /// `loader` is called at most once, and only when the key is absent. It
    /// runs while the map is locked, so it must only build its future and
    /// not touch this cache synchronously.
    pub async fn get_or_load<F, Fut>(&self, key: K, loader: F) -> Result<Arc<V>, DataError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, DataError>> + Send + 'static,
    {
        let load = {
            let mut inner = lock(&self.inner);
            match inner.entries.get(&key) {
                Some(Entry::Ready { value, .. }) => {
                    trace!(cache = %self.name, ?key, "cache hit");
                    return Ok(Arc::clone(value));
                }
                Some(Entry::Pending { load, .. }) => {
                    debug!(cache = %self.name, ?key, "joining in-flight load");
                    load.clone()
                }
                None => {
                    let id = inner.next_id;
                    inner.next_id += 1;
                    let load = self.settling(key.clone(), id, loader());
                    inner.entries.insert(
                        key.clone(),
                        Entry::Pending {
                            id,
                            load: load.clone(),
                        },
                    );
                    inner.order.push_back((key, id));
                    self.evict_overflow(&mut inner);
                    load
                }
            }
        };
        load.await
    }

    /// Wrap a loader so that completing it settles the entry it was stored under.
    fn settling<Fut>(&self, key: K, id: u64, fut: Fut) -> SharedLoad<V>
    where
        Fut: Future<Output = Result<V, DataError>> + Send + 'static,
    {
        let cache: Weak<Mutex<Inner<K, V>>> = Arc::downgrade(&self.inner);
        let name = self.name.clone();
        async move {
            let outcome = fut.await.map(Arc::new);
            if let Some(inner) = cache.upgrade() {
                let mut inner = lock(&inner);
                let live = inner.entries.get(&key).map(Entry::id) == Some(id);
                match &outcome {
                    Ok(value) if live => {
                        inner.entries.insert(
                            key,
                            Entry::Ready {
                                id,
                                value: Arc::clone(value),
                            },
                        );
                    }
                    Err(e) if live => {
                        debug!(cache = %name, ?key, error = %e, "load failed; entry cleared");
                        inner.entries.remove(&key);
                        inner.order.retain(|(k, i)| !(*i == id && *k == key));
                    }
                    // Evicted or cleared while in flight.
                    _ => {}
                }
            }
            outcome
        }
        .boxed()
        .shared()
    }

    fn evict_overflow(&self, inner: &mut Inner<K, V>) {
        let Some(cap) = self.cap else { return };
        while inner.entries.len() > cap {
            let Some((key, id)) = inner.order.pop_front() else {
                break;
            };
            if inner.entries.get(&key).map(Entry::id) == Some(id) {
                debug!(cache = %self.name, ?key, cap, "evicting oldest entry");
                inner.entries.remove(&key);
            }
        }
    }

    /// Resolved value for `key`, if any. Pending loads are not awaited.
    pub fn get_ready(&self, key: &K) -> Option<Arc<V>> {
        match lock(&self.inner).entries.get(key) {
            Some(Entry::Ready { value, .. }) => Some(Arc::clone(value)),
            _ => None,
        }
    }

    /// Whether `key` has a pending or ready entry.
    pub fn contains(&self, key: &K) -> bool {
        lock(&self.inner).entries.contains_key(key)
    }

    pub fn is_pending(&self, key: &K) -> bool {
        matches!(
            lock(&self.inner).entries.get(key),
            Some(Entry::Pending { .. })
        )
    }

    pub fn len(&self) -> usize {
        lock(&self.inner).entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Resident keys, oldest first.
    pub fn keys(&self) -> Vec<K> {
        let inner = lock(&self.inner);
        inner
            .order
            .iter()
            .filter(|(k, id)| inner.entries.get(k).map(Entry::id) == Some(*id))
            .map(|(k, _)| k.clone())
            .collect()
    }

    /// Drop every entry. In-flight loads still complete for their waiters
    /// but no longer populate the cache.
    pub fn clear(&self) {
        let mut inner = lock(&self.inner);
        inner.entries.clear();
        inner.order.clear();
    }
}
