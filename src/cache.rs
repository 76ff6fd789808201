//! Single-flight result cache.
//!
//! [`ResultCache`] memoizes one value per key and guarantees that concurrent
//! misses for the same key run the computation once. The computation itself
//! runs outside the lock, so a slow aggregation never blocks callers asking
//! for other keys.
//!
//! Invalidation is safe while a computation is in flight: the computing caller
//! still receives its value, but the value is not stored and the next caller
//! recomputes.
//!
//! ```
//! use density_atlas::ResultCache;
//!
//! let cache: ResultCache<&str, u32> = ResultCache::new();
//! assert_eq!(cache.get_or_compute("cantons", || 221), 221);
//! assert_eq!(cache.get_or_compute("cantons", || unreachable!()), 221);
//! assert_eq!(cache.stats().computations, 1);
//! ```

use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Condvar, Mutex};

enum Slot<V> {
    /// A caller is computing the value; `ticket` identifies that computation.
    Pending { ticket: u64 },
    Ready(V),
}

/// Counters describing cache activity since construction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Calls answered from a stored value (including after waiting)
    pub hits: u64,
    /// Calls that started a computation
    pub misses: u64,
    /// Computations that completed successfully
    pub computations: u64,
    /// Completed values dropped because their key was invalidated mid-flight
    pub discarded: u64,
}

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    computations: AtomicU64,
    discarded: AtomicU64,
}

/// Keyed memoization with at most one concurrent computation per key.
pub struct ResultCache<K, V> {
    slots: Mutex<HashMap<K, Slot<V>>>,
    settled: Condvar,
    next_ticket: AtomicU64,
    counters: Counters,
}

impl<K, V> Default for ResultCache<K, V>
where
    K: Eq + Hash + Clone + fmt::Debug,
    V: Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> fmt::Debug for ResultCache<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResultCache")
            .field("entries", &self.slots.lock().len())
            .finish()
    }
}

/// Clears a pending slot if the computing closure panics.
struct PendingGuard<'a, K, V>
where
    K: Eq + Hash + Clone + fmt::Debug,
    V: Clone,
{
    cache: &'a ResultCache<K, V>,
    key: &'a K,
    ticket: u64,
    armed: bool,
}

impl<K, V> Drop for PendingGuard<'_, K, V>
where
    K: Eq + Hash + Clone + fmt::Debug,
    V: Clone,
{
    fn drop(&mut self) {
        if self.armed {
            self.cache.abandon(self.key, self.ticket);
        }
    }
}

impl<K, V> ResultCache<K, V>
where
    K: Eq + Hash + Clone + fmt::Debug,
    V: Clone,
{
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            settled: Condvar::new(),
            next_ticket: AtomicU64::new(1),
            counters: Counters::default(),
        }
    }

    /// Return the stored value for `key`, computing it with `compute` on a miss.
    ///
    /// If another caller is already computing `key`, this call blocks until
    /// that computation settles and then returns its value.
    pub fn get_or_compute<F>(&self, key: K, compute: F) -> V
    where
        F: FnOnce() -> V,
    {
        match self.get_or_try_compute(key, || Ok::<V, std::convert::Infallible>(compute())) {
            Ok(value) => value,
            Err(never) => match never {},
        }
    }

    /// Fallible variant of [`get_or_compute`](Self::get_or_compute).
    ///
    /// Errors are returned to the computing caller and never stored; callers
    /// that were waiting on the failed computation retry it themselves.
    pub fn get_or_try_compute<F, E>(&self, key: K, compute: F) -> Result<V, E>
    where
        F: FnOnce() -> Result<V, E>,
    {
        let ticket = {
            let mut slots = self.slots.lock();
            loop {
                let pending = match slots.get(&key) {
                    Some(Slot::Ready(value)) => {
                        self.counters.hits.fetch_add(1, Ordering::Relaxed);
                        return Ok(value.clone());
                    }
                    Some(Slot::Pending { .. }) => true,
                    None => false,
                };
                if !pending {
                    break;
                }
                self.settled.wait(&mut slots);
            }

            self.counters.misses.fetch_add(1, Ordering::Relaxed);
            let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
            slots.insert(key.clone(), Slot::Pending { ticket });
            ticket
        };

        let mut guard = PendingGuard {
            cache: self,
            key: &key,
            ticket,
            armed: true,
        };
        let outcome = compute();
        guard.armed = false;
        drop(guard);

        match outcome {
            Ok(value) => {
                self.counters.computations.fetch_add(1, Ordering::Relaxed);
                self.settle(&key, ticket, value.clone());
                Ok(value)
            }
            Err(e) => {
                self.abandon(&key, ticket);
                Err(e)
            }
        }
    }

    /// Stored value for `key`, if one is ready. Never blocks on a pending computation.
    pub fn get(&self, key: &K) -> Option<V> {
        match self.slots.lock().get(key) {
            Some(Slot::Ready(value)) => Some(value.clone()),
            _ => None,
        }
    }

    /// Drop `key`. Returns `true` if a value or an in-flight computation was removed.
    pub fn invalidate(&self, key: &K) -> bool {
        let removed = self.slots.lock().remove(key).is_some();
        if removed {
            log::info!("[ResultCache] Invalidated {:?}", key);
        }
        removed
    }

    /// Drop every key matching `predicate`. Returns the number removed.
    pub fn invalidate_where(&self, mut predicate: impl FnMut(&K) -> bool) -> usize {
        let mut slots = self.slots.lock();
        let before = slots.len();
        slots.retain(|k, _| !predicate(k));
        let removed = before - slots.len();
        if removed > 0 {
            log::info!("[ResultCache] Invalidated {} entries", removed);
        }
        removed
    }

    /// Drop everything, including in-flight computations.
    pub fn invalidate_all(&self) {
        let mut slots = self.slots.lock();
        let removed = slots.len();
        slots.clear();
        log::info!("[ResultCache] Cleared {} entries", removed);
    }

    /// Number of keys with a stored value or an in-flight computation.
    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            computations: self.counters.computations.load(Ordering::Relaxed),
            discarded: self.counters.discarded.load(Ordering::Relaxed),
        }
    }

    /// Store `value` if `ticket` still owns the slot, then wake waiters.
    fn settle(&self, key: &K, ticket: u64, value: V) {
        let mut slots = self.slots.lock();
        if owns_slot(&slots, key, ticket) {
            slots.insert(key.clone(), Slot::Ready(value));
        } else {
            self.counters.discarded.fetch_add(1, Ordering::Relaxed);
            log::debug!("[ResultCache] Discarded result for invalidated key {:?}", key);
        }
        drop(slots);
        self.settled.notify_all();
    }

    /// Remove the pending slot owned by `ticket`, then wake waiters.
    fn abandon(&self, key: &K, ticket: u64) {
        let mut slots = self.slots.lock();
        if owns_slot(&slots, key, ticket) {
            slots.remove(key);
        }
        drop(slots);
        self.settled.notify_all();
    }
}

fn owns_slot<K: Eq + Hash, V>(slots: &HashMap<K, Slot<V>>, key: &K, ticket: u64) -> bool {
    matches!(slots.get(key), Some(Slot::Pending { ticket: current }) if *current == ticket)
}
