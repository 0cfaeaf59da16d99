//! Thread-safe staging collections for the import pipeline.
//!
//! Everything an import session accumulates before the transactional commit
//! lives in one of these containers. They are all internally synchronized so
//! pipeline sub-tasks (per-issue mapping fan-out, attachment workers) never
//! need external locking.
//!
//! The central piece is [`ResolveMap`]: a memoizing cache whose resolver runs
//! under the same critical section as the cache check, guaranteeing
//! at-most-one resolution per key even under concurrent access. This is what
//! lets mappers follow forward references (an author, state, or parent seen
//! before it was fetched) without a second pass over the source data.

use std::collections::{HashMap, HashSet};
use std::hash::Hash;
use std::sync::{Mutex, MutexGuard, PoisonError};

use uuid::Uuid;

use crate::error::Result;

/// Lock a mutex, recovering the guard if a previous holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A lock-protected keyed map.
#[derive(Debug, Default)]
pub struct SharedMap<K, V> {
    inner: Mutex<HashMap<K, V>>,
}

impl<K: Eq + Hash + Clone, V: Clone> SharedMap<K, V> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
        }
    }

    pub fn insert(&self, key: K, value: V) {
        lock(&self.inner).insert(key, value);
    }

    #[must_use]
    pub fn get(&self, key: &K) -> Option<V> {
        lock(&self.inner).get(key).cloned()
    }

    #[must_use]
    pub fn contains(&self, key: &K) -> bool {
        lock(&self.inner).contains_key(key)
    }

    /// Return the value under `key`, inserting `make()` first on a miss.
    /// Check and insert happen under one lock, so two concurrent callers
    /// for the same key observe the same value.
    pub fn get_or_insert_with<F>(&self, key: K, make: F) -> V
    where
        F: FnOnce() -> V,
    {
        let mut guard = lock(&self.inner);
        guard.entry(key).or_insert_with(make).clone()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        lock(&self.inner).len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        lock(&self.inner).is_empty()
    }

    /// Clone out the current contents.
    #[must_use]
    pub fn snapshot(&self) -> Vec<(K, V)> {
        lock(&self.inner)
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Clone out the current values.
    #[must_use]
    pub fn values(&self) -> Vec<V> {
        lock(&self.inner).values().cloned().collect()
    }
}

/// A lock-protected set with claim semantics.
///
/// `insert` returns whether the key was newly claimed, which makes it usable
/// as an idempotence guard: the first caller to claim a key proceeds, every
/// later caller sees `false` and skips.
#[derive(Debug, Default)]
pub struct SharedSet<K> {
    inner: Mutex<HashSet<K>>,
}

impl<K: Eq + Hash + Clone> SharedSet<K> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HashSet::new()),
        }
    }

    /// Claim `key`. Returns true if this call inserted it.
    pub fn insert(&self, key: K) -> bool {
        lock(&self.inner).insert(key)
    }

    pub fn remove(&self, key: &K) -> bool {
        lock(&self.inner).remove(key)
    }

    #[must_use]
    pub fn contains(&self, key: &K) -> bool {
        lock(&self.inner).contains(key)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        lock(&self.inner).len()
    }
}

/// A memoizing resolve-or-fetch map.
///
/// `get_or_resolve` checks the cache and, on a miss, invokes the resolver and
/// stores its result - all inside one critical section. Concurrent callers
/// for the same missing key therefore trigger exactly one resolution.
///
/// Resolvers must not re-enter the same map (that would self-deadlock); the
/// issue-id map keeps its resolver allocation-only for exactly this reason.
#[derive(Debug, Default)]
pub struct ResolveMap<K, V> {
    inner: Mutex<HashMap<K, V>>,
}

impl<K: Eq + Hash + Clone, V: Clone> ResolveMap<K, V> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// Return the cached value for `key`, or resolve, memoize, and return it.
    ///
    /// # Errors
    ///
    /// Propagates the resolver's error; nothing is cached in that case, so a
    /// later call may retry.
    pub fn get_or_resolve<F>(&self, key: &K, resolve: F) -> Result<V>
    where
        F: FnOnce() -> Result<V>,
    {
        let mut guard = lock(&self.inner);
        if let Some(value) = guard.get(key) {
            return Ok(value.clone());
        }
        let value = resolve()?;
        guard.insert(key.clone(), value.clone());
        Ok(value)
    }

    /// Pre-seed a value without running a resolver.
    pub fn insert(&self, key: K, value: V) {
        lock(&self.inner).insert(key, value);
    }

    #[must_use]
    pub fn get(&self, key: &K) -> Option<V> {
        lock(&self.inner).get(key).cloned()
    }

    #[must_use]
    pub fn contains(&self, key: &K) -> bool {
        lock(&self.inner).contains_key(key)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        lock(&self.inner).len()
    }

    #[must_use]
    pub fn snapshot(&self) -> Vec<(K, V)> {
        lock(&self.inner)
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    #[must_use]
    pub fn values(&self) -> Vec<V> {
        lock(&self.inner).values().cloned().collect()
    }
}

/// An append-only concurrent list for rows that need no dedup.
#[derive(Debug, Default)]
pub struct AppendList<T> {
    inner: Mutex<Vec<T>>,
}

impl<T: Clone> AppendList<T> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Vec::new()),
        }
    }

    pub fn push(&self, value: T) {
        lock(&self.inner).push(value);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        lock(&self.inner).len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        lock(&self.inner).is_empty()
    }

    #[must_use]
    pub fn snapshot(&self) -> Vec<T> {
        lock(&self.inner).clone()
    }

    /// Take the contents, leaving the list empty.
    #[must_use]
    pub fn drain(&self) -> Vec<T> {
        std::mem::take(&mut *lock(&self.inner))
    }
}

/// A map whose key is computed from the value itself.
///
/// Used for relation rows whose natural key is a tuple (e.g. the
/// "blocks:blocker:blocked" composite). First insert wins; duplicates are
/// dropped, which is the dedup this container exists for.
pub struct DerivedMap<V> {
    key_of: fn(&V) -> String,
    inner: Mutex<HashMap<String, V>>,
}

impl<V: Clone> DerivedMap<V> {
    #[must_use]
    pub fn new(key_of: fn(&V) -> String) -> Self {
        Self {
            key_of,
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// Insert unless a value with the same derived key is already present.
    /// Returns true if the value was inserted.
    pub fn insert(&self, value: V) -> bool {
        let key = (self.key_of)(&value);
        let mut guard = lock(&self.inner);
        if guard.contains_key(&key) {
            return false;
        }
        guard.insert(key, value);
        true
    }

    #[must_use]
    pub fn len(&self) -> usize {
        lock(&self.inner).len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        lock(&self.inner).is_empty()
    }

    #[must_use]
    pub fn values(&self) -> Vec<V> {
        lock(&self.inner).values().cloned().collect()
    }
}

impl<V> std::fmt::Debug for DerivedMap<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DerivedMap")
            .field("len", &lock(&self.inner).len())
            .finish()
    }
}

/// Per-parent monotonic sibling counter.
///
/// Assigns a sort index scoped to a parent issue so sibling order is
/// preserved when recreating hierarchies. Process-local and session-scoped;
/// indices start at 0 per parent and increment in first-mapped order.
#[derive(Debug, Default)]
pub struct ChildOrderCounter {
    inner: Mutex<HashMap<Uuid, i64>>,
}

impl ChildOrderCounter {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// Next sort index under `parent`.
    pub fn next(&self, parent: Uuid) -> i64 {
        let mut guard = lock(&self.inner);
        let slot = guard.entry(parent).or_insert(0);
        let index = *slot;
        *slot += 1;
        index
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn resolve_map_memoizes() {
        let map: ResolveMap<String, u32> = ResolveMap::new();
        let calls = AtomicUsize::new(0);

        let resolve = || {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(7)
        };
        assert_eq!(map.get_or_resolve(&"a".to_string(), resolve).unwrap(), 7);
        assert_eq!(
            map.get_or_resolve(&"a".to_string(), || {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(9)
            })
            .unwrap(),
            7
        );
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn resolve_map_error_is_not_cached() {
        let map: ResolveMap<String, u32> = ResolveMap::new();
        let err = map.get_or_resolve(&"k".to_string(), || {
            Err(crate::GantryError::remote("transient"))
        });
        assert!(err.is_err());
        assert_eq!(
            map.get_or_resolve(&"k".to_string(), || Ok(3)).unwrap(),
            3
        );
    }

    #[test]
    fn resolve_map_resolves_at_most_once_under_contention() {
        let map: ResolveMap<String, u64> = ResolveMap::new();
        let calls = AtomicUsize::new(0);

        std::thread::scope(|s| {
            for _ in 0..8 {
                s.spawn(|| {
                    let value = map
                        .get_or_resolve(&"shared".to_string(), || {
                            calls.fetch_add(1, Ordering::SeqCst);
                            // Widen the race window.
                            std::thread::sleep(std::time::Duration::from_millis(5));
                            Ok(42)
                        })
                        .unwrap();
                    assert_eq!(value, 42);
                });
            }
        });

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn shared_set_claims_once() {
        let set: SharedSet<String> = SharedSet::new();
        assert!(set.insert("x".to_string()));
        assert!(!set.insert("x".to_string()));
        assert!(set.contains(&"x".to_string()));
    }

    #[test]
    fn derived_map_dedups_by_computed_key() {
        let map: DerivedMap<(u32, u32)> = DerivedMap::new(|v| format!("{}:{}", v.0, v.1));
        assert!(map.insert((1, 2)));
        assert!(!map.insert((1, 2)));
        assert!(map.insert((2, 1)));
        assert_eq!(map.len(), 2);
    }

    #[test]
    fn child_counter_is_monotonic_per_parent() {
        let counter = ChildOrderCounter::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();

        assert_eq!(counter.next(a), 0);
        assert_eq!(counter.next(a), 1);
        assert_eq!(counter.next(b), 0);
        assert_eq!(counter.next(a), 2);
    }

    #[test]
    fn append_list_collects_concurrent_pushes() {
        let list: AppendList<usize> = AppendList::new();
        std::thread::scope(|s| {
            for i in 0..4 {
                let list = &list;
                s.spawn(move || {
                    for j in 0..25 {
                        list.push(i * 100 + j);
                    }
                });
            }
        });
        assert_eq!(list.len(), 100);
    }
}
