//! Expirable key-value storage for limiter state.
//!
//! Entries carry an optional deadline and are treated as absent once it has
//! passed, whether or not they have been physically removed yet. Storage is
//! sharded (via `DashMap`) so that access to one key only ever contends with
//! keys hashed to the same shard.

use std::borrow::Borrow;
use std::hash::Hash;
use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry;
use dashmap::mapref::one::RefMut;
use dashmap::DashMap;

/// How the deadline of an entry reacts to reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expiry {
    /// The deadline is set when the entry is written and never moves on read.
    Fixed,
    /// Every access pushes the deadline to `now + ttl`.
    Sliding,
}

/// A stored value and its deadline.
#[derive(Debug)]
struct Slot<V> {
    value: V,
    ttl: Option<Duration>,
    expires_at: Option<Instant>,
}

impl<V> Slot<V> {
    fn new(value: V, ttl: Option<Duration>, now: Instant) -> Self {
        Self {
            value,
            ttl,
            expires_at: deadline(now, ttl),
        }
    }

    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| now < at)
    }

    fn touch(&mut self, now: Instant) {
        self.expires_at = deadline(now, self.ttl);
    }
}

/// `None` means the entry never expires; a deadline past the clock's range
/// is treated the same way.
fn deadline(now: Instant, ttl: Option<Duration>) -> Option<Instant> {
    ttl.and_then(|ttl| now.checked_add(ttl))
}

/// A concurrent map whose entries expire after a time-to-live.
///
/// All operations come in two flavours: one that reads the clock and an
/// `*_at` variant taking the current instant explicitly, which keeps
/// time-dependent behaviour testable.
#[derive(Debug)]
pub struct ExpirableStore<K, V>
where
    K: Eq + Hash,
{
    entries: DashMap<K, Slot<V>>,
    expiry: Expiry,
}

impl<K, V> ExpirableStore<K, V>
where
    K: Eq + Hash + Clone,
{
    /// Create an empty store with the given expiry policy.
    pub fn new(expiry: Expiry) -> Self {
        Self {
            entries: DashMap::new(),
            expiry,
        }
    }

    /// Get a copy of the value stored under `key`, if it has not expired.
    pub fn get<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
        V: Clone,
    {
        self.get_at(key, Instant::now())
    }

    pub fn get_at<Q>(&self, key: &Q, now: Instant) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
        V: Clone,
    {
        let found = match self.expiry {
            Expiry::Fixed => self
                .entries
                .get(key)
                .map(|slot| slot.is_live(now).then(|| slot.value.clone())),
            Expiry::Sliding => self.entries.get_mut(key).map(|mut slot| {
                if slot.is_live(now) {
                    slot.touch(now);
                    Some(slot.value.clone())
                } else {
                    None
                }
            }),
        };

        match found {
            Some(Some(value)) => Some(value),
            Some(None) => {
                // The shard guard is released at this point.
                self.evict_if_expired(key, now);
                None
            }
            None => None,
        }
    }

    /// Whether a live entry exists for `key`.
    pub fn contains_key<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.contains_key_at(key, Instant::now())
    }

    pub fn contains_key_at<Q>(&self, key: &Q, now: Instant) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let live = match self.expiry {
            Expiry::Fixed => self.entries.get(key).map(|slot| slot.is_live(now)),
            Expiry::Sliding => self.entries.get_mut(key).map(|mut slot| {
                let live = slot.is_live(now);
                if live {
                    slot.touch(now);
                }
                live
            }),
        };

        match live {
            Some(true) => true,
            Some(false) => {
                self.evict_if_expired(key, now);
                false
            }
            None => false,
        }
    }

    /// Insert or overwrite `key`, (re)starting its deadline at `now + ttl`.
    ///
    /// A `ttl` of `None` keeps the entry until it is deleted.
    pub fn set(&self, key: K, value: V, ttl: Option<Duration>) {
        self.set_at(key, value, ttl, Instant::now());
    }

    pub fn set_at(&self, key: K, value: V, ttl: Option<Duration>, now: Instant) {
        self.entries.insert(key, Slot::new(value, ttl, now));
    }

    /// Remove `key`. Returns `true` if a live entry was removed.
    pub fn delete<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.delete_at(key, Instant::now())
    }

    pub fn delete_at<Q>(&self, key: &Q, now: Instant) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.entries
            .remove(key)
            .map_or(false, |(_, slot)| slot.is_live(now))
    }

    /// Run `f` on the value stored under `key`, creating it with `create`
    /// first if the key is absent or expired.
    ///
    /// The whole sequence runs under the key's shard lock, so concurrent
    /// callers for the same key are serialized. On every call the entry's
    /// deadline is reset to `now + ttl` when the store is sliding; a fixed
    /// store only sets the deadline when the entry is created.
    pub fn with_entry_at<R>(
        &self,
        key: K,
        ttl: Option<Duration>,
        now: Instant,
        create: impl FnOnce() -> V,
        f: impl FnOnce(&mut V) -> R,
    ) -> R {
        let mut slot = self.live_slot(key, ttl, now, create);

        if self.expiry == Expiry::Sliding {
            slot.ttl = ttl;
            slot.touch(now);
        }
        f(&mut slot.value)
    }

    /// Like [`with_entry_at`](Self::with_entry_at), but the deadline is reset
    /// to `now + ttl` regardless of the expiry policy, as a write would.
    pub fn upsert_at<R>(
        &self,
        key: K,
        ttl: Option<Duration>,
        now: Instant,
        create: impl FnOnce() -> V,
        f: impl FnOnce(&mut V) -> R,
    ) -> R {
        let mut slot = self.live_slot(key, ttl, now, create);

        slot.ttl = ttl;
        slot.touch(now);
        f(&mut slot.value)
    }

    /// Modify the live value stored under `key` in place.
    ///
    /// `f` returns whether the entry should be kept; returning `false` removes
    /// it. Returns `false` if there was no live entry to modify.
    pub fn modify_at(&self, key: K, now: Instant, f: impl FnOnce(&mut V) -> bool) -> bool {
        match self.entries.entry(key) {
            Entry::Occupied(mut occupied) => {
                if !occupied.get().is_live(now) {
                    occupied.remove();
                    return false;
                }
                let slot = occupied.get_mut();
                if self.expiry == Expiry::Sliding {
                    slot.touch(now);
                }
                if !f(&mut slot.value) {
                    occupied.remove();
                }
                true
            }
            Entry::Vacant(_) => false,
        }
    }

    /// Visit every live entry.
    ///
    /// Shards are read-locked one at a time while they are visited, so `f`
    /// must not call back into this store.
    pub fn for_each_at(&self, now: Instant, mut f: impl FnMut(&K, &V)) {
        for entry in self.entries.iter() {
            if entry.value().is_live(now) {
                f(entry.key(), &entry.value().value);
            }
        }
    }

    /// Keys of all live entries, in no particular order.
    pub fn keys_at(&self, now: Instant) -> Vec<K> {
        let mut keys = Vec::new();
        self.for_each_at(now, |key, _| keys.push(key.clone()));
        keys
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.len_at(Instant::now())
    }

    pub fn len_at(&self, now: Instant) -> usize {
        self.entries
            .iter()
            .filter(|entry| entry.value().is_live(now))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Physically remove every expired entry. Returns how many were evicted.
    pub fn sweep(&self) -> usize {
        self.sweep_at(Instant::now())
    }

    pub fn sweep_at(&self, now: Instant) -> usize {
        // Collect first, then remove one key at a time so that no shard is
        // write-locked for longer than a single removal.
        let stale: Vec<K> = self
            .entries
            .iter()
            .filter(|entry| !entry.value().is_live(now))
            .map(|entry| entry.key().clone())
            .collect();

        stale
            .into_iter()
            .filter(|key| self.evict_if_expired(key, now))
            .count()
    }

    /// The live slot for `key`, replacing an absent or expired one with a
    /// fresh value. The returned guard holds the shard write lock.
    fn live_slot(
        &self,
        key: K,
        ttl: Option<Duration>,
        now: Instant,
        create: impl FnOnce() -> V,
    ) -> RefMut<'_, K, Slot<V>> {
        match self.entries.entry(key) {
            Entry::Occupied(mut occupied) => {
                if !occupied.get().is_live(now) {
                    occupied.insert(Slot::new(create(), ttl, now));
                }
                occupied.into_ref()
            }
            Entry::Vacant(vacant) => vacant.insert(Slot::new(create(), ttl, now)),
        }
    }

    /// Remove `key` only if it is still expired; an entry refreshed in the
    /// meantime is left alone.
    fn evict_if_expired<Q>(&self, key: &Q, now: Instant) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.entries
            .remove_if(key, |_, slot| !slot.is_live(now))
            .is_some()
    }
}

impl<K, V> Default for ExpirableStore<K, V>
where
    K: Eq + Hash + Clone,
{
    fn default() -> Self {
        Self::new(Expiry::Fixed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    const TTL: Option<Duration> = Some(Duration::from_secs(10));

    #[test]
    fn test_set_and_get() {
        let store = ExpirableStore::new(Expiry::Fixed);
        let now = Instant::now();

        store.set_at("a".to_string(), 1, TTL, now);

        assert_eq!(store.get_at("a", now), Some(1));
        assert_eq!(store.get_at("b", now), None);
        assert_eq!(store.len_at(now), 1);
    }

    #[test]
    fn test_expired_entry_is_absent() {
        let store = ExpirableStore::new(Expiry::Fixed);
        let now = Instant::now();

        store.set_at("a".to_string(), 1, TTL, now);

        let later = now + Duration::from_secs(10);
        assert_eq!(store.get_at("a", later), None);
        assert!(!store.contains_key_at("a", later));
        assert_eq!(store.len_at(later), 0);
    }

    #[test]
    fn test_get_evicts_expired_entry() {
        let store = ExpirableStore::new(Expiry::Fixed);
        let now = Instant::now();

        store.set_at("a".to_string(), 1, TTL, now);
        assert_eq!(store.get_at("a", now + Duration::from_secs(11)), None);

        // Physically gone: even a reader at the original instant misses it.
        assert_eq!(store.get_at("a", now), None);
    }

    #[test]
    fn test_no_ttl_never_expires() {
        let store = ExpirableStore::new(Expiry::Fixed);
        let now = Instant::now();

        store.set_at("a".to_string(), (), None, now);

        assert!(store.contains_key_at("a", now + Duration::from_secs(86_400 * 365)));
    }

    #[test]
    fn test_sliding_access_extends_deadline() {
        let store = ExpirableStore::new(Expiry::Sliding);
        let now = Instant::now();

        store.set_at("a".to_string(), 1, TTL, now);
        assert_eq!(store.get_at("a", now + Duration::from_secs(8)), Some(1));

        // 16s after insertion, but only 8s after the last access.
        assert_eq!(store.get_at("a", now + Duration::from_secs(16)), Some(1));
        assert_eq!(store.get_at("a", now + Duration::from_secs(27)), None);
    }

    #[test]
    fn test_fixed_access_does_not_extend_deadline() {
        let store = ExpirableStore::new(Expiry::Fixed);
        let now = Instant::now();

        store.set_at("a".to_string(), 1, TTL, now);
        assert_eq!(store.get_at("a", now + Duration::from_secs(8)), Some(1));
        assert_eq!(store.get_at("a", now + Duration::from_secs(12)), None);
    }

    #[test]
    fn test_set_overwrites_and_restarts_deadline() {
        let store = ExpirableStore::new(Expiry::Fixed);
        let now = Instant::now();

        store.set_at("a".to_string(), 1, TTL, now);
        store.set_at("a".to_string(), 2, TTL, now + Duration::from_secs(5));

        assert_eq!(store.get_at("a", now + Duration::from_secs(12)), Some(2));
    }

    #[test]
    fn test_delete() {
        let store = ExpirableStore::new(Expiry::Fixed);
        let now = Instant::now();

        store.set_at("a".to_string(), 1, TTL, now);

        assert!(store.delete_at("a", now));
        assert!(!store.delete_at("a", now));
        assert_eq!(store.get_at("a", now), None);
    }

    #[test]
    fn test_with_entry_creates_once() {
        let store = ExpirableStore::new(Expiry::Sliding);
        let now = Instant::now();
        let mut created = 0;

        for _ in 0..3 {
            store.with_entry_at(
                "a".to_string(),
                TTL,
                now,
                || {
                    created += 1;
                    0
                },
                |count| *count += 1,
            );
        }

        assert_eq!(created, 1);
        assert_eq!(store.get_at("a", now), Some(3));
    }

    #[test]
    fn test_with_entry_replaces_expired_value() {
        let store = ExpirableStore::new(Expiry::Sliding);
        let now = Instant::now();

        store.with_entry_at("a".to_string(), TTL, now, || 5, |v| *v += 1);
        let later = now + Duration::from_secs(30);
        let seen = store.with_entry_at("a".to_string(), TTL, later, || 5, |v| *v);

        assert_eq!(seen, 5);
    }

    #[test]
    fn test_upsert_resets_fixed_deadline() {
        let store = ExpirableStore::new(Expiry::Fixed);
        let now = Instant::now();

        store.upsert_at("a".to_string(), TTL, now, Vec::new, |v| v.push(1));
        store.upsert_at(
            "a".to_string(),
            TTL,
            now + Duration::from_secs(8),
            Vec::new,
            |v| v.push(2),
        );

        assert_eq!(
            store.get_at("a", now + Duration::from_secs(15)),
            Some(vec![1, 2])
        );
    }

    #[test]
    fn test_modify_can_remove_entry() {
        let store = ExpirableStore::new(Expiry::Fixed);
        let now = Instant::now();

        store.set_at("a".to_string(), vec![1, 2], TTL, now);

        assert!(store.modify_at("a".to_string(), now, |v| {
            v.retain(|x| *x != 1);
            !v.is_empty()
        }));
        assert_eq!(store.get_at("a", now), Some(vec![2]));

        assert!(store.modify_at("a".to_string(), now, |v| {
            v.clear();
            false
        }));
        assert!(!store.contains_key_at("a", now));
        assert!(!store.modify_at("a".to_string(), now, |_| true));
    }

    #[test]
    fn test_sweep_removes_only_expired() {
        let store = ExpirableStore::new(Expiry::Fixed);
        let now = Instant::now();

        store.set_at("short".to_string(), 1, Some(Duration::from_secs(1)), now);
        store.set_at("long".to_string(), 2, Some(Duration::from_secs(60)), now);
        store.set_at("forever".to_string(), 3, None, now);

        let evicted = store.sweep_at(now + Duration::from_secs(5));

        assert_eq!(evicted, 1);
        let mut keys = store.keys_at(now);
        keys.sort();
        assert_eq!(keys, vec!["forever".to_string(), "long".to_string()]);
    }

    #[test]
    fn test_is_empty_ignores_expired_entries() {
        let store = ExpirableStore::new(Expiry::Fixed);
        assert!(store.is_empty());

        store.set("gone".to_string(), 1, Some(Duration::ZERO));
        assert!(store.is_empty());

        store.set("kept".to_string(), 2, None);
        assert!(!store.is_empty());
    }

    #[test]
    fn test_concurrent_with_entry_is_serialized_per_key() {
        let store = Arc::new(ExpirableStore::new(Expiry::Sliding));
        let now = Instant::now();

        std::thread::scope(|scope| {
            for _ in 0..8 {
                let store = Arc::clone(&store);
                scope.spawn(move || {
                    for i in 0..1000 {
                        let key = format!("key-{}", i % 4);
                        store.with_entry_at(key, TTL, now, || 0u64, |v| *v += 1);
                    }
                });
            }
        });

        let mut total = 0;
        store.for_each_at(now, |_, v| total += *v);
        assert_eq!(total, 8000);
        assert_eq!(store.len_at(now), 4);
    }
}
