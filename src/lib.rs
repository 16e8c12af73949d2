//! SyncMap: a concurrent map for read-mostly keys and disjoint-key writers.
//!
//! Lookups of settled keys go through an immutable snapshot published via an atomic pointer and
//! never take a lock. Stores to keys the snapshot already knows update the shared entry with CAS.
//! Only new keys, and lookups that the snapshot cannot answer, go through a mutex-guarded dirty
//! map. Once those lookups have cost as much as copying the dirty map would, the dirty map is
//! promoted to become the next snapshot.

use std::borrow::Borrow;
use std::collections::HashMap;
use std::fmt;
use std::hash::{BuildHasher, Hash};
use std::sync::Arc;

use ahash::RandomState;
use arc_swap::ArcSwap;
use log::trace;
use parking_lot::Mutex;

// ================================================================================================
// INTERNAL DATA STRUCTURES
// ================================================================================================

/// Contents of an entry cell.
enum Slot<V> {
    /// No live value. The key may still be present in the dirty map.
    Empty,
    Value(V),
    /// Deleted and left out of the current dirty map. Only a writer holding the map lock may
    /// revive it, and it must put the entry back into the dirty map before unlocking.
    Expunged,
}

/// Per-key cell shared by reference between the snapshot and the dirty map.
///
/// Every transition swaps in a freshly allocated `Slot`. CAS compares against the `Arc` the
/// caller loaded; the load guard keeps that allocation alive, so its address cannot be reused
/// while the CAS is pending.
struct Entry<V> {
    slot: ArcSwap<Slot<V>>,
}

/// Outcome of [`Entry::try_load_or_store`].
enum LoadOrStore<V> {
    Loaded(V),
    Stored,
    Expunged,
}

type EntryMap<K, V, S> = HashMap<K, Arc<Entry<V>>, S>;

/// Immutable snapshot published through `SyncMap::read`.
///
/// The mapping sits behind its own `Arc` so that marking a snapshot amended republishes the same
/// mapping without copying it.
struct ReadOnly<K, V, S> {
    m: Arc<EntryMap<K, V, S>>,
    /// The dirty map may hold keys that `m` lacks.
    amended: bool,
}

/// State guarded by the map lock.
struct DirtyState<K, V, S> {
    /// Superset of the live snapshot keys plus keys not yet promoted. `None` until the first new
    /// key after a promotion.
    dirty: Option<EntryMap<K, V, S>>,
    /// Lookups that had to consult `dirty` since the last promotion.
    misses: usize,
}

// ================================================================================================
// MAIN SYNCMAP STRUCTURE
// ================================================================================================

/// Concurrent map with lock-free reads of settled keys.
///
/// Best suited to two workloads: keys written once and read many times, and threads that read,
/// write and overwrite disjoint sets of keys. For anything else a `Mutex<HashMap>` is usually as
/// fast and easier to reason about.
///
/// The map is not `Clone`; share it by reference or through an `Arc`.
pub struct SyncMap<K, V, S = RandomState> {
    read: ArcSwap<ReadOnly<K, V, S>>,
    locked: Mutex<DirtyState<K, V, S>>,
    hasher: S,
    capacity: usize,
}

// ================================================================================================
// ENTRY STATE MACHINE
// ================================================================================================

impl<V> Entry<V> {
    fn new(slot: Arc<Slot<V>>) -> Self {
        Self {
            slot: ArcSwap::new(slot),
        }
    }

    fn load(&self) -> Option<V>
    where
        V: Clone,
    {
        match &**self.slot.load() {
            Slot::Value(v) => Some(v.clone()),
            _ => None,
        }
    }

    fn is_live(&self) -> bool {
        matches!(**self.slot.load(), Slot::Value(_))
    }

    /// Owned handle to the current slot, for callers that run user code while reading it.
    fn load_slot(&self) -> Arc<Slot<V>> {
        self.slot.load_full()
    }

    /// Stores `new` unless the entry is expunged. Retries while other writers race.
    fn try_store(&self, new: &Arc<Slot<V>>) -> bool {
        loop {
            let cur = self.slot.load();
            if matches!(**cur, Slot::Expunged) {
                return false;
            }
            let prev = self.slot.compare_and_swap(&*cur, Arc::clone(new));
            if Arc::ptr_eq(&*prev, &*cur) {
                return true;
            }
        }
    }

    /// Unconditional store. The caller must hold the lock and know the entry is not expunged.
    fn store_locked(&self, new: Arc<Slot<V>>) {
        self.slot.store(new);
    }

    /// Turns an expunged entry back into an empty one. When this returns true the caller must
    /// insert the entry into the dirty map before releasing the lock.
    fn unexpunge_locked(&self) -> bool {
        let cur = self.slot.load();
        if !matches!(**cur, Slot::Expunged) {
            return false;
        }
        let prev = self.slot.compare_and_swap(&*cur, Arc::new(Slot::Empty));
        Arc::ptr_eq(&*prev, &*cur)
    }

    /// Marks an empty entry expunged. Returns whether the entry ends up expunged; a live entry
    /// reports false and must be carried into the new dirty map.
    fn try_expunge_locked(&self) -> bool {
        let mut expunged = None;
        loop {
            let cur = self.slot.load();
            match **cur {
                Slot::Value(_) => return false,
                Slot::Expunged => return true,
                Slot::Empty => {}
            }
            let new = expunged.get_or_insert_with(|| Arc::new(Slot::Expunged));
            let prev = self.slot.compare_and_swap(&*cur, Arc::clone(new));
            if Arc::ptr_eq(&*prev, &*cur) {
                return true;
            }
        }
    }

    /// Clears a live value, returning it. Empty and expunged entries are left alone.
    fn delete(&self) -> Option<V>
    where
        V: Clone,
    {
        let mut empty = None;
        loop {
            let cur = self.slot.load();
            let Slot::Value(v) = &**cur else {
                return None;
            };
            let new = empty.get_or_insert_with(|| Arc::new(Slot::Empty));
            let prev = self.slot.compare_and_swap(&*cur, Arc::clone(new));
            if Arc::ptr_eq(&*prev, &*cur) {
                return Some(v.clone());
            }
        }
    }

    /// Returns the live value if there is one, otherwise installs a clone of `value`.
    /// Never overwrites a value and never touches an expunged entry.
    fn try_load_or_store(&self, value: &V) -> LoadOrStore<V>
    where
        V: Clone,
    {
        let mut candidate = None;
        loop {
            let cur = self.slot.load();
            match &**cur {
                Slot::Value(v) => return LoadOrStore::Loaded(v.clone()),
                Slot::Expunged => return LoadOrStore::Expunged,
                Slot::Empty => {}
            }
            let new = candidate.get_or_insert_with(|| Arc::new(Slot::Value(value.clone())));
            let prev = self.slot.compare_and_swap(&*cur, Arc::clone(new));
            if Arc::ptr_eq(&*prev, &*cur) {
                return LoadOrStore::Stored;
            }
        }
    }
}

impl<K, V, S: Clone> ReadOnly<K, V, S> {
    fn empty(hasher: &S) -> Self {
        Self {
            m: Arc::new(HashMap::with_hasher(hasher.clone())),
            amended: false,
        }
    }
}

// ================================================================================================
// SYNCMAP CONSTRUCTORS
// ================================================================================================

impl<K: Eq + Hash + Clone, V: Clone> SyncMap<K, V, RandomState> {
    /// Create an empty SyncMap with the default hasher.
    pub fn new() -> Self {
        Self::with_capacity(0)
    }

    /// Create an empty SyncMap whose dirty map is pre-sized for at least `capacity` keys
    /// whenever it is rebuilt.
    pub fn with_capacity(capacity: usize) -> Self {
        Self::with_capacity_and_hasher(capacity, RandomState::new())
    }
}

impl<K: Eq + Hash + Clone, V: Clone, S: BuildHasher + Clone> SyncMap<K, V, S> {
    /// Create an empty SyncMap using the provided hasher.
    ///
    /// The hasher is cloned into every snapshot and dirty map the map builds, so it cannot be
    /// changed afterwards.
    pub fn with_hasher(hasher: S) -> Self {
        Self::with_capacity_and_hasher(0, hasher)
    }

    /// Create an empty SyncMap with a dirty-map capacity hint and a custom hasher.
    pub fn with_capacity_and_hasher(capacity: usize, hasher: S) -> Self {
        Self {
            read: ArcSwap::from_pointee(ReadOnly::empty(&hasher)),
            locked: Mutex::new(DirtyState {
                dirty: None,
                misses: 0,
            }),
            hasher,
            capacity,
        }
    }

    // ============================================================================================
    // PUBLIC API METHODS
    // ============================================================================================

    /// Returns a clone of the value stored for `key`.
    ///
    /// Keys present in the current snapshot are answered without locking. Otherwise, if the
    /// snapshot says the dirty map may know more, the lookup takes the lock, consults the dirty
    /// map and records a miss.
    pub fn get<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        {
            let read = self.read.load();
            if let Some(e) = read.m.get(key) {
                return e.load();
            }
            if !read.amended {
                return None;
            }
        }
        self.locked_lookup(key)?.load()
    }

    /// Check whether `key` currently has a live value.
    pub fn contains_key<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        {
            let read = self.read.load();
            if let Some(e) = read.m.get(key) {
                return e.is_live();
            }
            if !read.amended {
                return false;
            }
        }
        self.locked_lookup(key).is_some_and(|e| e.is_live())
    }

    /// Sets the value for `key`. Concurrent stores to the same key resolve last-store-wins.
    ///
    /// # Arguments
    ///
    /// * `key` - The key to store under.
    /// * `value` - The new value; any previous value is dropped once no reader holds it.
    pub fn insert(&self, key: K, value: V) {
        let new = Arc::new(Slot::Value(value));

        {
            let read = self.read.load();
            if let Some(e) = read.m.get(&key) {
                if e.try_store(&new) {
                    return;
                }
            }
        }

        let mut locked = self.locked.lock();
        let read = self.read.load();
        if let Some(e) = read.m.get(&key) {
            if e.unexpunge_locked() {
                self.dirty_locked(&mut locked.dirty)
                    .insert(key, Arc::clone(e));
            }
            e.store_locked(new);
        } else if let Some(e) = locked.dirty.as_ref().and_then(|d| d.get(&key)) {
            e.store_locked(new);
        } else {
            if !read.amended {
                self.amend_locked(&mut locked, &read);
            }
            self.dirty_locked(&mut locked.dirty)
                .insert(key, Arc::new(Entry::new(new)));
        }
    }

    /// Returns the existing value for `key` if there is one, otherwise stores `value`.
    ///
    /// # Returns
    ///
    /// * `(V, bool)` - The value now associated with the key, and `true` if it was already
    ///   present (in which case `value` was dropped) or `false` if `value` was installed.
    pub fn get_or_insert(&self, key: K, value: V) -> (V, bool) {
        {
            let read = self.read.load();
            if let Some(e) = read.m.get(&key) {
                match e.try_load_or_store(&value) {
                    LoadOrStore::Loaded(v) => return (v, true),
                    LoadOrStore::Stored => return (value, false),
                    LoadOrStore::Expunged => {}
                }
            }
        }

        let mut locked = self.locked.lock();
        let read = self.read.load();
        let outcome = if let Some(e) = read.m.get(&key) {
            if e.unexpunge_locked() {
                self.dirty_locked(&mut locked.dirty)
                    .insert(key, Arc::clone(e));
            }
            e.try_load_or_store(&value)
        } else if let Some(e) = locked.dirty.as_ref().and_then(|d| d.get(&key)).cloned() {
            let outcome = e.try_load_or_store(&value);
            self.miss_locked(&mut locked);
            outcome
        } else {
            if !read.amended {
                self.amend_locked(&mut locked, &read);
            }
            let entry = Entry::new(Arc::new(Slot::Value(value.clone())));
            self.dirty_locked(&mut locked.dirty)
                .insert(key, Arc::new(entry));
            LoadOrStore::Stored
        };

        match outcome {
            LoadOrStore::Loaded(v) => (v, true),
            // Entries reachable under the lock are never expunged: the snapshot entry was just
            // revived and dirty entries are never expunged.
            LoadOrStore::Stored | LoadOrStore::Expunged => (value, false),
        }
    }

    /// Like [`get_or_insert`](Self::get_or_insert), but only builds the value when the key has
    /// no live value in the snapshot.
    ///
    /// `f` runs without the lock held. If another thread installs a value first, the one `f`
    /// produced is dropped and the winner is returned with `true`.
    pub fn get_or_insert_with<F: FnOnce() -> V>(&self, key: K, f: F) -> (V, bool) {
        {
            let read = self.read.load();
            if let Some(v) = read.m.get(&key).and_then(|e| e.load()) {
                return (v, true);
            }
        }
        self.get_or_insert(key, f())
    }

    /// Deletes the value for `key`, returning it if one was present.
    ///
    /// A key found in the snapshot is cleared in place and the deletion is visible to all readers
    /// at once. A key only the dirty map knows is removed from it outright.
    pub fn remove<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        {
            let read = self.read.load();
            if let Some(e) = read.m.get(key) {
                return e.delete();
            }
            if !read.amended {
                return None;
            }
        }

        let entry = {
            let mut locked = self.locked.lock();
            let read = self.read.load();
            match read.m.get(key) {
                Some(e) => Arc::clone(e),
                None if read.amended => locked.dirty.as_mut().and_then(|d| d.remove(key))?,
                None => return None,
            }
        };
        entry.delete()
    }

    /// Calls `f` for each key with a live value, stopping as soon as `f` returns false.
    ///
    /// If the snapshot is amended, the dirty map is promoted first: the walk costs O(n) anyway, so
    /// paying for the promotion here is free. The walk itself runs without the lock. No key is
    /// visited twice, but this is not a frozen view: a key written or deleted concurrently may be
    /// seen with any value it held during the call, and keys added after the walk starts may or
    /// may not be visited.
    pub fn for_each<F>(&self, mut f: F)
    where
        F: FnMut(&K, &V) -> bool,
    {
        let mut read = self.read.load_full();
        if read.amended {
            let mut locked = self.locked.lock();
            read = self.read.load_full();
            if read.amended {
                if let Some(promoted) = self.promote_locked(&mut locked) {
                    trace!("promoted dirty map of {} entries for iteration", promoted.m.len());
                    read = promoted;
                }
            }
        }

        for (k, e) in read.m.iter() {
            let slot = e.load_slot();
            if let Slot::Value(v) = &*slot {
                if !f(k, v) {
                    break;
                }
            }
        }
    }

    /// Returns an iterator over cloned key-value pairs collected with [`for_each`](Self::for_each).
    pub fn iter(&self) -> std::vec::IntoIter<(K, V)> {
        let mut items = Vec::new();
        self.for_each(|k, v| {
            items.push((k.clone(), v.clone()));
            true
        });
        items.into_iter()
    }

    /// Returns an iterator over the cloned keys present at the moment of call.
    pub fn keys(&self) -> std::vec::IntoIter<K> {
        let mut keys = Vec::new();
        self.for_each(|k, _| {
            keys.push(k.clone());
            true
        });
        keys.into_iter()
    }

    /// Returns an iterator over the cloned values present at the moment of call.
    pub fn values(&self) -> std::vec::IntoIter<V> {
        let mut vals = Vec::new();
        self.for_each(|_, v| {
            vals.push(v.clone());
            true
        });
        vals.into_iter()
    }

    /// Counts the live keys by walking the map.
    ///
    /// This is O(n), may promote the dirty map, and under concurrent writers is only a snapshot
    /// in the same weak sense as [`for_each`](Self::for_each).
    pub fn len(&self) -> usize {
        let mut n = 0;
        self.for_each(|_, _| {
            n += 1;
            true
        });
        n
    }

    /// Returns true if no key has a live value.
    pub fn is_empty(&self) -> bool {
        let mut empty = true;
        self.for_each(|_, _| {
            empty = false;
            false
        });
        empty
    }

    /// Removes every key.
    pub fn clear(&self) {
        {
            let read = self.read.load();
            if read.m.is_empty() && !read.amended {
                return;
            }
        }

        let mut locked = self.locked.lock();
        let read = self.read.load();
        if !read.m.is_empty() || read.amended {
            self.read.store(Arc::new(ReadOnly::empty(&self.hasher)));
        }
        locked.dirty = None;
        locked.misses = 0;
    }

    /// Returns a reference to the map's hash builder.
    pub fn hasher(&self) -> &S {
        &self.hasher
    }

    // ============================================================================================
    // LOCKED HELPERS
    // ============================================================================================

    /// Slow-path lookup. Re-checks the snapshot under the lock, since a promotion may have landed
    /// since the caller's lock-free probe, and only then falls back to the dirty map.
    fn locked_lookup<Q>(&self, key: &Q) -> Option<Arc<Entry<V>>>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let mut locked = self.locked.lock();
        let read = self.read.load();
        if let Some(e) = read.m.get(key) {
            return Some(Arc::clone(e));
        }
        if !read.amended {
            return None;
        }
        let entry = locked.dirty.as_ref().and_then(|d| d.get(key)).cloned();
        self.miss_locked(&mut locked);
        entry
    }

    /// Records a miss and promotes the dirty map once misses have caught up with its size.
    fn miss_locked(&self, locked: &mut DirtyState<K, V, S>) {
        locked.misses += 1;
        let dirty_len = locked.dirty.as_ref().map_or(0, HashMap::len);
        if locked.misses < dirty_len {
            return;
        }
        let misses = locked.misses;
        if self.promote_locked(locked).is_some() {
            trace!("promoted dirty map of {} entries after {} misses", dirty_len, misses);
        }
    }

    /// Publishes the dirty map as the new, complete snapshot and resets the miss count.
    fn promote_locked(&self, locked: &mut DirtyState<K, V, S>) -> Option<Arc<ReadOnly<K, V, S>>> {
        locked.misses = 0;
        let dirty = locked.dirty.take()?;
        let read = Arc::new(ReadOnly {
            m: Arc::new(dirty),
            amended: false,
        });
        self.read.store(Arc::clone(&read));
        Some(read)
    }

    /// Prepares for the first key the snapshot does not know: makes sure the dirty map exists and
    /// republishes the current mapping flagged as amended.
    fn amend_locked(&self, locked: &mut DirtyState<K, V, S>, read: &ReadOnly<K, V, S>) {
        self.dirty_locked(&mut locked.dirty);
        self.read.store(Arc::new(ReadOnly {
            m: Arc::clone(&read.m),
            amended: true,
        }));
    }

    /// Returns the dirty map, building it from the snapshot if it is absent.
    ///
    /// Snapshot entries that are empty get expunged and left out; every other entry is shared
    /// into the new map by reference. This is what lets keys deleted before the last promotion
    /// finally drop out of the map.
    fn dirty_locked<'a>(
        &self,
        dirty: &'a mut Option<EntryMap<K, V, S>>,
    ) -> &'a mut EntryMap<K, V, S> {
        dirty.get_or_insert_with(|| {
            let read = self.read.load();
            let mut fresh = HashMap::with_capacity_and_hasher(
                read.m.len().max(self.capacity),
                self.hasher.clone(),
            );
            for (k, e) in read.m.iter() {
                if !e.try_expunge_locked() {
                    fresh.insert(k.clone(), Arc::clone(e));
                }
            }
            trace!(
                "materialized dirty map: kept {} of {} snapshot entries",
                fresh.len(),
                read.m.len()
            );
            fresh
        })
    }
}

// ================================================================================================
// STANDARD TRAIT IMPLEMENTATIONS
// ================================================================================================

impl<K: Eq + Hash + Clone, V: Clone, S: BuildHasher + Clone + Default> Default
    for SyncMap<K, V, S>
{
    fn default() -> Self {
        Self::with_hasher(S::default())
    }
}

impl<'a, K: Eq + Hash + Clone, V: Clone, S: BuildHasher + Clone> IntoIterator
    for &'a SyncMap<K, V, S>
{
    type Item = (K, V);
    type IntoIter = std::vec::IntoIter<(K, V)>;
    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

impl<K: Eq + Hash + Clone, V: Clone, S: BuildHasher + Clone + Default> FromIterator<(K, V)>
    for SyncMap<K, V, S>
{
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        let map = SyncMap::with_hasher(S::default());
        for (k, v) in iter {
            map.insert(k, v);
        }
        map
    }
}

impl<K: Eq + Hash + Clone, V: Clone, S: BuildHasher + Clone> Extend<(K, V)> for SyncMap<K, V, S> {
    fn extend<T: IntoIterator<Item = (K, V)>>(&mut self, iter: T) {
        for (k, v) in iter {
            self.insert(k, v);
        }
    }
}

impl<K, V, S> fmt::Debug for SyncMap<K, V, S>
where
    K: Eq + Hash + Clone + fmt::Debug,
    V: Clone + fmt::Debug,
    S: BuildHasher + Clone,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut out = f.debug_map();
        self.for_each(|k, v| {
            out.entry(k, v);
            true
        });
        out.finish()
    }
}
