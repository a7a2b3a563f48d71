use std::{
    collections::HashMap,
    hash::Hash,
    sync::{Arc, Weak},
};

use parking_lot::Mutex;

/// Canonical handles keyed by logical location.
///
/// The table only holds weak references: a handle stays canonical while
/// some caller keeps it alive, after which [`MemoTable::sweep`] may drop
/// its slot and a later request builds an equivalent fresh one.
pub struct MemoTable<K, V>(Mutex<MemoTableImpl<K, V>>);

struct MemoTableImpl<K, V> {
    table: HashMap<K, Weak<V>>,
    created: usize,
}

impl<K: Eq + Hash, V> MemoTableImpl<K, V> {
    fn new() -> Self {
        Self {
            table: HashMap::new(),
            created: 0,
        }
    }

    fn get(&self, key: &K) -> Option<Arc<V>> {
        self.table.get(key).and_then(Weak::upgrade)
    }

    fn insert(&mut self, key: K, value: V) -> Arc<V> {
        let value = Arc::new(value);
        self.table.insert(key, Arc::downgrade(&value));
        self.created += 1;
        value
    }

    fn sweep(&mut self) -> usize {
        let before = self.table.len();
        self.table.retain(|_, handle| handle.strong_count() > 0);
        before - self.table.len()
    }
}

impl<K: Eq + Hash, V> Default for MemoTable<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Eq + Hash, V> MemoTable<K, V> {
    pub fn new() -> Self {
        Self(Mutex::new(MemoTableImpl::new()))
    }

    pub fn get(&self, key: &K) -> Option<Arc<V>> {
        self.0.lock().get(key)
    }

    pub fn get_or_add(&self, key: K, make: impl FnOnce() -> V) -> Arc<V> {
        let mut inner = self.0.lock();
        match inner.get(&key) {
            Some(value) => value,
            None => inner.insert(key, make()),
        }
    }

    /// Like [`MemoTable::get_or_add`], but `make` may decline.
    pub fn try_get_or_add(
        &self,
        key: K,
        make: impl FnOnce() -> Option<V>,
    ) -> Option<Arc<V>> {
        let mut inner = self.0.lock();
        if let Some(value) = inner.get(&key) {
            return Some(value);
        }
        let value = make()?;
        Some(inner.insert(key, value))
    }

    /// Handles some caller still holds.
    pub fn live_count(&self) -> usize {
        self.0
            .lock()
            .table
            .values()
            .filter(|handle| handle.strong_count() > 0)
            .count()
    }

    /// Slots in the table, including ones whose handle is gone but that
    /// have not been swept yet.
    pub fn total_count(&self) -> usize {
        self.0.lock().table.len()
    }

    /// Handles built over the table's lifetime.
    pub fn created_count(&self) -> usize {
        self.0.lock().created
    }

    pub fn live_values(&self) -> Vec<Arc<V>> {
        self.0
            .lock()
            .table
            .values()
            .filter_map(Weak::upgrade)
            .collect()
    }

    /// Drop slots whose handle is gone. Returns how many were dropped.
    pub fn sweep(&self) -> usize {
        self.0.lock().sweep()
    }

    pub fn clear(&self) {
        self.0.lock().table.clear();
    }
}
