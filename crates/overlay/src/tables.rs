//! Reference-counted registries of open containers and streams.
//!
//! A `GlobalTable` maps an id to one shared value. `acquire` is an atomic
//! get-or-create that reports whether the value was created, so repeated
//! opens of the same id reuse one instance instead of reopening it from
//! disk. Every acquire hands out a `TableLease`; when the last lease of an
//! id drops, the value is retired outside the table lock and then removed.
//! An acquire that races with a retirement waits for it to finish.
//!
//! Releasing an id more often than it was acquired is a programming error
//! and panics.

use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::sync::Arc;
use tracing::debug;

/// Hook run once when the last lease of a value is released.
pub trait Retire: Send + Sync {
    /// Shut the value down. Runs without the table lock held.
    fn retire(&self);
}

struct TableEntry<V> {
    value: Arc<V>,
    refs: usize,
    retiring: bool,
}

/// Registry of shared values keyed by id.
pub struct GlobalTable<K, V> {
    name: &'static str,
    entries: Mutex<HashMap<K, TableEntry<V>>>,
    retired: Condvar,
}

impl<K, V> fmt::Debug for GlobalTable<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GlobalTable")
            .field("name", &self.name)
            .field("entries", &self.entries.lock().len())
            .finish()
    }
}

impl<K, V> GlobalTable<K, V>
where
    K: Copy + Eq + Hash + fmt::Display,
    V: Retire,
{
    /// Create an empty table. `name` appears in log output.
    pub fn new(name: &'static str) -> Arc<Self> {
        Arc::new(GlobalTable {
            name,
            entries: Mutex::new(HashMap::new()),
            retired: Condvar::new(),
        })
    }

    /// Lease the value of `key`, creating it with `create` if absent.
    ///
    /// Returns the lease and whether this call created the value.
    pub fn acquire<F>(self: &Arc<Self>, key: K, create: F) -> (TableLease<K, V>, bool)
    where
        F: FnOnce() -> V,
    {
        let mut entries = self.entries.lock();
        while entries.get(&key).map(|e| e.retiring).unwrap_or(false) {
            self.retired.wait(&mut entries);
        }

        if let Some(entry) = entries.get_mut(&key) {
            entry.refs += 1;
            let value = Arc::clone(&entry.value);
            return (self.lease(key, value), false);
        }

        let value = Arc::new(create());
        entries.insert(
            key,
            TableEntry {
                value: Arc::clone(&value),
                refs: 1,
                retiring: false,
            },
        );
        debug!(target: "ktlog::tables", table = self.name, key = %key, "Created table entry");
        (self.lease(key, value), true)
    }

    fn lease(self: &Arc<Self>, key: K, value: Arc<V>) -> TableLease<K, V> {
        TableLease {
            table: Arc::clone(self),
            key,
            value,
        }
    }

    /// Value of `key` without taking a lease
    pub fn get(&self, key: K) -> Option<Arc<V>> {
        self.entries
            .lock()
            .get(&key)
            .filter(|e| !e.retiring)
            .map(|e| Arc::clone(&e.value))
    }

    /// Outstanding leases of `key`
    pub fn refs(&self, key: K) -> usize {
        self.entries.lock().get(&key).map(|e| e.refs).unwrap_or(0)
    }

    /// Number of live entries
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether the table holds no entry
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Ids of every live entry
    pub fn keys(&self) -> Vec<K> {
        self.entries
            .lock()
            .iter()
            .filter(|(_, e)| !e.retiring)
            .map(|(k, _)| *k)
            .collect()
    }

    /// Values of every live entry
    pub fn values(&self) -> Vec<Arc<V>> {
        self.entries
            .lock()
            .values()
            .filter(|e| !e.retiring)
            .map(|e| Arc::clone(&e.value))
            .collect()
    }

    fn release(&self, key: K) {
        let value = {
            let mut entries = self.entries.lock();
            let entry = match entries.get_mut(&key) {
                Some(entry) => entry,
                None => panic!("{} table released unknown key {}", self.name, key),
            };
            assert!(entry.refs > 0, "{} table released {} more than acquired", self.name, key);
            entry.refs -= 1;
            if entry.refs > 0 {
                return;
            }
            entry.retiring = true;
            Arc::clone(&entry.value)
        };

        value.retire();

        self.entries.lock().remove(&key);
        self.retired.notify_all();
        debug!(target: "ktlog::tables", table = self.name, key = %key, "Retired table entry");
    }
}

/// One reference to a table value. Dropping the last lease retires it.
pub struct TableLease<K, V>
where
    K: Copy + Eq + Hash + fmt::Display,
    V: Retire,
{
    table: Arc<GlobalTable<K, V>>,
    key: K,
    value: Arc<V>,
}

impl<K, V> TableLease<K, V>
where
    K: Copy + Eq + Hash + fmt::Display,
    V: Retire,
{
    /// Leased value
    pub fn value(&self) -> &Arc<V> {
        &self.value
    }

    /// Key of the leased value
    pub fn key(&self) -> K {
        self.key
    }
}

impl<K, V> fmt::Debug for TableLease<K, V>
where
    K: Copy + Eq + Hash + fmt::Display,
    V: Retire,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TableLease({} {})", self.table.name, self.key)
    }
}

impl<K, V> Drop for TableLease<K, V>
where
    K: Copy + Eq + Hash + fmt::Display,
    V: Retire,
{
    fn drop(&mut self) {
        self.table.release(self.key);
    }
}
