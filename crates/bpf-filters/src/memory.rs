//! In-memory Filter Store, used when no kernel is around.

use std::{
    any::Any,
    collections::{BTreeMap, HashMap},
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
};

use crate::{
    CGROUPS_WAIT_LIST, CommKey, ContainerIdKey, FilterError, FilterTable, TRACED_CGROUPS,
    TRACED_COMMS, TRACED_EVENT_TYPES, TRACED_PIDS, TableEntry, TableProvider,
};

struct Inner<K, V> {
    name: String,
    entries: Mutex<BTreeMap<K, V>>,
    writes: AtomicUsize,
    fail_puts: AtomicBool,
    fail_iteration: AtomicBool,
}

/// Table backed by a `BTreeMap`. Clones share the same content.
pub struct MemoryTable<K, V> {
    inner: Arc<Inner<K, V>>,
}

impl<K, V> Clone for MemoryTable<K, V> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<K: TableEntry, V: TableEntry> MemoryTable<K, V> {
    pub fn new(name: &str) -> Self {
        Self {
            inner: Arc::new(Inner {
                name: name.to_string(),
                entries: Mutex::new(BTreeMap::new()),
                writes: AtomicUsize::new(0),
                fail_puts: AtomicBool::new(false),
                fail_iteration: AtomicBool::new(false),
            }),
        }
    }

    fn entries_lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<K, V>> {
        self.inner
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get(&self, key: &K) -> Option<V> {
        self.entries_lock().get(key).copied()
    }

    pub fn len(&self) -> usize {
        self.entries_lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshot(&self) -> BTreeMap<K, V> {
        self.entries_lock().clone()
    }

    /// Number of successful `put` calls.
    pub fn write_count(&self) -> usize {
        self.inner.writes.load(Ordering::Relaxed)
    }

    /// Makes every following `put` fail.
    pub fn fail_puts(&self, fail: bool) {
        self.inner.fail_puts.store(fail, Ordering::Relaxed);
    }

    /// Makes every following `entries` call return a single error.
    pub fn fail_iteration(&self, fail: bool) {
        self.inner.fail_iteration.store(fail, Ordering::Relaxed);
    }
}

impl<K: TableEntry, V: TableEntry> FilterTable<K, V> for MemoryTable<K, V> {
    fn name(&self) -> &str {
        &self.inner.name
    }

    fn put(&self, key: &K, value: &V) -> Result<(), FilterError> {
        if self.inner.fail_puts.load(Ordering::Relaxed) {
            return Err(FilterError::Rejected(self.inner.name.clone()));
        }
        self.entries_lock().insert(*key, *value);
        self.inner.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn entries(&self) -> Vec<Result<(K, V), FilterError>> {
        if self.inner.fail_iteration.load(Ordering::Relaxed) {
            return vec![Err(FilterError::Rejected(self.inner.name.clone()))];
        }
        self.entries_lock()
            .iter()
            .map(|(key, value)| Ok((*key, *value)))
            .collect()
    }
}

/// Provider handing out [`MemoryTable`]s created beforehand.
#[derive(Default)]
pub struct MemoryTables {
    tables: HashMap<String, Box<dyn Any + Send>>,
}

impl MemoryTables {
    /// Provider with every table of a [`crate::FilterStore`].
    pub fn with_all() -> Self {
        let mut tables = Self::default();
        tables.create::<u32, u64>(TRACED_EVENT_TYPES);
        tables.create::<CommKey, u64>(TRACED_COMMS);
        tables.create::<u32, u64>(TRACED_PIDS);
        tables.create::<ContainerIdKey, u64>(TRACED_CGROUPS);
        tables.create::<ContainerIdKey, u64>(CGROUPS_WAIT_LIST);
        tables
    }

    pub fn create<K: TableEntry, V: TableEntry>(&mut self, name: &str) -> MemoryTable<K, V> {
        let table = MemoryTable::<K, V>::new(name);
        self.tables
            .insert(name.to_string(), Box::new(table.clone()));
        table
    }

    /// Handle to a table, to inspect or alter it.
    pub fn table<K: TableEntry, V: TableEntry>(&self, name: &str) -> Option<MemoryTable<K, V>> {
        self.tables
            .get(name)
            .and_then(|table| table.downcast_ref::<MemoryTable<K, V>>())
            .cloned()
    }
}

impl TableProvider for MemoryTables {
    fn open<K: TableEntry, V: TableEntry>(
        &mut self,
        name: &str,
    ) -> Result<Arc<dyn FilterTable<K, V>>, FilterError> {
        if !self.tables.contains_key(name) {
            return Err(FilterError::TableNotFound(name.to_string()));
        }
        match self.table::<K, V>(name) {
            Some(table) => Ok(Arc::new(table)),
            None => Err(FilterError::InvalidLayout(name.to_string())),
        }
    }
}
