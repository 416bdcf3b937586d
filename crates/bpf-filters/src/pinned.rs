//! Filter tables backed by BPF hash maps pinned on bpffs by the probes.

use std::{
    marker::PhantomData,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, PoisonError},
};

use aya::maps::{HashMap, Map, MapData, MapError};

use crate::{FilterError, FilterTable, TableEntry, TableProvider};

/// Opens the maps pinned inside a directory, one file per table.
pub struct PinnedTables {
    path: PathBuf,
}

impl PinnedTables {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }
}

impl TableProvider for PinnedTables {
    fn open<K: TableEntry, V: TableEntry>(
        &mut self,
        name: &str,
    ) -> Result<Arc<dyn FilterTable<K, V>>, FilterError> {
        let path = self.path.join(name);
        if !path.exists() {
            return Err(FilterError::TableNotFound(name.to_string()));
        }
        let map_error = |source: MapError| FilterError::Map {
            name: name.to_string(),
            source,
        };
        let data = MapData::from_pin(&path).map_err(map_error)?;
        let map = HashMap::<MapData, K, V>::try_from(Map::HashMap(data)).map_err(|err| match err {
            MapError::InvalidKeySize { .. } | MapError::InvalidValueSize { .. } => {
                FilterError::InvalidLayout(name.to_string())
            }
            source => map_error(source),
        })?;
        log::debug!("opened pinned map {}", path.display());
        Ok(Arc::new(PinnedTable {
            name: name.to_string(),
            map: Mutex::new(map),
            _entry: PhantomData,
        }))
    }
}

struct PinnedTable<K, V> {
    name: String,
    map: Mutex<HashMap<MapData, K, V>>,
    _entry: PhantomData<fn() -> (K, V)>,
}

impl<K: TableEntry, V: TableEntry> FilterTable<K, V> for PinnedTable<K, V> {
    fn name(&self) -> &str {
        &self.name
    }

    fn put(&self, key: &K, value: &V) -> Result<(), FilterError> {
        self.map
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key, value, 0)
            .map_err(|source| FilterError::Map {
                name: self.name.clone(),
                source,
            })
    }

    fn entries(&self) -> Vec<Result<(K, V), FilterError>> {
        self.map
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|entry| {
                entry.map_err(|source| FilterError::Map {
                    name: self.name.clone(),
                    source,
                })
            })
            .collect()
    }
}
