//! Filter Store: the key-value tables read by the kernel instrumentation
//! layer to decide which events must be forwarded to userspace.
//!
//! The tables are accessed through the [`FilterTable`] capability so the
//! coordinator logic runs unchanged against pinned BPF maps ([`pinned`]) or
//! the in-memory double used by tests ([`memory`]).

use std::{fmt::Debug, sync::Arc};

use thiserror::Error;

mod keys;
pub mod memory;
pub mod pinned;

pub use keys::{COMM_LEN, CONTAINER_ID_LEN, CommKey, ContainerIdKey};

/// Event types the kernel forwards. Key: event type, value: enabled flag.
pub const TRACED_EVENT_TYPES: &str = "traced_event_types";
/// Command names being traced. Value: expiry as kernel-monotonic nanoseconds.
pub const TRACED_COMMS: &str = "traced_comms";
/// Process ids being traced. Value: expiry as kernel-monotonic nanoseconds.
pub const TRACED_PIDS: &str = "traced_pids";
/// Cgroups the kernel started tracing on its own.
pub const TRACED_CGROUPS: &str = "traced_cgroups";
/// Containers which must not be traced again before the stored expiry.
pub const CGROUPS_WAIT_LIST: &str = "cgroups_wait_list";

#[derive(Error, Debug)]
pub enum FilterError {
    #[error("filter table {0} not found")]
    TableNotFound(String),
    #[error("accessing filter table {name}")]
    Map {
        name: String,
        #[source]
        source: aya::maps::MapError,
    },
    #[error("write rejected by filter table {0}")]
    Rejected(String),
    #[error("filter table {0} has an unexpected layout")]
    InvalidLayout(String),
}

/// Plain data which can be copied in and out of a kernel table.
pub trait TableEntry: aya::Pod + Ord + Debug + Send + Sync + 'static {}

impl<T> TableEntry for T where T: aya::Pod + Ord + Debug + Send + Sync + 'static {}

/// A single key-value table of the Filter Store.
///
/// Calls are synchronous and bounded: they are issued while the activity
/// dump manager holds its lock.
pub trait FilterTable<K, V>: Send + Sync {
    fn name(&self) -> &str;

    /// Inserts or overwrites `key`.
    fn put(&self, key: &K, value: &V) -> Result<(), FilterError>;

    /// Current content of the table. Entries which can't be read are
    /// reported individually.
    fn entries(&self) -> Vec<Result<(K, V), FilterError>>;
}

/// Source of filter tables, looked up by name.
pub trait TableProvider {
    fn open<K: TableEntry, V: TableEntry>(
        &mut self,
        name: &str,
    ) -> Result<Arc<dyn FilterTable<K, V>>, FilterError>;
}

/// Every table used by the activity dump manager.
#[derive(Clone)]
pub struct FilterStore {
    pub traced_event_types: Arc<dyn FilterTable<u32, u64>>,
    pub traced_comms: Arc<dyn FilterTable<CommKey, u64>>,
    pub traced_pids: Arc<dyn FilterTable<u32, u64>>,
    pub traced_cgroups: Arc<dyn FilterTable<ContainerIdKey, u64>>,
    pub cgroups_wait_list: Arc<dyn FilterTable<ContainerIdKey, u64>>,
}

impl FilterStore {
    /// Opens all the tables. A missing table is a configuration error.
    pub fn open(provider: &mut impl TableProvider) -> Result<Self, FilterError> {
        Ok(Self {
            traced_event_types: provider.open(TRACED_EVENT_TYPES)?,
            traced_comms: provider.open(TRACED_COMMS)?,
            traced_pids: provider.open(TRACED_PIDS)?,
            traced_cgroups: provider.open(TRACED_CGROUPS)?,
            cgroups_wait_list: provider.open(CGROUPS_WAIT_LIST)?,
        })
    }
}
