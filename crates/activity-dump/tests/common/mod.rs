#![allow(dead_code)]

use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use activity_dump::{
    ActivityDumpManager, ManagerContext, ManagerError,
    config::ManagerConfig,
    stats::{StatsError, StatsSink},
    tags::{TagsError, TagsResolver},
};
use bpf_filters::{FilterStore, memory::MemoryTables};
use dump_core::{
    Pid,
    event::{Event, Payload},
    process_cache::{ProcessCache, ProcessEntry},
    time::{ManualClock, Timestamp},
};

/// Records every metric, optionally failing.
#[derive(Default)]
pub struct RecordingSink {
    pub gauges: Mutex<Vec<(String, f64)>>,
    pub counts: Mutex<Vec<(String, i64, Vec<String>)>>,
    pub fail_gauges: AtomicBool,
    pub fail_counts: AtomicBool,
}

fn failure(name: &str) -> StatsError {
    StatsError::Send {
        metric: name.to_string(),
        source: std::io::Error::other("statsd unreachable").into(),
    }
}

impl StatsSink for RecordingSink {
    fn gauge(&self, name: &str, value: f64, _tags: &[String]) -> Result<(), StatsError> {
        if self.fail_gauges.load(Ordering::Relaxed) {
            return Err(failure(name));
        }
        self.gauges.lock().unwrap().push((name.to_string(), value));
        Ok(())
    }

    fn count(&self, name: &str, value: i64, tags: &[String]) -> Result<(), StatsError> {
        if self.fail_counts.load(Ordering::Relaxed) {
            return Err(failure(name));
        }
        self.counts
            .lock()
            .unwrap()
            .push((name.to_string(), value, tags.to_vec()));
        Ok(())
    }
}

/// Fails the first `failures` lookups.
#[derive(Default)]
pub struct FlakyTags {
    pub failures: AtomicUsize,
}

impl TagsResolver for FlakyTags {
    fn resolve(&self, container_id: &str) -> Result<Vec<String>, TagsError> {
        let remaining = self.failures.load(Ordering::Relaxed);
        if remaining > 0 {
            self.failures.store(remaining - 1, Ordering::Relaxed);
            return Err(TagsError::Unavailable("tagger not ready".to_string()));
        }
        Ok(vec![format!("container_id:{container_id}")])
    }
}

pub struct Harness {
    pub manager: Arc<ActivityDumpManager>,
    pub clock: Arc<ManualClock>,
    pub cache: Arc<ProcessCache>,
    pub tables: MemoryTables,
    pub stats: Arc<RecordingSink>,
    pub tags: Arc<FlakyTags>,
}

pub fn test_config() -> ManagerConfig {
    ManagerConfig {
        cleanup_period: Duration::from_secs(3600),
        tags_resolution_period: Duration::from_secs(3600),
        ..ManagerConfig::default()
    }
}

pub fn harness() -> Harness {
    harness_with(test_config(), |_, _, _| {})
}

/// Builds a manager over in-memory tables. `setup` runs before the manager
/// is created.
pub fn harness_with(
    config: ManagerConfig,
    setup: impl FnOnce(&MemoryTables, &ProcessCache, &ManualClock),
) -> Harness {
    try_harness(config, MemoryTables::with_all(), setup).unwrap()
}

pub fn try_harness(
    config: ManagerConfig,
    mut tables: MemoryTables,
    setup: impl FnOnce(&MemoryTables, &ProcessCache, &ManualClock),
) -> Result<Harness, ManagerError> {
    let clock = Arc::new(ManualClock::default());
    let cache = Arc::new(ProcessCache::new());
    let stats = Arc::new(RecordingSink::default());
    let tags = Arc::new(FlakyTags::default());
    setup(&tables, cache.as_ref(), clock.as_ref());

    let filters = FilterStore::open(&mut tables)?;
    let ctx = ManagerContext {
        clock: clock.clone(),
        resolver: cache.clone(),
        tags_resolver: tags.clone(),
        stats: stats.clone(),
    };
    let manager = ActivityDumpManager::new(config, filters, ctx)?;
    Ok(Harness {
        manager,
        clock,
        cache,
        tables,
        stats,
        tags,
    })
}

pub fn process(pid: i32, ppid: i32, comm: &str) -> ProcessEntry {
    ProcessEntry {
        filename: format!("/usr/bin/{comm}"),
        ..ProcessEntry::new(Pid::from_raw(pid), Pid::from_raw(ppid), comm)
    }
}

pub fn open_event(process: ProcessEntry, filename: &str) -> Event {
    Event::new(
        Timestamp::from(1),
        process,
        Payload::FileOpened {
            filename: filename.to_string(),
            flags: 0,
        },
    )
}
