use std::{
    collections::{BTreeMap, HashMap},
    path::Path,
    sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard},
};

use crate::{
    Pid,
    event::{Event, Payload},
    procfs::{self, ProcfsError},
    time::Timestamp,
};

/// Kernel `TASK_COMM_LEN` minus the trailing NUL.
pub const COMM_MAX_LEN: usize = 15;

/// What is known about a single process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessEntry {
    pub pid: Pid,
    pub ppid: Pid,
    pub comm: String,
    pub filename: String,
    pub argv: Vec<String>,
    pub container_id: Option<String>,
    pub fork_time: Timestamp,
    pub exec_time: Option<Timestamp>,
}

impl ProcessEntry {
    pub fn new(pid: Pid, ppid: Pid, comm: &str) -> Self {
        Self {
            pid,
            ppid,
            comm: comm.to_string(),
            filename: String::new(),
            argv: Vec::new(),
            container_id: None,
            fork_time: Timestamp::default(),
            exec_time: None,
        }
    }
}

/// Walk contract over the process ancestry.
pub trait AncestryResolver: Send + Sync {
    /// Visits every known process. Implementations must not hold internal
    /// locks while `visit` runs.
    fn walk(&self, visit: &mut dyn FnMut(&ProcessEntry));

    /// Parent of `entry`, or `None` once the root is reached.
    fn next_ancestor(&self, entry: &ProcessEntry) -> Option<ProcessEntry>;
}

#[derive(Debug, Clone)]
pub enum CacheUpdate {
    Fork {
        pid: Pid,
        ppid: Pid,
        timestamp: Timestamp,
        container_id: Option<String>,
    },
    Exec {
        pid: Pid,
        timestamp: Timestamp,
        filename: String,
        argv: Vec<String>,
    },
    Exit {
        pid: Pid,
        timestamp: Timestamp,
    },
    SetNewParent {
        pid: Pid,
        ppid: Pid,
    },
}

#[derive(Default)]
struct CacheState {
    processes: BTreeMap<i32, ProcessEntry>,
    /// updates arrived before the fork of their process
    pending_updates: HashMap<i32, Vec<CacheUpdate>>,
}

/// Process table kept in sync with fork/exec/exit events.
#[derive(Default)]
pub struct ProcessCache {
    state: RwLock<CacheState>,
}

impl ProcessCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, CacheState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, CacheState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn insert(&self, entry: ProcessEntry) {
        self.write().processes.insert(entry.pid.as_raw(), entry);
    }

    pub fn get(&self, pid: Pid) -> Option<ProcessEntry> {
        self.read().processes.get(&pid.as_raw()).cloned()
    }

    pub fn len(&self) -> usize {
        self.read().processes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn update(&self, update: CacheUpdate) {
        self.write().handle_update(update);
    }

    /// Keeps the cache in sync with a live event.
    pub fn apply(&self, event: &Event) {
        let process = &event.header.process;
        let timestamp = event.header.timestamp;
        let update = match &event.payload {
            Payload::Fork { ppid } => CacheUpdate::Fork {
                pid: process.pid,
                ppid: *ppid,
                timestamp,
                container_id: process.container_id.clone(),
            },
            Payload::Exec { filename, argv } => CacheUpdate::Exec {
                pid: process.pid,
                timestamp,
                filename: filename.clone(),
                argv: argv.clone(),
            },
            Payload::Exit { .. } => CacheUpdate::Exit {
                pid: process.pid,
                timestamp,
            },
            _ => {
                self.write()
                    .processes
                    .entry(process.pid.as_raw())
                    .or_insert_with(|| process.clone());
                return;
            }
        };
        self.update(update);
    }

    /// Fills the cache with the processes currently running on the host.
    ///
    /// Processes exiting while being read are skipped.
    pub fn load_from_procfs(&self) -> Result<usize, ProcfsError> {
        let mut loaded = 0;
        for pid in procfs::get_running_processes()? {
            match read_process(pid) {
                Ok(entry) => {
                    self.insert(entry);
                    loaded += 1;
                }
                Err(err) => log::debug!("skipping process {pid}: {err}"),
            }
        }
        log::debug!("loaded {loaded} processes from procfs");
        Ok(loaded)
    }
}

fn read_process(pid: Pid) -> Result<ProcessEntry, ProcfsError> {
    let mut entry = ProcessEntry::new(
        pid,
        procfs::get_process_parent_pid(pid)?,
        &procfs::get_process_comm(pid)?,
    );
    entry.argv = procfs::get_process_command_line(pid)?;
    // kernel threads have no image
    entry.filename = procfs::get_process_image(pid)
        .map(|image| image.to_string_lossy().into_owned())
        .unwrap_or_default();
    entry.container_id = procfs::get_process_container_id(pid)?;
    Ok(entry)
}

/// Name the kernel gives to a task after exec.
fn comm_from_filename(filename: &str) -> String {
    Path::new(filename)
        .file_name()
        .map(|name| name.to_string_lossy())
        .unwrap_or_default()
        .chars()
        .take(COMM_MAX_LEN)
        .collect()
}

impl CacheState {
    fn handle_update(&mut self, update: CacheUpdate) {
        match update {
            CacheUpdate::Fork {
                pid,
                ppid,
                timestamp,
                container_id,
            } => {
                let entry = match self.processes.get(&ppid.as_raw()) {
                    Some(parent) => ProcessEntry {
                        pid,
                        ppid,
                        fork_time: timestamp,
                        exec_time: None,
                        container_id: container_id.or_else(|| parent.container_id.clone()),
                        ..parent.clone()
                    },
                    None => ProcessEntry {
                        fork_time: timestamp,
                        container_id,
                        ..ProcessEntry::new(pid, ppid, "")
                    },
                };
                self.processes.insert(pid.as_raw(), entry);
                if let Some(pending_updates) = self.pending_updates.remove(&pid.as_raw()) {
                    pending_updates
                        .into_iter()
                        .for_each(|update| self.handle_update(update));
                }
            }
            CacheUpdate::Exec {
                pid,
                timestamp,
                ref filename,
                ref argv,
            } => {
                if let Some(p) = self.processes.get_mut(&pid.as_raw()) {
                    p.comm = comm_from_filename(filename);
                    p.filename = filename.clone();
                    p.argv = argv.clone();
                    p.exec_time = Some(timestamp);
                } else {
                    log::debug!("(exec) process {pid} not found in cache, saving for later");
                    self.pending_updates
                        .entry(pid.as_raw())
                        .or_default()
                        .push(update);
                }
            }
            CacheUpdate::Exit { pid, .. } => {
                if self.processes.remove(&pid.as_raw()).is_none() {
                    log::debug!("(exit) process {pid} not found in cache, saving for later");
                    self.pending_updates
                        .entry(pid.as_raw())
                        .or_default()
                        .push(update);
                }
            }
            CacheUpdate::SetNewParent { pid, ppid } => {
                if let Some(p) = self.processes.get_mut(&pid.as_raw()) {
                    p.ppid = ppid;
                } else {
                    log::warn!("{ppid} is the new parent of {pid}, but we couldn't find it")
                }
            }
        }
    }
}

impl AncestryResolver for ProcessCache {
    fn walk(&self, visit: &mut dyn FnMut(&ProcessEntry)) {
        let entries: Vec<ProcessEntry> = self.read().processes.values().cloned().collect();
        entries.iter().for_each(visit);
    }

    fn next_ancestor(&self, entry: &ProcessEntry) -> Option<ProcessEntry> {
        if entry.pid == entry.ppid || entry.ppid.as_raw() == 0 {
            return None;
        }
        self.get(entry.ppid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pid(raw: i32) -> Pid {
        Pid::from_raw(raw)
    }

    #[test]
    fn fork_inherits_parent_image() {
        let cache = ProcessCache::new();
        cache.insert(ProcessEntry {
            filename: "/usr/bin/bash".to_string(),
            argv: vec!["bash".to_string()],
            ..ProcessEntry::new(pid(10), pid(1), "bash")
        });
        cache.update(CacheUpdate::Fork {
            pid: pid(11),
            ppid: pid(10),
            timestamp: Timestamp::from(5),
            container_id: None,
        });

        let child = cache.get(pid(11)).unwrap();
        assert_eq!(child.comm, "bash");
        assert_eq!(child.ppid, pid(10));
        assert_eq!(child.fork_time, Timestamp::from(5));
    }

    #[test]
    fn exec_before_fork_is_replayed() {
        let cache = ProcessCache::new();
        cache.update(CacheUpdate::Exec {
            pid: pid(20),
            timestamp: Timestamp::from(8),
            filename: "/usr/sbin/a-very-long-daemon-name".to_string(),
            argv: vec!["daemon".to_string()],
        });
        assert!(cache.get(pid(20)).is_none());

        cache.update(CacheUpdate::Fork {
            pid: pid(20),
            ppid: pid(1),
            timestamp: Timestamp::from(7),
            container_id: None,
        });
        let entry = cache.get(pid(20)).unwrap();
        assert_eq!(entry.filename, "/usr/sbin/a-very-long-daemon-name");
        assert_eq!(entry.comm, "a-very-long-dae");
        assert_eq!(entry.exec_time, Some(Timestamp::from(8)));
    }

    #[test]
    fn exit_removes_process() {
        let cache = ProcessCache::new();
        cache.insert(ProcessEntry::new(pid(30), pid(1), "sleep"));
        cache.update(CacheUpdate::Exit {
            pid: pid(30),
            timestamp: Timestamp::from(1),
        });
        assert!(cache.is_empty());
    }

    #[test]
    fn ancestors_up_to_the_root() {
        let cache = ProcessCache::new();
        cache.insert(ProcessEntry::new(pid(1), pid(0), "init"));
        cache.insert(ProcessEntry::new(pid(2), pid(1), "sshd"));
        cache.insert(ProcessEntry::new(pid(3), pid(2), "bash"));

        let mut current = cache.get(pid(3)).unwrap();
        let mut chain = vec![current.comm.clone()];
        while let Some(parent) = cache.next_ancestor(&current) {
            chain.push(parent.comm.clone());
            current = parent;
        }
        assert_eq!(chain, ["bash", "sshd", "init"]);

        let mut visited = Vec::new();
        cache.walk(&mut |entry| visited.push(entry.pid.as_raw()));
        assert_eq!(visited, [1, 2, 3]);
    }

    #[test]
    fn walk_does_not_hold_the_lock() {
        let cache = ProcessCache::new();
        cache.insert(ProcessEntry::new(pid(5), pid(1), "cron"));
        cache.walk(&mut |entry| {
            assert!(cache.next_ancestor(entry).is_none());
        });
    }

    #[test]
    fn loads_current_process() {
        let cache = ProcessCache::new();
        assert!(cache.load_from_procfs().unwrap() > 0);
        assert!(cache.get(Pid::this()).is_some());
    }
}
