use std::{
    fmt, fs, io,
    path::{Path, PathBuf},
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use bpf_filters::{CommKey, FilterTable};
use chrono::{DateTime, SecondsFormat, Utc};
use dump_core::{
    Pid,
    event::{Event, EventType},
    process_cache::ProcessEntry,
    procfs::{self, ProcfsError},
    time::{TimeResolver, Timestamp},
};
use thiserror::Error;

use crate::{
    api::SecurityActivityDumpMessage,
    graph,
    stats::{EVENTS_PROCESSED, StatsError, StatsSink},
    tags::{TagsError, TagsResolver},
    tree::{ActivityDumpDocument, ActivityTree, NodeGeneration},
};

#[derive(Error, Debug)]
pub enum DumpError {
    #[error("activity dump selector is empty")]
    EmptySelector,
    #[error("activity dump can't select both container {container_id} and comm {comm}")]
    AmbiguousSelector { container_id: String, comm: String },
    #[error("couldn't snapshot process {pid}")]
    Snapshot {
        pid: Pid,
        #[source]
        source: ProcfsError,
    },
    #[error("couldn't write {path}")]
    Persist {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("couldn't serialize activity dump")]
    Serialize(#[from] serde_json::Error),
    #[error("couldn't resolve tags")]
    Tags(#[from] TagsError),
    #[error("couldn't send stats")]
    Stats(#[from] StatsError),
}

/// Identity of a dump. Container ids and command names are mutually exclusive.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Selector {
    ContainerId(String),
    Comm(String),
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Selector::ContainerId(id) => write!(f, "container_id:{id}"),
            Selector::Comm(comm) => write!(f, "comm:{comm}"),
        }
    }
}

/// Parameters filled by the callback given to [`ActivityDump::new`].
#[derive(Debug, Clone, Default)]
pub struct DumpSpec {
    pub container_id: Option<String>,
    pub comm: Option<String>,
    pub timeout: Duration,
    pub differentiate_args: bool,
    pub with_graph: bool,
}

impl DumpSpec {
    fn selector(&self) -> Result<Selector, DumpError> {
        let container_id = self.container_id.as_deref().filter(|id| !id.is_empty());
        let comm = self.comm.as_deref().filter(|comm| !comm.is_empty());
        match (container_id, comm) {
            (Some(id), None) => Ok(Selector::ContainerId(id.to_string())),
            // the kernel keys comms by their truncated form
            (None, Some(comm)) => Ok(Selector::Comm(CommKey::new(comm).as_str().to_string())),
            (None, None) => Err(DumpError::EmptySelector),
            (Some(id), Some(comm)) => Err(DumpError::AmbiguousSelector {
                container_id: id.to_string(),
                comm: comm.to_string(),
            }),
        }
    }
}

/// Collaborators shared by every dump of a manager.
pub struct DumpContext {
    pub time: TimeResolver,
    pub traced_pids: Arc<dyn FilterTable<u32, u64>>,
    pub traced_event_types: Vec<EventType>,
    pub tags_resolver: Arc<dyn TagsResolver>,
    pub stats: Arc<dyn StatsSink>,
    pub output_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DumpStatus {
    Open,
    Closed,
}

struct DumpState {
    status: DumpStatus,
    end: Option<SystemTime>,
    tree: ActivityTree,
    tags: Vec<String>,
    output_file: Option<PathBuf>,
    graph_file: Option<PathBuf>,
}

/// A time-bounded recording of the processes selected by a container id or
/// a command name.
pub struct ActivityDump {
    ctx: Arc<DumpContext>,
    selector: Selector,
    start: SystemTime,
    timeout: Duration,
    differentiate_args: bool,
    with_graph: bool,
    state: Mutex<DumpState>,
    processed: [AtomicU64; EventType::ALL.len()],
}

impl ActivityDump {
    pub fn new(
        ctx: Arc<DumpContext>,
        populate: impl FnOnce(&mut DumpSpec),
    ) -> Result<Arc<Self>, DumpError> {
        let mut spec = DumpSpec::default();
        populate(&mut spec);
        let selector = spec.selector()?;
        let start = ctx.time.now();
        Ok(Arc::new(Self {
            ctx,
            selector,
            start,
            timeout: spec.timeout,
            differentiate_args: spec.differentiate_args,
            with_graph: spec.with_graph,
            state: Mutex::new(DumpState {
                status: DumpStatus::Open,
                end: None,
                tree: ActivityTree::default(),
                tags: Vec::new(),
                output_file: None,
                graph_file: None,
            }),
            processed: Default::default(),
        }))
    }

    fn lock(&self) -> MutexGuard<'_, DumpState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn selector(&self) -> &Selector {
        &self.selector
    }

    pub fn comm(&self) -> Option<&str> {
        match &self.selector {
            Selector::Comm(comm) => Some(comm),
            Selector::ContainerId(_) => None,
        }
    }

    pub fn container_id(&self) -> Option<&str> {
        match &self.selector {
            Selector::ContainerId(id) => Some(id),
            Selector::Comm(_) => None,
        }
    }

    pub fn comm_matches(&self, comm: &str) -> bool {
        self.comm() == Some(CommKey::new(comm).as_str())
    }

    pub fn start(&self) -> SystemTime {
        self.start
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn status(&self) -> DumpStatus {
        self.lock().status
    }

    pub fn is_expired(&self, now: SystemTime) -> bool {
        now >= self.start + self.timeout
    }

    /// End of the dump as a kernel-monotonic timestamp.
    pub fn timeout_raw(&self) -> Timestamp {
        self.ctx.time.compute_monotonic(self.start + self.timeout)
    }

    /// Whether the process is selected by this dump.
    pub fn matches(&self, process: &ProcessEntry) -> bool {
        match &self.selector {
            Selector::ContainerId(id) => process.container_id.as_deref() == Some(id),
            Selector::Comm(comm) => CommKey::new(&process.comm).as_str() == comm,
        }
    }

    /// Records a live event. Returns false when the event is not relevant.
    pub fn insert(&self, event: &Event) -> bool {
        let event_type = event.event_type();
        if !self.ctx.traced_event_types.contains(&event_type) {
            return false;
        }
        let process = event.process();

        let mut state = self.lock();
        if state.status == DumpStatus::Closed {
            return false;
        }
        let matches = self.matches(&process);
        if !matches && !state.tree.is_traced(process.pid) && !state.tree.is_traced(process.ppid)
        {
            return false;
        }

        let (id, created) = state.tree.find_or_create(
            &process,
            NodeGeneration::Runtime,
            self.differentiate_args,
            matches,
        );
        state.tree.node_mut(id).record(&event.payload);
        drop(state);

        if created {
            self.update_traced_pid_timeout(process.pid);
        }
        self.processed[event_type.index()].fetch_add(1, Ordering::Relaxed);
        true
    }

    /// Adds already running processes, `lineage` being ordered from the root
    /// of the process tree down to the selected process. Returns the number
    /// of nodes created.
    pub fn seed_lineage(&self, lineage: &[ProcessEntry]) -> usize {
        let mut state = self.lock();
        if state.status == DumpStatus::Closed {
            return 0;
        }
        let created: Vec<Pid> = lineage
            .iter()
            .filter_map(|entry| {
                let (_, created) = state.tree.find_or_create(
                    entry,
                    NodeGeneration::Snapshot,
                    self.differentiate_args,
                    self.matches(entry),
                );
                created.then_some(entry.pid)
            })
            .collect();
        drop(state);

        created
            .iter()
            .for_each(|pid| self.update_traced_pid_timeout(*pid));
        created.len()
    }

    /// Makes sure the kernel keeps tracing `pid` until the end of the dump.
    pub fn update_traced_pid_timeout(&self, pid: Pid) {
        let expiry = self.timeout_raw().raw();
        if let Err(err) = self.ctx.traced_pids.put(&(pid.as_raw() as u32), &expiry) {
            log::debug!("couldn't insert activity dump filter pid({pid}): {err}");
        }
    }

    /// Pids in the order their node entered the tree.
    pub fn observed_pids(&self) -> Vec<Pid> {
        self.lock()
            .tree
            .nodes()
            .map(|(_, node)| node.process.pid)
            .collect()
    }

    /// Backfills the open files of the processes which were already running
    /// when the dump started. Returns the number of processes read.
    pub fn snapshot(&self) -> Result<usize, DumpError> {
        let pending: Vec<Pid> = {
            let state = self.lock();
            if state.status == DumpStatus::Closed {
                return Ok(0);
            }
            state
                .tree
                .nodes()
                .filter(|(_, node)| {
                    node.traced && !node.snapshotted && node.generation == NodeGeneration::Snapshot
                })
                .map(|(_, node)| node.process.pid)
                .collect()
        };

        // procfs is read without holding the lock, events keep flowing meanwhile
        let mut files = Vec::with_capacity(pending.len());
        for pid in pending {
            match procfs::get_process_open_files(pid) {
                Ok(open_files) => files.push((pid, open_files)),
                Err(_) if !Path::new(&format!("/proc/{pid}")).exists() => {
                    log::debug!("{pid} exited before being snapshotted");
                    files.push((pid, Vec::new()));
                }
                Err(source) => return Err(DumpError::Snapshot { pid, source }),
            }
        }

        let mut state = self.lock();
        let count = files.len();
        for (pid, open_files) in files {
            if let Some(id) = state.tree.find(pid) {
                let node = state.tree.node_mut(id);
                node.snapshotted = true;
                node.files
                    .extend(open_files.iter().map(|file| file.to_string_lossy().into_owned()));
            }
        }
        Ok(count)
    }

    /// Closes the dump and persists it when an output directory is
    /// configured. Closing an already closed dump does nothing.
    pub fn done(&self) -> Result<(), DumpError> {
        let mut state = self.lock();
        if state.status == DumpStatus::Closed {
            return Ok(());
        }
        state.status = DumpStatus::Closed;
        state.end = Some(self.ctx.time.now());

        let Some(output_dir) = &self.ctx.output_dir else {
            return Ok(());
        };
        let document = self.document(&state);
        let path = output_dir.join(format!("{}.json", self.file_stem()));
        let json = serde_json::to_vec_pretty(&document)?;
        fs::write(&path, json).map_err(|source| DumpError::Persist {
            path: path.clone(),
            source,
        })?;
        log::info!("activity dump [{}] written to {}", self.selector, path.display());
        state.output_file = Some(path);

        if self.with_graph {
            let path = output_dir.join(format!("{}.dot", self.file_stem()));
            fs::write(&path, graph::render(&document)).map_err(|source| DumpError::Persist {
                path: path.clone(),
                source,
            })?;
            state.graph_file = Some(path);
        }
        Ok(())
    }

    fn file_stem(&self) -> String {
        let selector: String = self
            .selector
            .to_string()
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
            .collect();
        let start = self
            .start
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        format!("activity-dump-{selector}-{start}")
    }

    /// Resolves the container tags, unless they are already known.
    pub fn resolve_tags(&self) -> Result<(), DumpError> {
        let Some(container_id) = self.container_id() else {
            return Ok(());
        };
        if !self.lock().tags.is_empty() {
            return Ok(());
        }
        let tags = self.ctx.tags_resolver.resolve(container_id)?;
        self.lock().tags = tags;
        Ok(())
    }

    /// Emits the number of events recorded since the previous call.
    pub fn send_stats(&self) -> Result<(), DumpError> {
        for event_type in EventType::ALL {
            let counter = &self.processed[event_type.index()];
            let count = counter.swap(0, Ordering::Relaxed);
            if count == 0 {
                continue;
            }
            let tags = [format!("event_type:{event_type}")];
            if let Err(err) = self.ctx.stats.count(EVENTS_PROCESSED, count as i64, &tags) {
                // keep the events for the next attempt
                counter.fetch_add(count, Ordering::Relaxed);
                return Err(err.into());
            }
        }
        Ok(())
    }

    pub fn to_message(&self) -> SecurityActivityDumpMessage {
        let state = self.lock();
        SecurityActivityDumpMessage {
            comm: self.comm().unwrap_or_default().to_string(),
            container_id: self.container_id().unwrap_or_default().to_string(),
            start: DateTime::<Utc>::from(self.start).to_rfc3339_opts(SecondsFormat::Secs, true),
            timeout: format_timeout(self.timeout),
            differentiate_args: self.differentiate_args,
            with_graph: self.with_graph,
            output_file: state.output_file.clone(),
            graph_file: state.graph_file.clone(),
            tags: state.tags.clone(),
            error: None,
        }
    }

    pub fn to_document(&self) -> ActivityDumpDocument {
        self.document(&self.lock())
    }

    fn document(&self, state: &DumpState) -> ActivityDumpDocument {
        ActivityDumpDocument {
            comm: self.comm().map(str::to_string),
            container_id: self.container_id().map(str::to_string),
            start: self.start.into(),
            end: state.end.map(Into::into),
            timeout_secs: self.timeout.as_secs(),
            differentiate_args: self.differentiate_args,
            with_graph: self.with_graph,
            tags: state.tags.clone(),
            processes: state.tree.to_documents(),
        }
    }
}

fn format_timeout(timeout: Duration) -> String {
    let secs = timeout.as_secs();
    match (secs / 3600, secs % 3600 / 60, secs % 60) {
        (0, 0, s) => format!("{s}s"),
        (0, m, 0) => format!("{m}m"),
        (0, m, s) => format!("{m}m{s}s"),
        (h, m, s) => format!("{h}h{m}m{s}s"),
    }
}

#[cfg(test)]
mod tests {
    use bpf_filters::memory::MemoryTable;
    use dump_core::{
        event::Payload,
        time::{Clock, ManualClock},
    };

    use super::*;
    use crate::{stats::LogSink, tags::HostTagsResolver};

    fn context_with_clock(
        clock: Arc<ManualClock>,
        output_dir: Option<PathBuf>,
    ) -> (Arc<DumpContext>, MemoryTable<u32, u64>) {
        let traced_pids = MemoryTable::new(bpf_filters::TRACED_PIDS);
        let ctx = DumpContext {
            time: TimeResolver::new(clock),
            traced_pids: Arc::new(traced_pids.clone()),
            traced_event_types: EventType::ALL.to_vec(),
            tags_resolver: Arc::new(HostTagsResolver::new()),
            stats: Arc::new(LogSink),
            output_dir,
        };
        (Arc::new(ctx), traced_pids)
    }

    fn context(output_dir: Option<PathBuf>) -> (Arc<DumpContext>, MemoryTable<u32, u64>) {
        context_with_clock(Arc::new(ManualClock::default()), output_dir)
    }

    fn process(pid: i32, ppid: i32, comm: &str) -> ProcessEntry {
        ProcessEntry {
            filename: format!("/usr/bin/{comm}"),
            ..ProcessEntry::new(Pid::from_raw(pid), Pid::from_raw(ppid), comm)
        }
    }

    fn curl_dump(ctx: Arc<DumpContext>) -> Arc<ActivityDump> {
        ActivityDump::new(ctx, |spec| {
            spec.comm = Some("curl".to_string());
            spec.timeout = Duration::from_secs(60);
        })
        .unwrap()
    }

    #[test]
    fn selector_validation() {
        let (ctx, _) = context(None);
        assert!(matches!(
            ActivityDump::new(ctx.clone(), |_| {}),
            Err(DumpError::EmptySelector)
        ));
        assert!(matches!(
            ActivityDump::new(ctx.clone(), |spec| {
                spec.comm = Some("curl".to_string());
                spec.container_id = Some("abc".to_string());
            }),
            Err(DumpError::AmbiguousSelector { .. })
        ));
        let dump = ActivityDump::new(ctx, |spec| spec.container_id = Some("abc".to_string()))
            .unwrap();
        assert_eq!(dump.selector().to_string(), "container_id:abc");
    }

    #[test]
    fn comm_selector_uses_kernel_width() {
        let (ctx, _) = context(None);
        let dump = ActivityDump::new(ctx, |spec| {
            spec.comm = Some("kube-controller-manager".to_string());
        })
        .unwrap();
        assert_eq!(dump.comm(), Some("kube-controller"));
        assert!(dump.comm_matches("kube-controller-manager"));
        assert!(dump.comm_matches("kube-controller-other"));
        assert!(!dump.comm_matches("kube-scheduler"));
        assert!(dump.matches(&process(7, 1, "kube-controller")));
    }

    #[test]
    fn insert_filters_unrelated_processes() {
        let (ctx, traced_pids) = context(None);
        let dump = curl_dump(ctx);

        let open = |process| {
            Event::new(
                Timestamp::from(1),
                process,
                Payload::FileOpened {
                    filename: "/etc/hosts".to_string(),
                    flags: 0,
                },
            )
        };
        assert!(!dump.insert(&open(process(10, 1, "wget"))));
        assert!(dump.insert(&open(process(11, 1, "curl"))));
        // children of a traced process are traced too
        assert!(dump.insert(&open(process(12, 11, "sh"))));
        assert_eq!(traced_pids.len(), 2);

        let document = dump.to_document();
        assert_eq!(document.processes.len(), 1);
        assert_eq!(document.processes[0].files, vec!["/etc/hosts".to_string()]);
        assert_eq!(document.processes[0].children[0].comm, "sh");
    }

    #[test]
    fn closed_dump_is_immutable() {
        let (ctx, _) = context(None);
        let dump = curl_dump(ctx);
        dump.done().unwrap();
        assert_eq!(dump.status(), DumpStatus::Closed);
        let event = Event::new(Timestamp::from(1), process(11, 1, "curl"), Payload::Exit {
            exit_code: 0,
        });
        assert!(!dump.insert(&event));
        assert_eq!(dump.seed_lineage(&[process(11, 1, "curl")]), 0);
        assert!(dump.to_document().end.is_some());
    }

    #[test]
    fn lineage_seeding_extends_traced_pids() {
        let (ctx, traced_pids) = context(None);
        let dump = curl_dump(ctx);
        let lineage = [process(1, 0, "init"), process(2, 1, "bash"), process(3, 2, "curl")];
        assert_eq!(dump.seed_lineage(&lineage), 3);
        assert_eq!(dump.seed_lineage(&lineage), 0);
        assert_eq!(traced_pids.write_count(), 3);
        assert_eq!(traced_pids.get(&3), Some(dump.timeout_raw().raw()));
        assert_eq!(
            dump.observed_pids(),
            vec![Pid::from_raw(1), Pid::from_raw(2), Pid::from_raw(3)]
        );
    }

    #[test]
    fn expiry() {
        let clock = Arc::new(ManualClock::default());
        let (ctx, _) = context_with_clock(clock.clone(), None);
        let dump = curl_dump(ctx);
        clock.advance(Duration::from_secs(59));
        assert!(!dump.is_expired(clock.now()));
        clock.advance(Duration::from_secs(1));
        assert!(dump.is_expired(clock.now()));
    }

    #[test]
    fn persisted_with_graph() {
        let dir = tempfile::tempdir().unwrap();
        let (ctx, _) = context(Some(dir.path().to_path_buf()));
        let dump = ActivityDump::new(ctx, |spec| {
            spec.comm = Some("curl".to_string());
            spec.with_graph = true;
        })
        .unwrap();
        dump.done().unwrap();

        let message = dump.to_message();
        let output_file = message.output_file.unwrap();
        let document: ActivityDumpDocument =
            serde_json::from_slice(&fs::read(output_file).unwrap()).unwrap();
        assert_eq!(document.comm.as_deref(), Some("curl"));
        assert!(message.graph_file.unwrap().exists());
    }

    #[test]
    fn timeout_format() {
        assert_eq!(format_timeout(Duration::from_secs(30 * 60)), "30m");
        assert_eq!(format_timeout(Duration::from_secs(45)), "45s");
        assert_eq!(format_timeout(Duration::from_secs(3725)), "1h2m5s");
    }
}
