use std::sync::{
    Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard,
};

use bpf_filters::{CommKey, ContainerIdKey, FilterError, FilterStore};
use dump_core::{
    event::{CgroupTracingEvent, Event},
    log_error,
    process_cache::AncestryResolver,
    shutdown::ShutdownSignal,
    time::{Clock, TimeResolver},
};
use thiserror::Error;
use tokio::{task::JoinHandle, time};

use crate::{
    api::{
        DumpActivityParams, GenerateProfileParams, ListActivityDumpsParams,
        SecurityActivityDumpListMessage, SecurityActivityDumpMessage,
        SecurityActivityDumpStoppedMessage, SecurityProfileGeneratedMessage,
        StopActivityDumpParams,
    },
    config::ManagerConfig,
    dump::{ActivityDump, DumpContext, DumpError, Selector},
    profile::{self, ProfileError},
    scheduler::{SchedulerStats, SnapshotConsumer, SnapshotScheduler, snapshot_queue},
    seeding,
    stats::{ACTIVE_DUMPS, StatsSink},
    tags::TagsResolver,
};

#[derive(Error, Debug)]
pub enum ManagerError {
    #[error("filter store error")]
    Filter(#[from] FilterError),
    #[error("couldn't start tracing [{selector}]")]
    StartTracing {
        selector: String,
        #[source]
        source: DumpError,
    },
    #[error(
        "the activity dump manager does not contain any activity dump with the following comm: {0}"
    )]
    NotFound(String),
    #[error(transparent)]
    Profile(#[from] ProfileError),
    #[error("couldn't send metrics for [{selector}]")]
    Stats {
        selector: String,
        #[source]
        source: DumpError,
    },
}

/// Result of the insertion of a dump in the registry.
pub enum InsertOutcome {
    Inserted,
    /// A dump with the same selector is already active.
    Ignored(Arc<ActivityDump>),
}

/// Collaborators of the manager.
pub struct ManagerContext {
    pub clock: Arc<dyn Clock>,
    pub resolver: Arc<dyn AncestryResolver>,
    pub tags_resolver: Arc<dyn TagsResolver>,
    pub stats: Arc<dyn StatsSink>,
}

/// Owns the active activity dumps and keeps the Filter Store in sync with
/// them.
pub struct ActivityDumpManager {
    config: ManagerConfig,
    filters: FilterStore,
    time: TimeResolver,
    resolver: Arc<dyn AncestryResolver>,
    stats: Arc<dyn StatsSink>,
    dump_ctx: Arc<DumpContext>,
    /// Open dumps, in insertion order.
    active_dumps: RwLock<Vec<Arc<ActivityDump>>>,
    scheduler: SnapshotScheduler,
    consumer: Mutex<Option<SnapshotConsumer>>,
}

impl ActivityDumpManager {
    /// Enables the configured event types in the kernel and resumes tracing
    /// of the cgroups found in the Filter Store.
    pub fn new(
        config: ManagerConfig,
        filters: FilterStore,
        ctx: ManagerContext,
    ) -> Result<Arc<Self>, ManagerError> {
        for event_type in &config.traced_event_types {
            filters
                .traced_event_types
                .put(&event_type.as_raw(), &1)?;
        }

        let time = TimeResolver::new(ctx.clock);
        let dump_ctx = Arc::new(DumpContext {
            time: time.clone(),
            traced_pids: filters.traced_pids.clone(),
            traced_event_types: config.traced_event_types.clone(),
            tags_resolver: ctx.tags_resolver,
            stats: ctx.stats.clone(),
            output_dir: config.output_dir.clone(),
        });
        let (scheduler, consumer) = snapshot_queue(config.snapshot_queue_size);

        let manager = Arc::new(Self {
            config,
            filters,
            time,
            resolver: ctx.resolver,
            stats: ctx.stats,
            dump_ctx,
            active_dumps: RwLock::new(Vec::new()),
            scheduler,
            consumer: Mutex::new(Some(consumer)),
        });
        manager.snapshot_traced_cgroups();
        Ok(manager)
    }

    fn read_dumps(&self) -> RwLockReadGuard<'_, Vec<Arc<ActivityDump>>> {
        self.active_dumps
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn write_dumps(&self) -> RwLockWriteGuard<'_, Vec<Arc<ActivityDump>>> {
        self.active_dumps
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    /// Spawns the coordinator loop.
    pub fn start(self: &Arc<Self>, shutdown: ShutdownSignal) -> JoinHandle<()> {
        tokio::spawn(self.clone().run(shutdown))
    }

    /// Coordinator loop: periodic cleanup and tags resolution, plus the
    /// execution of the queued snapshots. Every active dump is closed once
    /// `shutdown` fires.
    pub async fn run(self: Arc<Self>, mut shutdown: ShutdownSignal) {
        let consumer = self
            .consumer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(mut consumer) = consumer else {
            log::error!("activity dump manager already running");
            return;
        };

        let mut cleanup = time::interval_at(
            time::Instant::now() + self.config.cleanup_period,
            self.config.cleanup_period,
        );
        let mut tags = time::interval_at(
            time::Instant::now() + self.config.tags_resolution_period,
            self.config.tags_resolution_period,
        );

        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                _ = cleanup.tick() => self.cleanup(),
                _ = tags.tick() => self.resolve_tags(),
                Some(dump) = consumer.recv() => consumer.execute(dump).await,
            }
        }
        self.stop_all();
    }

    fn finalize(&self, dump: &ActivityDump) {
        if let Err(err) = dump.done() {
            log_error(&format!("couldn't finalize [{}]", dump.selector()), err);
        }
    }

    /// Registers `dump` unless another active dump has the same selector.
    pub fn insert(&self, dump: Arc<ActivityDump>) -> InsertOutcome {
        let mut active_dumps = self.write_dumps();
        if let Some(existing) = active_dumps
            .iter()
            .find(|active| active.selector() == dump.selector())
        {
            return InsertOutcome::Ignored(existing.clone());
        }

        match dump.selector() {
            Selector::ContainerId(container_id) => {
                // the container won't be traced again before a while
                let wait = self.config.default_timeout * self.config.cgroups_wait_list_size;
                let expiry = self.time.compute_monotonic(self.time.now() + wait);
                if let Err(err) = self
                    .filters
                    .cgroups_wait_list
                    .put(&ContainerIdKey::new(container_id), &expiry.raw())
                {
                    log::warn!(
                        "couldn't insert container ID {container_id} to cgroups_wait_list: {err}"
                    );
                }
            }
            Selector::Comm(comm) => {
                if let Err(err) = self
                    .filters
                    .traced_comms
                    .put(&CommKey::new(comm), &dump.timeout_raw().raw())
                {
                    log::warn!("couldn't insert activity dump filter comm({comm}): {err}");
                }
            }
        }

        seeding::seed_traced_processes(&dump, self.resolver.as_ref());
        self.scheduler.schedule(dump.clone());
        active_dumps.push(dump);
        InsertOutcome::Inserted
    }

    /// Starts tracing a container detected by the kernel.
    pub fn handle_cgroup_tracing_event(&self, event: &CgroupTracingEvent) {
        let now = self.time.now();
        let timeout = self
            .time
            .resolve_monotonic(event.expiry_raw)
            .duration_since(now)
            .unwrap_or_default();
        let dump = ActivityDump::new(self.dump_ctx.clone(), |spec| {
            spec.container_id = Some(event.container_id.clone());
            spec.timeout = timeout;
            spec.differentiate_args = true;
            spec.with_graph = true;
        });
        match dump {
            Ok(dump) => match self.insert(dump.clone()) {
                InsertOutcome::Inserted => log::info!("tracing started for [{}]", dump.selector()),
                InsertOutcome::Ignored(_) => {
                    log::debug!("[{}] is already traced", dump.selector())
                }
            },
            Err(err) => log_error(
                &format!("couldn't start tracing [container_id:{}]", event.container_id),
                err,
            ),
        }
    }

    /// Starts tracing a command name. When the command is already traced,
    /// the active dump is returned.
    pub fn dump_activity(
        &self,
        params: &DumpActivityParams,
    ) -> Result<SecurityActivityDumpMessage, ManagerError> {
        let timeout = params.timeout.map_or(self.config.default_timeout, |minutes| {
            time::Duration::from_secs(u64::from(minutes) * 60)
        });
        let dump = ActivityDump::new(self.dump_ctx.clone(), |spec| {
            spec.comm = Some(params.comm.clone());
            spec.timeout = timeout;
            spec.differentiate_args = params.differentiate_args;
            spec.with_graph = params.with_graph;
        })
        .map_err(|source| ManagerError::StartTracing {
            selector: Selector::Comm(params.comm.clone()).to_string(),
            source,
        })?;

        match self.insert(dump.clone()) {
            InsertOutcome::Inserted => {
                log::info!("tracing started for [{}]", dump.selector());
                Ok(dump.to_message())
            }
            InsertOutcome::Ignored(existing) => {
                log::info!("[{}] is already traced", existing.selector());
                Ok(existing.to_message())
            }
        }
    }

    /// Closes the first active dump tracing `params.comm`.
    pub fn stop_activity_dump(
        &self,
        params: &StopActivityDumpParams,
    ) -> Result<SecurityActivityDumpStoppedMessage, ManagerError> {
        let removed = {
            let mut active_dumps = self.write_dumps();
            active_dumps
                .iter()
                .position(|dump| dump.comm_matches(&params.comm))
                .map(|index| active_dumps.remove(index))
        };
        let dump = removed.ok_or_else(|| ManagerError::NotFound(params.comm.clone()))?;
        self.finalize(&dump);
        log::info!("tracing stopped for [{}]", dump.selector());
        Ok(SecurityActivityDumpStoppedMessage::default())
    }

    pub fn list_activity_dumps(
        &self,
        _params: &ListActivityDumpsParams,
    ) -> SecurityActivityDumpListMessage {
        SecurityActivityDumpListMessage {
            dumps: self
                .read_dumps()
                .iter()
                .map(|dump| dump.to_message())
                .collect(),
            error: None,
        }
    }

    /// Active dump with the given selector.
    pub fn get(&self, selector: &Selector) -> Option<Arc<ActivityDump>> {
        self.read_dumps()
            .iter()
            .find(|dump| dump.selector() == selector)
            .cloned()
    }

    /// Closes the expired dumps.
    pub fn cleanup(&self) {
        let now = self.time.now();
        let mut expired = Vec::new();
        self.write_dumps().retain(|dump| {
            if dump.is_expired(now) {
                expired.push(dump.clone());
                false
            } else {
                true
            }
        });
        for dump in expired {
            self.finalize(&dump);
            log::info!("tracing stopped for [{}]: timeout reached", dump.selector());
        }
    }

    /// Retries the resolution of the missing tags.
    pub fn resolve_tags(&self) {
        for dump in self.write_dumps().iter() {
            if let Err(err) = dump.resolve_tags() {
                log::warn!(
                    "couldn't resolve [{}] tags (will try again later): {err}",
                    dump.selector()
                );
            }
        }
    }

    /// Offers a live event to every active dump.
    pub fn process_event(&self, event: &Event) {
        for dump in self.write_dumps().iter() {
            dump.insert(event);
        }
    }

    pub fn generate_profile(
        &self,
        params: &GenerateProfileParams,
    ) -> Result<SecurityProfileGeneratedMessage, ManagerError> {
        let path = profile::generate_profile(&params.activity_dump_file, &self.config.profile_dir)?;
        Ok(SecurityProfileGeneratedMessage {
            profile_path: Some(path),
            error: None,
        })
    }

    /// Emits the metrics of every dump, stopping at the first failure, then
    /// the number of active dumps.
    pub fn send_stats(&self) -> Result<(), ManagerError> {
        let active_dumps = self.write_dumps();
        for dump in active_dumps.iter() {
            dump.send_stats().map_err(|source| ManagerError::Stats {
                selector: dump.selector().to_string(),
                source,
            })?;
        }

        if let Err(err) = self.stats.gauge(ACTIVE_DUMPS, active_dumps.len() as f64, &[]) {
            log_error(&format!("couldn't send {ACTIVE_DUMPS} metric"), err);
        }
        Ok(())
    }

    pub fn scheduler_stats(&self) -> SchedulerStats {
        self.scheduler.stats()
    }

    /// Resumes tracing of the cgroups already traced by the kernel, e.g.
    /// across a restart.
    fn snapshot_traced_cgroups(&self) {
        for entry in self.filters.traced_cgroups.entries() {
            match entry {
                Ok((container_id, expiry_raw)) if !container_id.is_empty() => {
                    self.handle_cgroup_tracing_event(&CgroupTracingEvent {
                        container_id: container_id.to_string(),
                        expiry_raw: expiry_raw.into(),
                    });
                }
                Ok(_) => {}
                Err(err) => log_error(
                    &format!("couldn't iterate over the map {}", self.filters.traced_cgroups.name()),
                    err,
                ),
            }
        }
    }

    fn stop_all(&self) {
        let active_dumps = std::mem::take(&mut *self.write_dumps());
        for dump in active_dumps {
            self.finalize(&dump);
            log::info!("tracing stopped for [{}]: shutting down", dump.selector());
        }
    }
}
