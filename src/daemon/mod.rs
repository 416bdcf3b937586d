use std::{path::Path, sync::Arc, time::Duration};

use activity_dump::{
    ActivityDumpManager, ManagerContext,
    config::{ManagerConfig, SECTION},
    profile,
    stats::{LogSink, StatsSink, StatsdSink},
    tags::HostTagsResolver,
};
use anyhow::{Context, Result};
use bpf_filters::{FilterStore, pinned::PinnedTables};
use dump_core::{
    process_cache::ProcessCache,
    shutdown::{ShutdownSender, ShutdownSignal},
    time::SystemClock,
};
use tokio::{
    signal::unix::{SignalKind, signal},
    task::JoinHandle,
};

mod config;

pub use config::DaemonConfig;

const STATS_PERIOD: Duration = Duration::from_secs(10);

/// Runs the activity dump manager until SIGINT or SIGTERM.
pub async fn run(config_file: Option<&Path>) -> Result<()> {
    let config = match config_file {
        Some(custom_file) => DaemonConfig::with_custom_file(custom_file)?,
        None => DaemonConfig::new()?,
    };
    let manager_config = ManagerConfig::try_from(&config.section(SECTION))
        .with_context(|| format!("Invalid [{SECTION}] configuration"))?;

    let pinned_maps_path = config.pinned_maps_path()?;
    let filters = FilterStore::open(&mut PinnedTables::new(&pinned_maps_path)).with_context(
        || format!("Error opening filter tables in {}", pinned_maps_path.display()),
    )?;

    let cache = Arc::new(ProcessCache::new());
    {
        let cache = cache.clone();
        match tokio::task::spawn_blocking(move || cache.load_from_procfs()).await? {
            Ok(count) => log::debug!("{count} running processes loaded"),
            Err(err) => log::warn!("Error loading running processes: {err}"),
        }
    }

    let stats: Arc<dyn StatsSink> = match manager_config.statsd_address {
        Some(address) => Arc::new(
            StatsdSink::connect(address)
                .with_context(|| format!("Error connecting to statsd at {address}"))?,
        ),
        None => Arc::new(LogSink),
    };

    let manager = ActivityDumpManager::new(
        manager_config,
        filters,
        ManagerContext {
            clock: Arc::new(SystemClock),
            resolver: cache,
            tags_resolver: Arc::new(HostTagsResolver::new()),
            stats,
        },
    )?;

    let (tx_shutdown, shutdown) = ShutdownSignal::new();
    let manager_handle = manager.start(shutdown.clone());
    let stats_handle = start_stats_ticker(manager.clone(), shutdown);
    log::info!("Activity dump manager started");

    wait_for_termination(tx_shutdown).await?;

    log::info!("Terminating activity dump manager...");
    manager_handle.await?;
    stats_handle.await?;
    Ok(())
}

/// Generates a profile from a persisted dump without a running daemon.
pub fn generate_profile(activity_dump_file: &Path, output_dir: &Path) -> Result<()> {
    let path = profile::generate_profile(activity_dump_file, output_dir).with_context(|| {
        format!("Error generating profile from {}", activity_dump_file.display())
    })?;
    println!("{}", path.display());
    Ok(())
}

fn start_stats_ticker(
    manager: Arc<ActivityDumpManager>,
    mut shutdown: ShutdownSignal,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(STATS_PERIOD);
        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                _ = ticker.tick() => {
                    if let Err(err) = manager.send_stats() {
                        log::warn!("{:#}", anyhow::Error::from(err));
                    }
                }
            }
        }
    })
}

async fn wait_for_termination(tx_shutdown: ShutdownSender) -> Result<()> {
    let mut sig_int = signal(SignalKind::interrupt())?;
    let mut sig_term = signal(SignalKind::terminate())?;

    tokio::select! {
        _ = sig_int.recv() => log::trace!("SIGINT received"),
        _ = sig_term.recv() => log::trace!("SIGTERM received"),
    }
    tx_shutdown.send_signal();
    Ok(())
}
