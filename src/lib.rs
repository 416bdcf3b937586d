//! `profiled` records the activity of containers and commands into activity
//! dumps, and turns finished dumps into security profiles.
//!
//! The daemon opens the filter tables pinned on bpffs by the kernel probes,
//! resumes tracing of the cgroups the kernel already selected and keeps the
//! [`ActivityDumpManager`](activity_dump::ActivityDumpManager) running until
//! it's asked to stop. Example:
//!
//! ```sh
//! # Execute the daemon
//! profiled run --config-file /etc/profiled/profiled.ini
//!
//! # Turn a persisted dump into a profile
//! profiled generate-profile /var/lib/profiled/dumps/activity-dump-comm_curl-1700000000.json
//! ```

pub mod cli;
pub mod daemon;

/// Init logger. We log from info level and above, hide timestamp
/// and module path.
/// If RUST_LOG is set, we assume the user wants to debug something
/// and use env_logger default behaviour.
pub fn init_logger(override_log_level: Option<log::LevelFilter>) {
    if std::env::var_os("RUST_LOG").is_some() {
        env_logger::init();
    } else {
        let level_filter = override_log_level.unwrap_or(log::LevelFilter::Info);

        env_logger::builder().filter_level(level_filter).init();
    }
}
