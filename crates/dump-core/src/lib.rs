//! Shared building blocks of the activity dump agent.
//!
//! - [`event`]: typed events delivered by the kernel instrumentation layer
//! - [`time`]: kernel-monotonic timestamps and their conversion to wall-clock time
//! - [`process_cache`]: the process cache used to walk a process ancestry
//! - [`config`]: string-keyed configuration sections with typed accessors
//! - [`procfs`]: helpers to read process information from `/proc`

pub mod config;
pub mod event;
pub mod process_cache;
pub mod procfs;
pub mod shutdown;
pub mod time;

pub use nix::unistd::Pid;

/// Utility function to pretty print an error with its sources.
///
/// Rust doesn't print the source of an error by default, so we use
/// anyhow as an error pretty-printer.
pub fn log_error<E: std::error::Error + Send + Sync + 'static>(msg: &str, err: E) {
    log::error!("{}: {:?}", msg, anyhow::Error::from(err));
}
