//! Activity dumps: time-bounded recordings of the behavior of a container
//! or of a command, and the manager coordinating them.
//!
//! The [`ActivityDumpManager`](manager::ActivityDumpManager) keeps the
//! registry of the active dumps, programs the kernel filters through the
//! [`bpf_filters::FilterStore`], routes live events to the dumps and expires
//! them. Finished dumps can be turned into security profiles with
//! [`profile::generate_profile`].

pub mod api;
pub mod config;
pub mod dump;
pub mod graph;
pub mod manager;
pub mod profile;
pub mod scheduler;
pub mod seeding;
pub mod stats;
pub mod tags;
pub mod tree;

pub use dump::{ActivityDump, DumpError, Selector};
pub use manager::{ActivityDumpManager, InsertOutcome, ManagerContext, ManagerError};
