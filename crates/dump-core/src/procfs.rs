//! Utility functions used to extract data from procfs

use std::{
    fs::{self, File},
    io::{self, BufReader, prelude::*},
    path::PathBuf,
};

use glob::glob;
use lazy_static::lazy_static;
use regex::Regex;
use thiserror::Error;

use crate::Pid;

lazy_static! {
    /// Pattern for matching cgroups created by Docker.
    static ref RE_CGROUP_DOCKER: Regex = Regex::new(r"docker.(?P<id>[0-9a-f]{64})").unwrap();
    /// Pattern for matching cgroups created by libpod/podman.
    static ref RE_CGROUP_LIBPOD: Regex = Regex::new(r"libpod(?:-conmon)?-(?P<id>[0-9a-f]{64})").unwrap();
    /// Pattern for matching cgroups created by containerd CRI.
    static ref RE_CGROUP_CRI: Regex = Regex::new(r"cri-containerd-(?P<id>[0-9a-f]{64})").unwrap();
}

#[derive(Error, Debug)]
pub enum ProcfsError {
    #[error("reading {path} failed")]
    ReadFile {
        #[source]
        source: io::Error,
        path: String,
    },
    #[error("parent for process {0} not found")]
    ParentNotFound(Pid),
    #[error("globbing running processes")]
    GlobbingError(#[from] glob::PatternError),
    #[error("unreadable entry")]
    GlobError(#[from] glob::GlobError),
    #[error(transparent)]
    ParseIntError(#[from] std::num::ParseIntError),
}

/// Returns the path of the executable image of a given process.
pub fn get_process_image(pid: Pid) -> Result<PathBuf, ProcfsError> {
    read_link(&format!("/proc/{pid}/exe"))
}

/// Return where a link is pointing to.
fn read_link(path: &str) -> Result<PathBuf, ProcfsError> {
    fs::read_link(path).map_err(|source| ProcfsError::ReadFile {
        source,
        path: path.to_string(),
    })
}

/// Returns the command line for the given process.
pub fn get_process_command_line(pid: Pid) -> Result<Vec<String>, ProcfsError> {
    let path = format!("/proc/{pid}/cmdline");
    let data =
        fs::read_to_string(&path).map_err(|source| ProcfsError::ReadFile { source, path })?;

    Ok(data
        .split('\0')
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect())
}

/// Returns the command name for the given process.
pub fn get_process_comm(pid: Pid) -> Result<String, ProcfsError> {
    let path = format!("/proc/{pid}/comm");
    let data =
        fs::read_to_string(&path).map_err(|source| ProcfsError::ReadFile { source, path })?;
    Ok(data.trim().to_owned())
}

/// Returns the parent of a given process.
pub fn get_process_parent_pid(pid: Pid) -> Result<Pid, ProcfsError> {
    let path = format!("/proc/{pid}/status");
    let file = File::open(&path).map_err(|source| ProcfsError::ReadFile { source, path })?;

    let reader = BufReader::new(file);
    for line in reader.lines().map_while(Result::ok) {
        if let Some(value) = line.strip_prefix("PPid:") {
            return Ok(Pid::from_raw(value.trim().parse()?));
        }
    }

    Err(ProcfsError::ParentNotFound(pid))
}

/// Returns the files currently opened by a given process.
///
/// Only entries pointing to a path are returned: sockets, pipes and
/// anonymous inodes are skipped.
pub fn get_process_open_files(pid: Pid) -> Result<Vec<PathBuf>, ProcfsError> {
    let path = format!("/proc/{pid}/fd");
    let entries = fs::read_dir(&path).map_err(|source| ProcfsError::ReadFile { source, path })?;
    Ok(entries
        .filter_map(Result::ok)
        .filter_map(|entry| fs::read_link(entry.path()).ok())
        .filter(|target| target.is_absolute())
        .collect())
}

pub fn get_running_processes() -> Result<Vec<Pid>, ProcfsError> {
    glob("/proc/[0-9]*")?
        .map(|entry| {
            let entry: String = entry?.to_string_lossy().into();
            let pid = entry.replace("/proc/", "").parse()?;
            Ok(Pid::from_raw(pid))
        })
        .collect()
}

fn get_container_id_from_cgroup(cgroup_info: &str) -> Option<String> {
    [&*RE_CGROUP_DOCKER, &*RE_CGROUP_LIBPOD, &*RE_CGROUP_CRI]
        .iter()
        .find_map(|re| re.captures(cgroup_info))
        .and_then(|caps| caps.name("id"))
        .map(|id| id.as_str().to_string())
}

pub fn get_process_container_id(pid: Pid) -> Result<Option<String>, ProcfsError> {
    if pid.as_raw() == 0 {
        return Ok(None);
    }

    let path = format!("/proc/{pid}/cgroup");
    let file = File::open(&path).map_err(|source| ProcfsError::ReadFile { source, path })?;

    let reader = BufReader::new(file);
    for line in reader.lines().map_while(Result::ok) {
        if let Some(container_id) = get_container_id_from_cgroup(&line) {
            return Ok(Some(container_id));
        }
    }

    Ok(None)
}
