use std::fmt;

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::{Pid, process_cache::ProcessEntry, time::Timestamp};

/// Kind of event, as known by the kernel filter on traced event types.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Display,
    EnumString,
    Serialize,
    Deserialize,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
#[repr(u32)]
pub enum EventType {
    Fork = 1,
    Exec = 2,
    Exit = 3,
    Open = 4,
    Dns = 5,
    Bind = 6,
}

impl EventType {
    pub const ALL: [EventType; 6] = [
        EventType::Fork,
        EventType::Exec,
        EventType::Exit,
        EventType::Open,
        EventType::Dns,
        EventType::Bind,
    ];

    /// Key used inside the kernel tables.
    pub const fn as_raw(self) -> u32 {
        self as u32
    }

    /// Position inside [`EventType::ALL`].
    pub const fn index(self) -> usize {
        self as usize - 1
    }
}

/// An event already decoded and enriched with its process context.
#[derive(Debug, Clone)]
pub struct Event {
    pub header: Header,
    pub payload: Payload,
}

impl Event {
    pub fn new(timestamp: Timestamp, process: ProcessEntry, payload: Payload) -> Self {
        Self {
            header: Header { timestamp, process },
            payload,
        }
    }

    pub fn event_type(&self) -> EventType {
        self.payload.event_type()
    }

    /// Process context, with the new image applied for exec events.
    pub fn process(&self) -> ProcessEntry {
        let mut process = self.header.process.clone();
        if let Payload::Exec { filename, argv } = &self.payload {
            process.filename = filename.clone();
            process.argv = argv.clone();
        }
        process
    }
}

#[derive(Debug, Clone)]
pub struct Header {
    pub timestamp: Timestamp,
    pub process: ProcessEntry,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Fork { ppid: Pid },
    Exec { filename: String, argv: Vec<String> },
    Exit { exit_code: u32 },
    FileOpened { filename: String, flags: u32 },
    DnsQuery { name: String },
    Bind { address: String },
}

impl Payload {
    pub fn event_type(&self) -> EventType {
        match self {
            Payload::Fork { .. } => EventType::Fork,
            Payload::Exec { .. } => EventType::Exec,
            Payload::Exit { .. } => EventType::Exit,
            Payload::FileOpened { .. } => EventType::Open,
            Payload::DnsQuery { .. } => EventType::Dns,
            Payload::Bind { .. } => EventType::Bind,
        }
    }
}

impl fmt::Display for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Payload::Fork { ppid } => write!(f, "Fork {{ ppid: {ppid} }}"),
            Payload::Exec { filename, argv } => {
                write!(f, "Exec {{ filename: {filename}, argv: [{}] }}", argv.join(" "))
            }
            Payload::Exit { exit_code } => write!(f, "Exit {{ exit_code: {exit_code} }}"),
            Payload::FileOpened { filename, flags } => {
                write!(f, "File Opened {{ filename: {filename}, flags: {flags:#o} }}")
            }
            Payload::DnsQuery { name } => write!(f, "Dns Query {{ name: {name} }}"),
            Payload::Bind { address } => write!(f, "Bind {{ address: {address} }}"),
        }
    }
}

/// Emitted by the kernel when a new cgroup starts being traced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CgroupTracingEvent {
    pub container_id: String,
    /// Monotonic instant at which the kernel stops tracing this cgroup.
    pub expiry_raw: Timestamp,
}
