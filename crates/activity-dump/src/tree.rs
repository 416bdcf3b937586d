//! Behavioral tree of an activity dump.
//!
//! Process nodes live in an arena and are referenced by index, so nodes are
//! never moved once inserted and the arena order is the insertion order.

use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use dump_core::{Pid, event::Payload, process_cache::ProcessEntry};
use serde::{Deserialize, Serialize};

use crate::dump::Selector;

pub type NodeId = usize;

/// How a node entered the tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeGeneration {
    /// Observed through a live event.
    Runtime,
    /// Already running when the dump started.
    Snapshot,
}

#[derive(Debug, Clone)]
pub struct ProcessNode {
    pub process: ProcessEntry,
    pub generation: NodeGeneration,
    pub parent: Option<NodeId>,
    pub children: Vec<NodeId>,
    /// The process matches the dump selector or descends from one which does.
    pub traced: bool,
    /// Open files were already read from procfs.
    pub snapshotted: bool,
    pub files: BTreeSet<String>,
    pub dns: BTreeSet<String>,
    pub binds: BTreeSet<String>,
}

impl ProcessNode {
    fn same_image(&self, entry: &ProcessEntry, differentiate_args: bool) -> bool {
        self.process.comm == entry.comm
            && self.process.filename == entry.filename
            && (!differentiate_args || self.process.argv == entry.argv)
    }

    pub fn record(&mut self, payload: &Payload) {
        match payload {
            Payload::FileOpened { filename, .. } => {
                self.files.insert(filename.clone());
            }
            Payload::DnsQuery { name } => {
                self.dns.insert(name.clone());
            }
            Payload::Bind { address } => {
                self.binds.insert(address.clone());
            }
            Payload::Fork { .. } | Payload::Exec { .. } | Payload::Exit { .. } => {}
        }
    }
}

#[derive(Debug, Default)]
pub struct ActivityTree {
    nodes: Vec<ProcessNode>,
    roots: Vec<NodeId>,
    /// Node currently describing each pid.
    by_pid: HashMap<i32, NodeId>,
}

impl ActivityTree {
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, id: NodeId) -> &ProcessNode {
        &self.nodes[id]
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut ProcessNode {
        &mut self.nodes[id]
    }

    /// Nodes in insertion order.
    pub fn nodes(&self) -> impl Iterator<Item = (NodeId, &ProcessNode)> {
        self.nodes.iter().enumerate()
    }

    pub fn find(&self, pid: Pid) -> Option<NodeId> {
        self.by_pid.get(&pid.as_raw()).copied()
    }

    pub fn is_traced(&self, pid: Pid) -> bool {
        self.find(pid).is_some_and(|id| self.nodes[id].traced)
    }

    /// Returns the node describing `entry`, creating it when the process, or
    /// its current image, wasn't seen before. The boolean is true when a new
    /// node was created.
    ///
    /// A process whose parent is missing becomes a root: callers insert
    /// ancestors first.
    pub fn find_or_create(
        &mut self,
        entry: &ProcessEntry,
        generation: NodeGeneration,
        differentiate_args: bool,
        traced: bool,
    ) -> (NodeId, bool) {
        let pid = entry.pid.as_raw();
        let parent = match self.by_pid.get(&pid) {
            Some(&id) if self.nodes[id].same_image(entry, differentiate_args) => {
                self.nodes[id].traced |= traced;
                return (id, false);
            }
            // after an exec, the new image is a child of the previous one
            Some(&id) => Some(id),
            None => self.by_pid.get(&entry.ppid.as_raw()).copied(),
        };

        let traced = traced || parent.is_some_and(|id| self.nodes[id].traced);
        let id = self.nodes.len();
        self.nodes.push(ProcessNode {
            process: entry.clone(),
            generation,
            parent,
            children: Vec::new(),
            traced,
            snapshotted: false,
            files: BTreeSet::new(),
            dns: BTreeSet::new(),
            binds: BTreeSet::new(),
        });
        match parent {
            Some(parent) => self.nodes[parent].children.push(id),
            None => self.roots.push(id),
        }
        self.by_pid.insert(pid, id);
        (id, true)
    }

    fn node_document(&self, id: NodeId) -> ProcessNodeDocument {
        let node = &self.nodes[id];
        ProcessNodeDocument {
            pid: node.process.pid.as_raw(),
            ppid: node.process.ppid.as_raw(),
            comm: node.process.comm.clone(),
            filename: node.process.filename.clone(),
            argv: node.process.argv.clone(),
            generation: node.generation,
            files: node.files.iter().cloned().collect(),
            dns: node.dns.iter().cloned().collect(),
            binds: node.binds.iter().cloned().collect(),
            children: node
                .children
                .iter()
                .map(|child| self.node_document(*child))
                .collect(),
        }
    }

    pub fn to_documents(&self) -> Vec<ProcessNodeDocument> {
        self.roots
            .iter()
            .map(|root| self.node_document(*root))
            .collect()
    }
}

/// Serialized form of a dump, as persisted on disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityDumpDocument {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comm: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_id: Option<String>,
    pub start: DateTime<Utc>,
    #[serde(default)]
    pub end: Option<DateTime<Utc>>,
    pub timeout_secs: u64,
    #[serde(default)]
    pub differentiate_args: bool,
    #[serde(default)]
    pub with_graph: bool,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub processes: Vec<ProcessNodeDocument>,
}

impl ActivityDumpDocument {
    pub fn selector(&self) -> Option<Selector> {
        match (self.container_id.as_deref(), self.comm.as_deref()) {
            (Some(id), None) if !id.is_empty() => Some(Selector::ContainerId(id.to_string())),
            (None, Some(comm)) if !comm.is_empty() => Some(Selector::Comm(comm.to_string())),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessNodeDocument {
    pub pid: i32,
    pub ppid: i32,
    pub comm: String,
    #[serde(default)]
    pub filename: String,
    #[serde(default)]
    pub argv: Vec<String>,
    pub generation: NodeGeneration,
    #[serde(default)]
    pub files: Vec<String>,
    #[serde(default)]
    pub dns: Vec<String>,
    #[serde(default)]
    pub binds: Vec<String>,
    #[serde(default)]
    pub children: Vec<ProcessNodeDocument>,
}

impl ProcessNodeDocument {
    /// Visits this node and its descendants, parents first.
    pub fn visit<'a>(&'a self, visit: &mut impl FnMut(&'a ProcessNodeDocument)) {
        visit(self);
        for child in &self.children {
            child.visit(visit);
        }
    }
}
