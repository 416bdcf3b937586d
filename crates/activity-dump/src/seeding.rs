//! Seeding of the processes already running when a dump starts.
//!
//! Such processes never produce a discovery event, so they are added to the
//! dump tree along with their whole ancestry, root first: a node inserted
//! before its parent would be left without a place in the tree.

use std::collections::HashSet;

use dump_core::process_cache::{AncestryResolver, ProcessEntry};

use crate::dump::ActivityDump;

/// Ancestry of `entry` ordered from the root down to `entry` itself.
pub fn lineage(resolver: &dyn AncestryResolver, entry: &ProcessEntry) -> Vec<ProcessEntry> {
    let mut seen = HashSet::from([entry.pid]);
    let mut ancestors = vec![entry.clone()];
    let mut current = entry.clone();
    while let Some(parent) = resolver.next_ancestor(&current) {
        if !seen.insert(parent.pid) {
            log::warn!("loop in the ancestry of {}: {} seen twice", entry.pid, parent.pid);
            break;
        }
        ancestors.push(parent.clone());
        current = parent;
    }
    ancestors.reverse();
    ancestors
}

/// Adds to `dump` every running process it selects. Returns the number of
/// nodes created.
pub fn seed_traced_processes(dump: &ActivityDump, resolver: &dyn AncestryResolver) -> usize {
    let mut matched = Vec::new();
    resolver.walk(&mut |entry| {
        if dump.matches(entry) {
            matched.push(entry.clone());
        }
    });

    let seeded = matched
        .iter()
        .map(|entry| dump.seed_lineage(&lineage(resolver, entry)))
        .sum();
    if seeded > 0 {
        log::debug!("[{}] seeded with {seeded} running processes", dump.selector());
    }
    seeded
}
