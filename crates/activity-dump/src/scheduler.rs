//! Snapshot scheduler: a bounded queue decoupling dump insertion from the
//! expensive backfill of the processes a new dump selects.
//!
//! The producer never waits. When the queue is full the request is dropped
//! and the dump runs without its initial backfill.

use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use tokio::sync::mpsc::{self, error::TrySendError};

use crate::dump::ActivityDump;

#[derive(Debug, Default)]
struct Counters {
    enqueued: AtomicU64,
    dropped: AtomicU64,
    executed: AtomicU64,
    failed: AtomicU64,
}

/// Snapshot requests accounting.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerStats {
    pub enqueued: u64,
    pub dropped: u64,
    pub executed: u64,
    pub failed: u64,
}

pub fn snapshot_queue(capacity: usize) -> (SnapshotScheduler, SnapshotConsumer) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let counters = Arc::new(Counters::default());
    (
        SnapshotScheduler {
            tx,
            counters: counters.clone(),
        },
        SnapshotConsumer { rx, counters },
    )
}

pub struct SnapshotScheduler {
    tx: mpsc::Sender<Arc<ActivityDump>>,
    counters: Arc<Counters>,
}

impl SnapshotScheduler {
    /// Queues a snapshot of `dump` without waiting. Returns false when the
    /// request was dropped.
    pub fn schedule(&self, dump: Arc<ActivityDump>) -> bool {
        match self.tx.try_send(dump) {
            Ok(()) => {
                self.counters.enqueued.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(TrySendError::Full(dump)) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                log::warn!("snapshot queue full, [{}] won't be snapshotted", dump.selector());
                false
            }
            Err(TrySendError::Closed(dump)) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                log::warn!("snapshot queue closed, [{}] won't be snapshotted", dump.selector());
                false
            }
        }
    }

    pub fn stats(&self) -> SchedulerStats {
        SchedulerStats {
            enqueued: self.counters.enqueued.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
            executed: self.counters.executed.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
        }
    }
}

/// The single consumer of the snapshot queue.
pub struct SnapshotConsumer {
    rx: mpsc::Receiver<Arc<ActivityDump>>,
    counters: Arc<Counters>,
}

impl SnapshotConsumer {
    pub async fn recv(&mut self) -> Option<Arc<ActivityDump>> {
        self.rx.recv().await
    }

    /// Runs the snapshot of `dump` on the blocking thread pool.
    pub async fn execute(&self, dump: Arc<ActivityDump>) {
        let selector = dump.selector().clone();
        let result = tokio::task::spawn_blocking(move || dump.snapshot()).await;
        match result {
            Ok(Ok(count)) => {
                self.counters.executed.fetch_add(1, Ordering::Relaxed);
                log::debug!("[{selector}] snapshotted {count} processes");
            }
            Ok(Err(err)) => {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                log::error!("couldn't snapshot [{selector}]: {err}");
            }
            Err(err) => {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                log::error!("snapshot task of [{selector}] failed: {err}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use bpf_filters::memory::MemoryTable;
    use dump_core::{event::EventType, time::TimeResolver};

    use super::*;
    use crate::{
        dump::DumpContext,
        stats::LogSink,
        tags::HostTagsResolver,
    };

    fn dump(comm: &str) -> Arc<ActivityDump> {
        let ctx = Arc::new(DumpContext {
            time: TimeResolver::default(),
            traced_pids: Arc::new(MemoryTable::<u32, u64>::new("traced_pids")),
            traced_event_types: EventType::ALL.to_vec(),
            tags_resolver: Arc::new(HostTagsResolver::new()),
            stats: Arc::new(LogSink),
            output_dir: None,
        });
        ActivityDump::new(ctx, |spec| {
            spec.comm = Some(comm.to_string());
            spec.timeout = Duration::from_secs(60);
        })
        .unwrap()
    }

    #[tokio::test]
    async fn full_queue_drops_requests() {
        let (scheduler, mut consumer) = snapshot_queue(2);
        assert!(scheduler.schedule(dump("a")));
        assert!(scheduler.schedule(dump("b")));
        assert!(!scheduler.schedule(dump("c")));

        while scheduler.stats().executed < 2 {
            let dump = consumer.recv().await.unwrap();
            consumer.execute(dump).await;
        }
        assert_eq!(
            scheduler.stats(),
            SchedulerStats {
                enqueued: 2,
                dropped: 1,
                executed: 2,
                failed: 0,
            }
        );
    }
}
