//! Single consumer of the work queue and sole mutator of the cache.

use std::sync::Arc;
use std::time::Duration;

use kinformer_core::{ChangeRecord, Notification, SyncBatch};
use kinformer_store::{Indexer, Removal, Upsert};
use metrics::counter;
use tokio::sync::mpsc;
use tokio::time::{Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::reflector::QueueItem;
use crate::{HandlerRegistry, InformerError, SyncBarrier};

pub(crate) struct ProcessingLoop {
    indexer: Indexer,
    handlers: HandlerRegistry,
    barrier: SyncBarrier,
    rx: mpsc::Receiver<QueueItem>,
    resync_period: Option<Duration>,
}

impl ProcessingLoop {
    pub(crate) fn new(
        indexer: Indexer,
        handlers: HandlerRegistry,
        barrier: SyncBarrier,
        rx: mpsc::Receiver<QueueItem>,
        resync_period: Option<Duration>,
    ) -> Self {
        Self { indexer, handlers, barrier, rx, resync_period }
    }

    /// Drain records until cancelled or the reflector reports a fatal error.
    /// A record that has been dequeued is always applied and delivered in full.
    pub(crate) async fn run(mut self, cancel: CancellationToken) -> Result<(), InformerError> {
        let mut resync = self.resync_period.map(|p| {
            let mut iv = tokio::time::interval_at(tokio::time::Instant::now() + p, p);
            iv.set_missed_tick_behavior(MissedTickBehavior::Delay);
            iv
        });
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!("processing loop cancelled");
                    return Ok(());
                }
                item = self.rx.recv() => match item {
                    Some(QueueItem::Record(record)) => self.process(record),
                    Some(QueueItem::Fatal(e)) => return Err(e),
                    None if cancel.is_cancelled() => return Ok(()),
                    None => return Err(InformerError::ReflectorGone),
                },
                _ = next_tick(&mut resync) => self.resync(),
            }
        }
    }

    fn process(&mut self, record: ChangeRecord) {
        counter!("kinformer_records_total", 1u64, "kind" => record.kind_str());
        match record {
            ChangeRecord::Added(o) | ChangeRecord::Updated(o) => {
                let res = self.indexer.upsert(o);
                self.deliver_upsert(res);
            }
            ChangeRecord::Deleted { key, last } => {
                let version = last.as_ref().map(|o| o.version.clone());
                match self.indexer.delete(&key, version.as_ref()) {
                    Removal::Removed(cached) => {
                        let last = last.map(Arc::new).unwrap_or(cached);
                        self.deliver(Notification::Deleted { key, last: Some(last) });
                    }
                    Removal::Missing | Removal::Stale { .. } => {
                        counter!("kinformer_records_skipped_total", 1u64);
                    }
                }
            }
            ChangeRecord::Synced(batch) => self.apply_batch(batch),
        }
    }

    fn apply_batch(&mut self, batch: SyncBatch) {
        let SyncBatch { objects, cursor } = batch;
        let listed = objects.len();
        let out = self.indexer.replace(objects);
        let removed = out.removed.len();
        for res in out.upserts {
            self.deliver_upsert(res);
        }
        for old in out.removed {
            self.deliver(Notification::Deleted { key: old.key.clone(), last: Some(old) });
        }
        // every member is applied and delivered before readiness is signalled
        self.barrier.mark_synced();
        info!(listed, removed, cursor = %cursor, generation = self.barrier.generation(), "sync batch applied");
    }

    fn deliver_upsert(&self, res: Upsert) {
        match res {
            Upsert::Inserted(new) => self.deliver(Notification::Added { new }),
            Upsert::Replaced { old, new } => self.deliver(Notification::Updated { old, new }),
            Upsert::Recreated { old, new } => {
                self.deliver(Notification::Deleted { key: old.key.clone(), last: Some(old) });
                self.deliver(Notification::Added { new });
            }
            Upsert::Unchanged(_) => {}
            Upsert::Stale { .. } => {
                counter!("kinformer_records_skipped_total", 1u64);
            }
        }
    }

    fn deliver(&self, event: Notification) {
        self.handlers.dispatch(&event);
    }

    /// Re-deliver every cached object as an update to itself.
    fn resync(&self) {
        if !self.barrier.is_synced() {
            return;
        }
        let snap = self.indexer.handle().snapshot();
        debug!(objects = snap.items.len(), "periodic resync");
        for obj in snap.items.iter() {
            self.deliver(Notification::Updated { old: Arc::clone(obj), new: Arc::clone(obj) });
        }
        counter!("kinformer_resyncs_total", 1u64);
    }
}

async fn next_tick(iv: &mut Option<Interval>) {
    match iv {
        Some(iv) => {
            iv.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}
