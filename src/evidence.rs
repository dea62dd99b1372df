//! Asynchronous evidence persistence.
//!
//! `EvidenceWriter` owns one worker thread and a bounded queue. Producers call
//! [`EvidenceWriter::write`] (or a cloned [`EvidenceQueue`]) and return immediately;
//! the worker persists events one at a time in arrival order. Persistence errors
//! are logged and dropped. [`EvidenceWriter::shutdown`] closes the queue and waits
//! for everything already enqueued to be written.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use anyhow::{anyhow, Context, Result};
use chrono::NaiveDateTime;

use crate::catalog::{is_absent_class, EquipmentCatalog};
use crate::store::EvidenceStore;

/// Default queue depth; alerts are rate limited so this is rarely reached.
pub const DEFAULT_QUEUE_DEPTH: usize = 32;

/// One throttle-approved violation, ready to persist. Immutable once built.
#[derive(Clone, Debug, PartialEq)]
pub struct AlertEvent {
    timestamp: NaiveDateTime,
    missing_equipment: BTreeSet<String>,
    class_ids: Vec<u32>,
    frame_jpeg: Vec<u8>,
}

impl AlertEvent {
    /// Build an event. Fails when no missing equipment is given.
    pub fn new(
        timestamp: NaiveDateTime,
        missing: impl IntoIterator<Item = String>,
        class_ids: Vec<u32>,
        frame_jpeg: Vec<u8>,
    ) -> Result<Self> {
        let missing_equipment: BTreeSet<String> = missing.into_iter().collect();
        if missing_equipment.is_empty() {
            return Err(anyhow!("alert event needs at least one missing item"));
        }
        Ok(Self {
            timestamp,
            missing_equipment,
            class_ids,
            frame_jpeg,
        })
    }

    pub fn timestamp(&self) -> &NaiveDateTime {
        &self.timestamp
    }

    pub fn missing_equipment(&self) -> &BTreeSet<String> {
        &self.missing_equipment
    }

    pub fn class_ids(&self) -> &[u32] {
        &self.class_ids
    }

    pub fn frame_jpeg(&self) -> &[u8] {
        &self.frame_jpeg
    }
}

/// Counters shared between the writer handle and its worker.
#[derive(Debug, Default)]
pub struct EvidenceStats {
    pub enqueued: AtomicU64,
    pub dropped: AtomicU64,
    pub rows_written: AtomicU64,
    pub failures: AtomicU64,
}

/// Cloneable producer side of the evidence queue.
#[derive(Clone)]
pub struct EvidenceQueue {
    tx: SyncSender<AlertEvent>,
    stats: Arc<EvidenceStats>,
}

impl EvidenceQueue {
    /// Enqueue without blocking. A full or closed queue drops the event.
    pub fn write(&self, event: AlertEvent) {
        match self.tx.try_send(event) {
            Ok(()) => {
                self.stats.enqueued.fetch_add(1, Ordering::Relaxed);
            }
            Err(TrySendError::Full(_)) => {
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                log::warn!("evidence: queue full, alert dropped");
            }
            Err(TrySendError::Disconnected(_)) => {
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                log::warn!("evidence: writer stopped, alert dropped");
            }
        }
    }
}

pub struct EvidenceWriter {
    queue: Option<EvidenceQueue>,
    stats: Arc<EvidenceStats>,
    worker: Option<JoinHandle<()>>,
}

impl EvidenceWriter {
    /// Spawn the worker. `store` is moved onto the worker thread and used only there.
    pub fn spawn<S>(store: S, catalog: Arc<EquipmentCatalog>, depth: usize) -> Result<Self>
    where
        S: EvidenceStore + 'static,
    {
        let (tx, rx) = mpsc::sync_channel(depth.max(1));
        let stats = Arc::new(EvidenceStats::default());
        let worker_stats = Arc::clone(&stats);
        let worker = thread::Builder::new()
            .name("evidence-writer".to_string())
            .spawn(move || run_worker(store, catalog, rx, worker_stats))
            .context("spawn evidence writer thread")?;
        log::info!("evidence: writer started (queue depth {})", depth.max(1));
        Ok(Self {
            queue: Some(EvidenceQueue {
                tx,
                stats: Arc::clone(&stats),
            }),
            stats,
            worker: Some(worker),
        })
    }

    /// Fire-and-forget persistence of `event`.
    pub fn write(&self, event: AlertEvent) {
        match &self.queue {
            Some(queue) => queue.write(event),
            None => {
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                log::warn!("evidence: writer shut down, alert dropped");
            }
        }
    }

    /// A producer handle for other threads. `None` after shutdown.
    pub fn queue(&self) -> Option<EvidenceQueue> {
        self.queue.clone()
    }

    pub fn stats(&self) -> &EvidenceStats {
        &self.stats
    }

    /// Stop accepting events and wait for the queue to drain.
    ///
    /// Producer handles handed out by [`queue`](Self::queue) keep the worker alive
    /// until they are dropped as well.
    pub fn shutdown(&mut self) {
        self.queue = None;
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                log::error!("evidence: writer thread panicked");
            }
            log::info!(
                "evidence: writer drained ({} rows written, {} failures, {} dropped)",
                self.stats.rows_written.load(Ordering::Relaxed),
                self.stats.failures.load(Ordering::Relaxed),
                self.stats.dropped.load(Ordering::Relaxed)
            );
        }
    }
}

impl Drop for EvidenceWriter {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_worker<S: EvidenceStore>(
    mut store: S,
    catalog: Arc<EquipmentCatalog>,
    rx: Receiver<AlertEvent>,
    stats: Arc<EvidenceStats>,
) {
    for event in rx {
        match persist_event(&mut store, &catalog, &event) {
            Ok(rows) => {
                stats.rows_written.fetch_add(rows, Ordering::Relaxed);
                log::info!(
                    "evidence: stored {} row(s) for {:?}",
                    rows,
                    event.missing_equipment()
                );
            }
            Err(err) => {
                stats.failures.fetch_add(1, Ordering::Relaxed);
                log::error!("evidence: failed to persist alert: {:#}", err);
            }
        }
    }
}

/// Write one row per absent-class occurrence in `event.class_ids`, all sharing the
/// event's timestamp and encoded frame. Returns the number of rows written.
pub fn persist_event(
    store: &mut dyn EvidenceStore,
    catalog: &EquipmentCatalog,
    event: &AlertEvent,
) -> Result<u64> {
    let names: Vec<String> = event
        .class_ids()
        .iter()
        .filter(|id| is_absent_class(**id))
        .map(|&class_id| catalog.label(class_id))
        .collect();
    let ids = store.insert_alert_rows(event.timestamp(), event.frame_jpeg(), &names)?;
    Ok(ids.len() as u64)
}
