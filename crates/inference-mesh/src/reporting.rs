//! Bounded reporting pipelines for usage and metrics records.
//!
//! Producers never wait: when the buffer is full the oldest record is
//! dropped. A drain task forwards records to the downstream queue.

use crate::collaborators::RecordQueue;
use crate::error::{MeshError, MeshResult};
use crate::metrics::MeshMetrics;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

pub struct ReportingPipeline<T> {
    name: &'static str,
    buffer: Mutex<VecDeque<T>>,
    capacity: usize,
    notify: Notify,
    dropped: AtomicU64,
    metrics: Arc<MeshMetrics>,
}

impl<T: Send + 'static> ReportingPipeline<T> {
    pub fn new(name: &'static str, capacity: usize, metrics: Arc<MeshMetrics>) -> Self {
        Self {
            name,
            buffer: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity: capacity.max(1),
            notify: Notify::new(),
            dropped: AtomicU64::new(0),
            metrics,
        }
    }

    /// Queue a record. The record is always accepted; `QueueOverflow` reports
    /// that the oldest buffered record was dropped to make room.
    pub fn submit(&self, record: T) -> MeshResult<()> {
        let overflowed = {
            let mut buffer = self.buffer.lock().unwrap_or_else(PoisonError::into_inner);
            let overflowed = if buffer.len() >= self.capacity {
                buffer.pop_front();
                true
            } else {
                false
            };
            buffer.push_back(record);
            overflowed
        };
        self.notify.notify_one();

        if overflowed {
            let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            self.metrics
                .dropped_records
                .with_label_values(&[self.name])
                .inc();
            warn!(pipeline = self.name, dropped_total = total, "reporting buffer full, dropped oldest record");
            return Err(MeshError::QueueOverflow(format!(
                "{} pipeline dropped its oldest record",
                self.name
            )));
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.buffer.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Records dropped since creation
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn take_all(&self) -> Vec<T> {
        self.buffer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect()
    }

    async fn forward(&self, sink: &dyn RecordQueue<T>) {
        for record in self.take_all() {
            if let Err(e) = sink.enqueue(record).await {
                warn!(pipeline = self.name, error = %e, "downstream queue rejected record");
            }
        }
    }

    /// Forward records to `sink` until `shutdown` flips, then flush what is left.
    pub fn spawn_drain(
        self: &Arc<Self>,
        sink: Arc<dyn RecordQueue<T>>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let pipeline = self.clone();
        tokio::spawn(async move {
            loop {
                pipeline.forward(sink.as_ref()).await;
                if *shutdown.borrow() {
                    break;
                }
                tokio::select! {
                    _ = pipeline.notify.notified() => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            pipeline.forward(sink.as_ref()).await;
            debug!(pipeline = pipeline.name, "reporting drain stopped");
        })
    }
}
