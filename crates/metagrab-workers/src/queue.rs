use metagrab_metrics::EngineMetrics;
use metagrab_types::Mode;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{Mutex, Notify};
use tracing::debug;
use uuid::Uuid;

use crate::scaler::WorkerScaler;

/// A chunk waiting for a worker, tagged with its enqueue time so the wait
/// can be observed on dequeue.
#[derive(Debug)]
pub struct QueuedJob {
    pub job_id: Uuid,
    pub urls: Vec<String>,
    pub mode: Mode,
    pub enqueued_at: Instant,
}

/// Mode-partitioned job queue.
///
/// Each mode has an independent queue and queue-length signal. Workers pull
/// round-robin across non-empty queues, with a rotating start index so no
/// mode can starve the others. Every push/pop feeds the scaler and the
/// queue gauges; every pop observes the job's queue wait.
pub struct JobQueue {
    queues: Mutex<HashMap<Mode, VecDeque<QueuedJob>>>,
    pushed: Notify,
    rr_cursor: AtomicUsize,
    scaler: Arc<WorkerScaler>,
    metrics: Option<Arc<EngineMetrics>>,
}

impl JobQueue {
    pub fn new(scaler: Arc<WorkerScaler>, metrics: Option<Arc<EngineMetrics>>) -> Self {
        let mut queues = HashMap::new();
        for mode in Mode::ALL {
            queues.insert(mode, VecDeque::new());
        }
        Self {
            queues: Mutex::new(queues),
            pushed: Notify::new(),
            rr_cursor: AtomicUsize::new(0),
            scaler,
            metrics,
        }
    }

    pub async fn push(&self, job_id: Uuid, urls: Vec<String>, mode: Mode) {
        let len = {
            let mut queues = self.queues.lock().await;
            let queue = queues.entry(mode).or_default();
            queue.push_back(QueuedJob {
                job_id,
                urls,
                mode,
                enqueued_at: Instant::now(),
            });
            queue.len()
        };

        self.scaler.update_queue_length(len, mode);
        if let Some(m) = &self.metrics {
            m.queue_size.with_label_values(&[mode.as_str()]).set(len as f64);
        }
        debug!(job_id = %job_id, mode = %mode, queue_len = len, "Job enqueued");
        self.pushed.notify_one();
    }

    /// Pull the next job from any non-empty mode queue; suspends until one
    /// is available.
    pub async fn pop_any(&self) -> QueuedJob {
        loop {
            let popped = {
                let mut queues = self.queues.lock().await;
                let start = self.rr_cursor.fetch_add(1, Ordering::Relaxed);
                let mut found = None;
                for offset in 0..Mode::ALL.len() {
                    let mode = Mode::ALL[(start + offset) % Mode::ALL.len()];
                    if let Some(job) = queues.get_mut(&mode).and_then(|q| q.pop_front()) {
                        let remaining = queues.get(&mode).map(|q| q.len()).unwrap_or(0);
                        found = Some((job, remaining));
                        break;
                    }
                }
                found
            };

            if let Some((job, remaining)) = popped {
                let waited = job.enqueued_at.elapsed().as_secs_f64();
                self.scaler.add_queue_wait_time(waited, job.mode);
                self.scaler.update_queue_length(remaining, job.mode);
                if let Some(m) = &self.metrics {
                    m.queue_wait_duration
                        .with_label_values(&[job.mode.as_str()])
                        .observe(waited);
                    m.queue_size
                        .with_label_values(&[job.mode.as_str()])
                        .set(remaining as f64);
                }
                return job;
            }

            self.pushed.notified().await;
        }
    }

    pub async fn lengths(&self) -> HashMap<Mode, usize> {
        let queues = self.queues.lock().await;
        Mode::ALL
            .iter()
            .map(|m| (*m, queues.get(m).map(|q| q.len()).unwrap_or(0)))
            .collect()
    }

    pub async fn total_len(&self) -> usize {
        self.lengths().await.values().sum()
    }
}
