use futures::stream::StreamExt;
use metagrab_metrics::EngineMetrics;
use metagrab_types::{ErrorKind, MetadataProcessor, Mode, ScrapeOutcome};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::job::{Job, JobRegistry};
use crate::queue::JobQueue;
use crate::scaler::{ScalingAction, WorkerScaler};

/// Configuration for the worker pool.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Workers started at boot (clamped into the scaler's bounds).
    pub initial_workers: usize,
    /// Concurrent URLs per worker within one job.
    pub max_concurrent_per_worker: usize,
    /// URLs per job chunk at submission.
    pub chunk_size: usize,
    /// How often the scaling loop consults the scaler.
    pub scaling_interval: Duration,
    /// Capacity of the job registry.
    pub registry_capacity: usize,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            initial_workers: 2,
            max_concurrent_per_worker: 6,
            chunk_size: 25,
            scaling_interval: Duration::from_secs(5),
            registry_capacity: 1000,
        }
    }
}

struct WorkerHandle {
    id: String,
    busy: Arc<AtomicBool>,
    shutdown: watch::Sender<bool>,
    join: JoinHandle<()>,
}

/// Pool of workers over the mode-partitioned queue.
///
/// Each worker owns a loop pulling jobs round-robin across modes and runs
/// a job's URLs concurrently (bounded) through the shared
/// [`MetadataProcessor`]. A background loop applies the scaler's decisions:
/// +1 worker, -1 worker (idle workers preferred), or a memory-triggered
/// restart.
pub struct WorkerPool {
    processor: Arc<dyn MetadataProcessor>,
    queue: Arc<JobQueue>,
    registry: Arc<JobRegistry>,
    scaler: Arc<WorkerScaler>,
    metrics: Option<Arc<EngineMetrics>>,
    config: WorkerPoolConfig,
    workers: Mutex<Vec<WorkerHandle>>,
    next_worker_id: AtomicU64,
    scaling_task: Mutex<Option<JoinHandle<()>>>,
}

impl WorkerPool {
    pub fn new(
        processor: Arc<dyn MetadataProcessor>,
        scaler: Arc<WorkerScaler>,
        metrics: Option<Arc<EngineMetrics>>,
        config: WorkerPoolConfig,
    ) -> Self {
        let queue = Arc::new(JobQueue::new(scaler.clone(), metrics.clone()));
        let registry = Arc::new(JobRegistry::new(config.registry_capacity));
        Self {
            processor,
            queue,
            registry,
            scaler,
            metrics,
            config,
            workers: Mutex::new(Vec::new()),
            next_worker_id: AtomicU64::new(0),
            scaling_task: Mutex::new(None),
        }
    }

    /// Spawn the initial workers and the scaling loop.
    pub async fn start(self: &Arc<Self>) {
        let (min, max) = self.scaler.bounds();
        let initial = self.config.initial_workers.clamp(min, max);
        for _ in 0..initial {
            self.spawn_worker().await;
        }

        let pool = self.clone();
        let interval = self.config.scaling_interval;
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                pool.apply_scaling().await;
            }
        });
        *self.scaling_task.lock().await = Some(task);

        info!(workers = initial, "Worker pool started");
    }

    /// Split the URLs into chunks and enqueue one job per chunk on the
    /// mode's queue. Returns the job ids for status polling.
    pub async fn submit(
        &self,
        urls: Vec<String>,
        mode: Mode,
        chunk_size: Option<usize>,
    ) -> Vec<Uuid> {
        let chunk_size = chunk_size.unwrap_or(self.config.chunk_size).max(1);
        let mut job_ids = Vec::new();

        for chunk in urls.chunks(chunk_size) {
            let job = Job::new(chunk.to_vec(), mode);
            let id = job.id;
            self.registry.insert(job);
            self.queue.push(id, chunk.to_vec(), mode).await;
            job_ids.push(id);
        }

        debug!(jobs = job_ids.len(), mode = %mode, chunk_size, "Submitted jobs");
        job_ids
    }

    pub fn job(&self, id: &Uuid) -> Option<Job> {
        self.registry.get(id)
    }

    pub fn registry(&self) -> Arc<JobRegistry> {
        self.registry.clone()
    }

    pub fn queue(&self) -> Arc<JobQueue> {
        self.queue.clone()
    }

    pub fn scaler(&self) -> Arc<WorkerScaler> {
        self.scaler.clone()
    }

    pub async fn worker_count(&self) -> usize {
        self.workers.lock().await.len()
    }

    /// Manual override from the admin surface.
    pub async fn set_workers(self: &Arc<Self>, target: usize) -> usize {
        let clamped = self.scaler.set_workers_manual(target);
        loop {
            let current = self.worker_count().await;
            if current < clamped {
                self.spawn_worker().await;
            } else if current > clamped {
                if !self.stop_one().await {
                    break;
                }
            } else {
                break;
            }
        }
        clamped
    }

    /// Tear down and replace every worker (memory restart path).
    pub async fn restart_workers(self: &Arc<Self>) -> usize {
        let count = {
            let mut workers = self.workers.lock().await;
            let count = workers.len();
            for handle in workers.drain(..) {
                let _ = handle.shutdown.send(true);
                handle.join.abort();
            }
            count
        };
        warn!(count, "Restarting all workers");
        for _ in 0..count {
            self.spawn_worker().await;
        }
        count
    }

    pub async fn shutdown(&self) {
        if let Some(task) = self.scaling_task.lock().await.take() {
            task.abort();
        }
        let mut workers = self.workers.lock().await;
        for handle in workers.drain(..) {
            let _ = handle.shutdown.send(true);
            handle.join.abort();
        }
        info!("Worker pool stopped");
    }

    async fn apply_scaling(self: &Arc<Self>) {
        match self.scaler.decide() {
            Some(ScalingAction::ScaleUp) => {
                self.spawn_worker().await;
            }
            Some(ScalingAction::ScaleDown) => {
                self.stop_one().await;
            }
            None => {}
        }

        if let Some(high_memory) = self.scaler.check_restart() {
            warn!(workers = ?high_memory, "Memory threshold exceeded, restarting workers");
            self.restart_restartable(&high_memory).await;
        }
    }

    async fn spawn_worker(self: &Arc<Self>) {
        let n = self.next_worker_id.fetch_add(1, Ordering::Relaxed);
        let id = format!("worker-{n}");
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let busy = Arc::new(AtomicBool::new(false));

        let join = tokio::spawn(worker_loop(
            id.clone(),
            self.processor.clone(),
            self.queue.clone(),
            self.registry.clone(),
            shutdown_rx,
            busy.clone(),
            self.config.max_concurrent_per_worker,
        ));

        let mut workers = self.workers.lock().await;
        workers.push(WorkerHandle {
            id,
            busy,
            shutdown: shutdown_tx,
            join,
        });
        self.publish_worker_count(workers.len());
    }

    /// Stop one worker, preferring an idle one; a busy worker finishes its
    /// current job before exiting. Never stops the last worker.
    async fn stop_one(&self) -> bool {
        let mut workers = self.workers.lock().await;
        if workers.len() <= 1 {
            return false;
        }
        let idx = workers
            .iter()
            .rposition(|w| !w.busy.load(Ordering::Relaxed))
            .unwrap_or(workers.len() - 1);
        let handle = workers.remove(idx);
        info!(worker_id = %handle.id, "Stopping worker");
        let _ = handle.shutdown.send(true);
        self.publish_worker_count(workers.len());
        true
    }

    async fn restart_restartable(self: &Arc<Self>, ids: &[String]) {
        let removed = {
            let mut workers = self.workers.lock().await;
            let mut removed = 0;
            let mut i = 0;
            while i < workers.len() {
                if ids.contains(&workers[i].id) {
                    let handle = workers.remove(i);
                    let _ = handle.shutdown.send(true);
                    handle.join.abort();
                    removed += 1;
                } else {
                    i += 1;
                }
            }
            removed
        };
        for _ in 0..removed {
            self.spawn_worker().await;
        }
    }

    fn publish_worker_count(&self, count: usize) {
        self.scaler.set_current_workers(count);
        if let Some(m) = &self.metrics {
            m.worker_count.set(count as f64);
        }
    }
}

/// One worker's processing loop: pull a job, run its URLs concurrently,
/// record every outcome, settle the job.
async fn worker_loop(
    worker_id: String,
    processor: Arc<dyn MetadataProcessor>,
    queue: Arc<JobQueue>,
    registry: Arc<JobRegistry>,
    mut shutdown: watch::Receiver<bool>,
    busy: Arc<AtomicBool>,
    max_concurrent: usize,
) {
    info!(worker_id = %worker_id, "Worker started");

    loop {
        let job = tokio::select! {
            job = queue.pop_any() => job,
            _ = shutdown.changed() => break,
        };

        busy.store(true, Ordering::Relaxed);
        let job_id = job.job_id;
        let mode = job.mode;

        if !registry.with_job_mut(&job_id, |j| j.start(worker_id.clone())) {
            error!(worker_id = %worker_id, job_id = %job_id, "Job vanished from registry before start");
            busy.store(false, Ordering::Relaxed);
            continue;
        }

        debug!(worker_id = %worker_id, job_id = %job_id, urls = job.urls.len(), "Processing job");

        let mut outcomes = futures::stream::iter(job.urls.into_iter().map(|url| {
            let processor = processor.clone();
            async move {
                // A panicking URL must not take the job down with it.
                let task_url = url.clone();
                match tokio::spawn(async move { processor.process(&task_url, mode).await }).await {
                    Ok(outcome) => outcome,
                    Err(e) => ScrapeOutcome::failure(
                        url,
                        mode,
                        ErrorKind::InternalError,
                        format!("scrape task failed: {e}"),
                    ),
                }
            }
        }))
        .buffer_unordered(max_concurrent.max(1));

        while let Some(outcome) = outcomes.next().await {
            registry.with_job_mut(&job_id, |j| {
                j.results.insert(outcome.url.clone(), outcome);
            });
        }
        drop(outcomes);

        registry.with_job_mut(&job_id, |j| j.complete());
        busy.store(false, Ordering::Relaxed);
        debug!(worker_id = %worker_id, job_id = %job_id, "Job completed");

        if *shutdown.borrow() {
            break;
        }
    }

    info!(worker_id = %worker_id, "Worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobStatus;
    use crate::scaler::ScalerConfig;
    use async_trait::async_trait;
    use metagrab_types::PageMetadata;

    struct StubProcessor {
        delay: Duration,
    }

    #[async_trait]
    impl MetadataProcessor for StubProcessor {
        async fn process(&self, url: &str, mode: Mode) -> ScrapeOutcome {
            tokio::time::sleep(self.delay).await;
            ScrapeOutcome::success(url, mode, PageMetadata::default(), 0.01, 0.005, 0.001)
        }
    }

    fn pool(workers: usize) -> Arc<WorkerPool> {
        Arc::new(WorkerPool::new(
            Arc::new(StubProcessor {
                delay: Duration::from_millis(5),
            }),
            Arc::new(WorkerScaler::new(ScalerConfig::default())),
            None,
            WorkerPoolConfig {
                initial_workers: workers,
                scaling_interval: Duration::from_secs(3600),
                ..Default::default()
            },
        ))
    }

    async fn wait_for_settled(pool: &WorkerPool, id: Uuid) -> Job {
        for _ in 0..200 {
            if let Some(job) = pool.job(&id) {
                if job.is_settled() {
                    return job;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("job {id} never settled");
    }

    #[tokio::test]
    async fn submit_chunks_input() {
        let pool = pool(0);
        let urls: Vec<String> = (0..60).map(|i| format!("https://site/{i}")).collect();
        let ids = pool.submit(urls, Mode::Simple, Some(25)).await;
        assert_eq!(ids.len(), 3);
        assert_eq!(pool.queue().total_len().await, 3);
    }

    #[tokio::test]
    async fn worker_completes_job_with_all_urls() {
        let pool = pool(1);
        pool.start().await;

        let urls: Vec<String> = (0..10).map(|i| format!("https://site/{i}")).collect();
        let ids = pool.submit(urls.clone(), Mode::Simple, Some(25)).await;
        assert_eq!(ids.len(), 1);

        let job = wait_for_settled(&pool, ids[0]).await;
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.results.len(), 10);
        for url in urls {
            assert!(job.results[&url].success);
        }
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn multiple_jobs_across_modes_complete() {
        let pool = pool(2);
        pool.start().await;

        let a = pool
            .submit(vec!["https://site/a".into()], Mode::Simple, None)
            .await[0];
        let b = pool
            .submit(vec!["https://site/b".into()], Mode::Full, None)
            .await[0];
        let c = pool
            .submit(vec!["https://site/c".into()], Mode::Super, None)
            .await[0];

        for id in [a, b, c] {
            let job = wait_for_settled(&pool, id).await;
            assert_eq!(job.status, JobStatus::Completed);
        }
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn manual_scaling_changes_worker_count() {
        let pool = pool(2);
        pool.start().await;
        assert_eq!(pool.worker_count().await, 2);

        let set = pool.set_workers(4).await;
        assert_eq!(set, 4);
        assert_eq!(pool.worker_count().await, 4);

        let set = pool.set_workers(1).await;
        assert_eq!(set, 1);
        assert_eq!(pool.worker_count().await, 1);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn restart_workers_preserves_count() {
        let pool = pool(3);
        pool.start().await;
        let restarted = pool.restart_workers().await;
        assert_eq!(restarted, 3);
        assert_eq!(pool.worker_count().await, 3);
        pool.shutdown().await;
    }
}
