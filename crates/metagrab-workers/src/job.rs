use chrono::{DateTime, Utc};
use dashmap::DashMap;
use metagrab_types::{Mode, ScrapeOutcome};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use uuid::Uuid;

/// Job lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
}

/// One chunk of URLs queued for a mode.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub urls: Vec<String>,
    pub mode: Mode,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    pub results: HashMap<String, ScrapeOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<String>,
}

impl Job {
    pub fn new(urls: Vec<String>, mode: Mode) -> Self {
        Self {
            id: Uuid::new_v4(),
            urls,
            mode,
            status: JobStatus::Queued,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            results: HashMap::new(),
            error: None,
            worker_id: None,
        }
    }

    pub fn start(&mut self, worker_id: String) {
        self.status = JobStatus::Running;
        self.started_at = Some(Utc::now());
        self.worker_id = Some(worker_id);
    }

    pub fn complete(&mut self) {
        self.status = JobStatus::Completed;
        self.completed_at = Some(Utc::now());
    }

    /// Only infrastructure failures fail a job; per-URL failures land in
    /// the results map as failure outcomes instead.
    pub fn fail(&mut self, error: String) {
        self.status = JobStatus::Failed;
        self.completed_at = Some(Utc::now());
        self.error = Some(error);
    }

    pub fn is_settled(&self) -> bool {
        matches!(self.status, JobStatus::Completed | JobStatus::Failed)
    }
}

/// Bounded in-memory registry of jobs for status queries.
///
/// Oldest jobs are evicted once the capacity is exceeded; callers polling a
/// very old id simply get a not-found.
pub struct JobRegistry {
    jobs: DashMap<Uuid, Job>,
    order: Mutex<VecDeque<Uuid>>,
    capacity: usize,
}

impl JobRegistry {
    pub fn new(capacity: usize) -> Self {
        Self {
            jobs: DashMap::new(),
            order: Mutex::new(VecDeque::new()),
            capacity: capacity.max(1),
        }
    }

    pub fn insert(&self, job: Job) {
        let id = job.id;
        self.jobs.insert(id, job);

        let evict = {
            let mut order = self.order.lock();
            order.push_back(id);
            if order.len() > self.capacity {
                order.pop_front()
            } else {
                None
            }
        };
        if let Some(old) = evict {
            self.jobs.remove(&old);
        }
    }

    pub fn get(&self, id: &Uuid) -> Option<Job> {
        self.jobs.get(id).map(|j| j.clone())
    }

    /// Mutate a job in place; returns false when the job was evicted.
    pub fn with_job_mut(&self, id: &Uuid, f: impl FnOnce(&mut Job)) -> bool {
        match self.jobs.get_mut(id) {
            Some(mut job) => {
                f(&mut job);
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_transitions() {
        let mut job = Job::new(vec!["https://site/a".into()], Mode::Simple);
        assert_eq!(job.status, JobStatus::Queued);

        job.start("worker-0".into());
        assert_eq!(job.status, JobStatus::Running);
        assert!(job.started_at.is_some());

        job.complete();
        assert_eq!(job.status, JobStatus::Completed);
        assert!(job.is_settled());
    }

    #[test]
    fn registry_roundtrip_and_mutation() {
        let registry = JobRegistry::new(10);
        let job = Job::new(vec!["https://site/a".into()], Mode::Full);
        let id = job.id;
        registry.insert(job);

        assert!(registry.with_job_mut(&id, |j| j.start("worker-1".into())));
        let fetched = registry.get(&id).unwrap();
        assert_eq!(fetched.status, JobStatus::Running);
        assert_eq!(fetched.worker_id.as_deref(), Some("worker-1"));
    }

    #[test]
    fn registry_evicts_oldest_past_capacity() {
        let registry = JobRegistry::new(2);
        let first = Job::new(vec!["https://site/1".into()], Mode::Simple);
        let first_id = first.id;
        registry.insert(first);
        registry.insert(Job::new(vec!["https://site/2".into()], Mode::Simple));
        registry.insert(Job::new(vec!["https://site/3".into()], Mode::Simple));

        assert_eq!(registry.len(), 2);
        assert!(registry.get(&first_id).is_none());
        assert!(!registry.with_job_mut(&first_id, |_| {}));
    }
}
