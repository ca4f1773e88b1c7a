//! In-memory job store: concurrent readers, one writer per job.

use std::collections::BTreeMap;
use std::sync::Arc;

use autoloom_core::error::{AutoloomError, Result};
use autoloom_core::types::Job;
use tokio::sync::RwLock;

pub type JobHandle = Arc<RwLock<Job>>;

#[derive(Default)]
pub struct JobStore {
    jobs: RwLock<BTreeMap<String, JobHandle>>,
}

impl JobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a job; ids must be unique.
    pub async fn insert(&self, job: Job) -> Result<JobHandle> {
        let mut jobs = self.jobs.write().await;
        if jobs.contains_key(&job.job_id) {
            return Err(AutoloomError::config(format!(
                "job '{}' already exists",
                job.job_id
            )));
        }
        let id = job.job_id.clone();
        let handle = Arc::new(RwLock::new(job));
        jobs.insert(id, handle.clone());
        Ok(handle)
    }

    pub async fn get(&self, job_id: &str) -> Option<JobHandle> {
        self.jobs.read().await.get(job_id).cloned()
    }

    /// Copy of the job's current state.
    pub async fn snapshot(&self, job_id: &str) -> Option<Job> {
        let handle = self.get(job_id).await?;
        let job = handle.read().await.clone();
        Some(job)
    }

    pub async fn remove(&self, job_id: &str) -> Option<Job> {
        let handle = self.jobs.write().await.remove(job_id)?;
        let job = handle.read().await.clone();
        Some(job)
    }

    pub async fn contains(&self, job_id: &str) -> bool {
        self.jobs.read().await.contains_key(job_id)
    }

    /// Handles in job-id order.
    pub async fn handles(&self) -> Vec<JobHandle> {
        self.jobs.read().await.values().cloned().collect()
    }

    /// Copies of every job in job-id order.
    pub async fn all(&self) -> Vec<Job> {
        let mut jobs = Vec::new();
        for handle in self.handles().await {
            jobs.push(handle.read().await.clone());
        }
        jobs
    }

    pub async fn len(&self) -> usize {
        self.jobs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.jobs.read().await.is_empty()
    }
}
