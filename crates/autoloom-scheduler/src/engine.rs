//! Scheduler Engine: the coordinating loop that fires due jobs.
//!
//! One `tick` at a time (serialised by an async mutex). Capabilities run on
//! spawned tokio tasks bounded by a semaphore and report back over an mpsc
//! channel; workers never touch job state. The loop applies completions,
//! promotes dependency-triggered jobs, gates on dependencies and dispatches.

use std::collections::HashSet;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use std::time::Duration;

use autoloom_core::clock::Clock;
use autoloom_core::config::SchedulerConfig;
use autoloom_core::error::{AutoloomError, GraphError, Result};
use autoloom_core::traits::Capability;
use autoloom_core::types::{
    ExecutionOutcome, ExecutionRecord, Job, JobSpec, JobState, Parameters, new_id,
};
use autoloom_db::OrchestratorDb;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore, mpsc, watch};
use tokio::task::JoinHandle;

use crate::history::ExecutionHistory;
use crate::registry::TaskRegistry;
use crate::retry::RetryPolicy;
use crate::store::JobStore;
use crate::trigger;

/// How long shutdown waits for in-flight runs to report back.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

/// What a worker sends back when a capability invocation ends.
#[derive(Debug)]
struct Completion {
    job_id: String,
    attempt_number: u32,
    started_at: DateTime<Utc>,
    finished_at: DateTime<Utc>,
    outcome: ExecutionOutcome,
    manual: bool,
    /// Terminal state a manual run started from, restored afterwards.
    resume_state: Option<JobState>,
}

/// An explicit run request from `run_now` or a workflow execution.
#[derive(Debug, Clone)]
struct RunRequest {
    job_id: String,
    /// Whether dependency gating applies.
    gated: bool,
    requested_at: DateTime<Utc>,
}

struct Candidate {
    job_id: String,
    fire_time: DateTime<Utc>,
    request: Option<RunRequest>,
}

/// Summary of one tick, mostly for logs and tests.
#[derive(Debug, Default, Clone)]
pub struct TickReport {
    pub completed: usize,
    pub promoted: usize,
    pub dispatched: Vec<String>,
    /// Due but waiting on a dependency.
    pub gated: Vec<String>,
    /// Due but no free worker.
    pub deferred: Vec<String>,
}

/// A job plus whether a run is in flight right now.
#[derive(Debug, Clone, Serialize)]
pub struct JobStatusView {
    #[serde(flatten)]
    pub job: Job,
    pub in_flight: bool,
}

/// The execution engine. Owns the job store, history and worker pool.
pub struct SchedulerEngine {
    config: SchedulerConfig,
    registry: Arc<TaskRegistry>,
    clock: Arc<dyn Clock>,
    store: JobStore,
    history: ExecutionHistory,
    retry: RetryPolicy,
    db: Option<Arc<OrchestratorDb>>,
    workers: Arc<Semaphore>,
    in_flight: StdMutex<HashSet<String>>,
    requests: StdMutex<Vec<RunRequest>>,
    completion_tx: mpsc::UnboundedSender<Completion>,
    completion_rx: Mutex<mpsc::UnboundedReceiver<Completion>>,
    tick_lock: Mutex<()>,
    shutdown_tx: watch::Sender<bool>,
}

impl SchedulerEngine {
    pub fn new(config: SchedulerConfig, registry: Arc<TaskRegistry>, clock: Arc<dyn Clock>) -> Self {
        let (completion_tx, completion_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            retry: RetryPolicy::for_jobs(&config),
            history: ExecutionHistory::new(config.history_limit),
            workers: Arc::new(Semaphore::new(config.max_workers.max(1))),
            config,
            registry,
            clock,
            store: JobStore::new(),
            db: None,
            in_flight: StdMutex::new(HashSet::new()),
            requests: StdMutex::new(Vec::new()),
            completion_tx,
            completion_rx: Mutex::new(completion_rx),
            tick_lock: Mutex::new(()),
            shutdown_tx,
        }
    }

    /// Persist jobs and execution records to SQLite.
    pub fn with_db(mut self, db: Arc<OrchestratorDb>) -> Self {
        self.db = Some(db);
        self
    }

    pub fn registry(&self) -> &Arc<TaskRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    // ─── Job management ─────────────────────────────────────

    /// Validate a standalone job request and build the job.
    pub async fn build_job(&self, spec: JobSpec) -> Result<Job> {
        if !self.registry.contains(&spec.task_type) {
            return Err(GraphError::UnknownTaskType {
                task: spec.name,
                task_type: spec.task_type,
            }
            .into());
        }
        self.registry.validate_params(&spec.task_type, &spec.parameters)?;
        trigger::validate(&spec.trigger)?;
        for dep in &spec.depends_on {
            if !self.store.contains(dep).await {
                return Err(GraphError::UnknownDependency {
                    task: spec.name.clone(),
                    dependency: dep.clone(),
                }
                .into());
            }
        }

        let mut job = Job::new(
            new_id("job"),
            &spec.name,
            &spec.task_type,
            spec.parameters,
            spec.trigger,
            spec.max_retries.unwrap_or(self.config.default_max_retries),
            spec.timeout_secs.unwrap_or(self.config.default_timeout_secs),
        );
        job.depends_on = spec.depends_on;
        self.prepare_job(&mut job)?;
        Ok(job)
    }

    /// Compute the first fire time of a job about to be scheduled.
    pub fn prepare_job(&self, job: &mut Job) -> Result<()> {
        let now = self.clock.now();
        if job.workflow_id.is_none() {
            job.created_at = now;
        }
        job.state = JobState::Scheduled;
        job.next_fire_time = if job.enabled {
            trigger::initial_fire_time(&job.trigger, now)?
        } else {
            None
        };
        Ok(())
    }

    /// Add a standalone job and persist it.
    pub async fn add_job(&self, spec: JobSpec) -> Result<String> {
        let job = self.build_job(spec).await?;
        if let Some(db) = &self.db {
            db.save_job(&job)?;
        }
        let id = job.job_id.clone();
        tracing::info!(
            "📅 Job added: '{}' ({}) {} next={:?}",
            job.name,
            id,
            job.trigger,
            job.next_fire_time
        );
        self.store.insert(job).await?;
        Ok(id)
    }

    /// Insert already-prepared (and already-persisted) jobs: all or none.
    pub async fn insert_jobs(&self, jobs: Vec<Job>) -> Result<Vec<String>> {
        let mut inserted: Vec<String> = Vec::with_capacity(jobs.len());
        for job in jobs {
            let id = job.job_id.clone();
            if let Err(e) = self.store.insert(job).await {
                for id in &inserted {
                    self.store.remove(id).await;
                }
                return Err(e);
            }
            inserted.push(id);
        }
        tracing::info!("📅 {} job(s) scheduled", inserted.len());
        Ok(inserted)
    }

    /// Remove a job. An in-flight run finishes but leaves no record.
    pub async fn remove_job(&self, job_id: &str) -> Result<Job> {
        let job = self
            .store
            .remove(job_id)
            .await
            .ok_or_else(|| AutoloomError::not_found(format!("job '{job_id}'")))?;
        lock(&self.requests).retain(|r| r.job_id != job_id);
        self.history.remove_job(job_id).await;
        if let Some(db) = &self.db {
            db.delete_job(job_id)?;
        }
        tracing::info!("🗑️ Job removed: '{}' ({})", job.name, job_id);
        Ok(job)
    }

    /// Remove every job of a workflow from memory. Returns the removed ids.
    pub async fn remove_workflow_jobs(&self, workflow_id: &str) -> Vec<String> {
        let mut removed = Vec::new();
        for job in self.store.all().await {
            if job.workflow_id.as_deref() == Some(workflow_id) {
                self.store.remove(&job.job_id).await;
                self.history.remove_job(&job.job_id).await;
                removed.push(job.job_id);
            }
        }
        lock(&self.requests).retain(|r| !removed.contains(&r.job_id));
        removed
    }

    /// Pause or resume a job. Pausing never aborts an in-flight run.
    pub async fn set_enabled(&self, job_id: &str, enabled: bool) -> Result<()> {
        let handle = self
            .store
            .get(job_id)
            .await
            .ok_or_else(|| AutoloomError::not_found(format!("job '{job_id}'")))?;
        let mut job = handle.write().await;
        if job.enabled == enabled {
            return Ok(());
        }
        job.enabled = enabled;

        if !enabled {
            job.next_fire_time = None;
            job.retry_count = 0;
            job.cycle_fire_time = None;
            if job.state == JobState::Due {
                job.state = JobState::Scheduled;
            }
            tracing::info!("⏸️ Job paused: '{}'", job.name);
        } else if !job.state.is_terminal() && !self.is_in_flight(job_id) {
            let now = self.clock.now();
            job.next_fire_time = if job.run_count == 0 {
                trigger::initial_fire_time(&job.trigger, now)?
            } else {
                trigger::next_fire_after(&job.trigger, now)?
            };
            tracing::info!("▶️ Job resumed: '{}' next={:?}", job.name, job.next_fire_time);
        }
        self.persist(&job);
        Ok(())
    }

    /// Run a job on the next tick, bypassing its trigger and dependency gating.
    pub async fn run_now(&self, job_id: &str) -> Result<()> {
        self.request_runs(&[job_id.to_string()], false).await
    }

    /// Queue explicit runs for the next tick.
    ///
    /// A gated request waits until its dependencies succeed again and is
    /// dropped if one of them fails first.
    pub async fn request_runs(&self, job_ids: &[String], gated: bool) -> Result<()> {
        for id in job_ids {
            if !self.store.contains(id).await {
                return Err(AutoloomError::not_found(format!("job '{id}'")));
            }
        }
        let requested_at = self.clock.now();
        let mut requests = lock(&self.requests);
        for id in job_ids {
            if !requests.iter().any(|r| &r.job_id == id) {
                requests.push(RunRequest {
                    job_id: id.clone(),
                    gated,
                    requested_at,
                });
            }
        }
        Ok(())
    }

    pub async fn job(&self, job_id: &str) -> Option<Job> {
        self.store.snapshot(job_id).await
    }

    pub async fn jobs(&self) -> Vec<Job> {
        self.store.all().await
    }

    pub async fn job_views(&self) -> Vec<JobStatusView> {
        let in_flight = lock(&self.in_flight).clone();
        self.store
            .all()
            .await
            .into_iter()
            .map(|job| JobStatusView {
                in_flight: in_flight.contains(&job.job_id),
                job,
            })
            .collect()
    }

    /// Execution records of a job started within `[from, to]`.
    ///
    /// Reads SQLite when configured (full history), memory otherwise.
    pub async fn history(
        &self,
        job_id: &str,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> Result<Vec<ExecutionRecord>> {
        match &self.db {
            Some(db) => db.records_for(job_id, from, to),
            None => Ok(self.history.for_job(job_id, from, to).await),
        }
    }

    pub fn in_flight_count(&self) -> usize {
        lock(&self.in_flight).len()
    }

    /// Reload jobs and recent history from SQLite.
    pub async fn restore(&self) -> Result<usize> {
        let Some(db) = &self.db else {
            return Ok(0);
        };
        let now = self.clock.now();
        let mut restored = 0;
        for mut job in db.load_jobs()? {
            if self.store.contains(&job.job_id).await {
                continue;
            }
            for record in db.recent_records(&job.job_id, self.config.history_limit)? {
                self.history.append(record).await;
            }
            if matches!(
                job.state,
                JobState::Running | JobState::Succeeded | JobState::Failed
            ) {
                tracing::warn!("⚠️ Job '{}' was interrupted mid-run, rescheduling", job.name);
                job.state = JobState::Scheduled;
                if job.enabled && job.next_fire_time.is_none() && !job.is_dependency_triggered() {
                    job.next_fire_time = Some(now);
                }
            }
            self.store.insert(job).await?;
            restored += 1;
        }
        if restored > 0 {
            tracing::info!("💾 Restored {restored} job(s) from database");
        }
        Ok(restored)
    }

    // ─── The loop ───────────────────────────────────────────

    /// One pass of the scheduling loop.
    pub async fn tick(&self) -> TickReport {
        let _guard = self.tick_lock.lock().await;
        let mut report = TickReport {
            completed: self.drain_completions().await,
            ..Default::default()
        };

        let now = self.clock.now();
        report.promoted = self.promote_dependents(now).await;

        let requests = std::mem::take(&mut *lock(&self.requests));
        let mut queued = HashSet::new();
        let mut candidates = Vec::new();

        for handle in self.store.handles().await {
            let job = handle.read().await;
            if !job.is_due(now) {
                continue;
            }
            if self.is_in_flight(&job.job_id) {
                tracing::debug!("⏭️ '{}' still running, skipping this tick", job.name);
                continue;
            }
            if let Some(fire_time) = job.next_fire_time {
                queued.insert(job.job_id.clone());
                candidates.push(Candidate {
                    job_id: job.job_id.clone(),
                    fire_time,
                    request: None,
                });
            }
        }

        for request in requests {
            if queued.contains(&request.job_id) || self.is_in_flight(&request.job_id) {
                continue;
            }
            queued.insert(request.job_id.clone());
            candidates.push(Candidate {
                job_id: request.job_id.clone(),
                fire_time: now,
                request: Some(request),
            });
        }

        candidates.sort_by(|a, b| (a.fire_time, &a.job_id).cmp(&(b.fire_time, &b.job_id)));

        let mut deferred_requests = Vec::new();
        for candidate in candidates {
            let Some(handle) = self.store.get(&candidate.job_id).await else {
                continue;
            };
            let mut job = handle.write().await;
            let gated = candidate.request.as_ref().is_none_or(|r| r.gated);

            if gated && !self.dependencies_satisfied(&job).await {
                match candidate.request {
                    Some(request) => {
                        if self.dependency_failed_since(&job, request.requested_at).await {
                            tracing::info!(
                                "🚫 Run request for '{}' dropped: a dependency failed",
                                job.name
                            );
                        } else {
                            deferred_requests.push(request);
                        }
                    }
                    None => {
                        if job.state == JobState::Scheduled
                            && job.transition(JobState::Due).is_ok()
                        {
                            self.persist(&job);
                        }
                    }
                }
                tracing::debug!("🔒 '{}' waiting on dependencies", job.name);
                report.gated.push(candidate.job_id);
                continue;
            }

            let Ok(permit) = self.workers.clone().try_acquire_owned() else {
                match candidate.request {
                    Some(request) => deferred_requests.push(request),
                    None => {
                        if job.state == JobState::Scheduled
                            && job.transition(JobState::Due).is_ok()
                        {
                            self.persist(&job);
                        }
                    }
                }
                report.deferred.push(candidate.job_id);
                continue;
            };

            if self.dispatch(&mut job, permit, candidate.request.is_some(), now) {
                report.dispatched.push(candidate.job_id);
            }
        }

        if !deferred_requests.is_empty() {
            let mut requests = lock(&self.requests);
            deferred_requests.append(&mut requests);
            *requests = deferred_requests;
        }

        if !report.dispatched.is_empty() || report.completed > 0 {
            tracing::debug!(
                "⏰ tick: {} completed, {} promoted, {} dispatched, {} gated, {} deferred",
                report.completed,
                report.promoted,
                report.dispatched.len(),
                report.gated.len(),
                report.deferred.len()
            );
        }
        report
    }

    /// Wait for every in-flight run to report back and apply the results.
    pub async fn settle(&self) -> usize {
        let _guard = self.tick_lock.lock().await;
        let mut rx = self.completion_rx.lock().await;
        let mut applied = 0;
        while self.in_flight_count() > 0 {
            match rx.recv().await {
                Some(completion) => {
                    self.apply_completion(completion).await;
                    applied += 1;
                }
                None => break,
            }
        }
        while let Ok(completion) = rx.try_recv() {
            self.apply_completion(completion).await;
            applied += 1;
        }
        applied
    }

    /// Ask a running `spawn_scheduler` loop to stop.
    pub fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);
    }

    fn subscribe_shutdown(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    async fn drain_completions(&self) -> usize {
        let completions: Vec<Completion> = {
            let mut rx = self.completion_rx.lock().await;
            std::iter::from_fn(|| rx.try_recv().ok()).collect()
        };
        let count = completions.len();
        for completion in completions {
            self.apply_completion(completion).await;
        }
        count
    }

    /// Make dependency-triggered jobs due once their dependencies succeeded.
    async fn promote_dependents(&self, now: DateTime<Utc>) -> usize {
        let mut promoted = 0;
        for handle in self.store.handles().await {
            let mut job = handle.write().await;
            if !job.enabled
                || !job.is_dependency_triggered()
                || job.depends_on.is_empty()
                || job.state != JobState::Scheduled
                || job.next_fire_time.is_some()
                || self.is_in_flight(&job.job_id)
            {
                continue;
            }
            if self.dependencies_satisfied(&job).await {
                job.next_fire_time = Some(now);
                if job.transition(JobState::Due).is_ok() {
                    tracing::info!("🔗 '{}' dependencies satisfied, now due", job.name);
                    self.persist(&job);
                    promoted += 1;
                }
            }
        }
        promoted
    }

    /// Every dependency's latest record is a success newer than this job's
    /// last dispatch. Retries of a cycle that already passed the gate are not re-gated.
    async fn dependencies_satisfied(&self, job: &Job) -> bool {
        if job.retry_count > 0 {
            return true;
        }
        for dep in &job.depends_on {
            match self.history.latest(dep).await {
                Some(record)
                    if record.outcome.is_success()
                        && job.last_run.is_none_or(|last| record.finished_at > last) => {}
                _ => return false,
            }
        }
        true
    }

    /// A dependency is gone, or its latest record is a failure newer than `since`.
    async fn dependency_failed_since(&self, job: &Job, since: DateTime<Utc>) -> bool {
        for dep in &job.depends_on {
            if !self.store.contains(dep).await {
                return true;
            }
            if let Some(record) = self.history.latest(dep).await
                && !record.outcome.is_success()
                && record.finished_at >= since
            {
                return true;
            }
        }
        false
    }

    /// Move the job to Running and hand it to a worker.
    fn dispatch(
        &self,
        job: &mut Job,
        permit: OwnedSemaphorePermit,
        manual: bool,
        now: DateTime<Utc>,
    ) -> bool {
        let resume_state = (manual && job.state.is_terminal()).then_some(job.state);
        if resume_state.is_some() {
            let _ = job.transition(JobState::Due);
        }
        if job.state == JobState::Scheduled {
            let _ = job.transition(JobState::Due);
        }
        if let Err(e) = job.transition(JobState::Running) {
            tracing::warn!("⚠️ Cannot dispatch: {e}");
            return false;
        }

        let attempt_number = if manual {
            1
        } else {
            if job.retry_count == 0 {
                job.cycle_fire_time = job.next_fire_time.or(Some(now));
            }
            if job.is_dependency_triggered() {
                job.next_fire_time = None;
            }
            job.retry_count + 1
        };
        job.last_run = Some(now);
        job.run_count += 1;
        lock(&self.in_flight).insert(job.job_id.clone());
        self.persist(job);

        tracing::info!(
            "🔔 Job triggered: '{}' ({}) attempt {}{}",
            job.name,
            job.task_type,
            attempt_number,
            if manual { " [manual]" } else { "" }
        );

        let capability = self.registry.get(&job.task_type);
        let task_type = job.task_type.clone();
        let parameters = job.parameters.clone();
        let timeout_secs = job.timeout_secs.max(1);
        let job_id = job.job_id.clone();
        let completion_tx = self.completion_tx.clone();
        let clock = self.clock.clone();

        tokio::spawn(async move {
            let outcome = invoke_capability(capability, &task_type, parameters, timeout_secs).await;
            drop(permit);
            let _ = completion_tx.send(Completion {
                job_id,
                attempt_number,
                started_at: now,
                finished_at: clock.now(),
                outcome,
                manual,
                resume_state,
            });
        });
        true
    }

    /// Record the attempt and move the job to its next state.
    async fn apply_completion(&self, completion: Completion) {
        lock(&self.in_flight).remove(&completion.job_id);

        let record = ExecutionRecord {
            record_id: new_id("rec"),
            job_id: completion.job_id.clone(),
            attempt_number: completion.attempt_number,
            started_at: completion.started_at,
            finished_at: completion.finished_at,
            outcome: completion.outcome,
            manual: completion.manual,
        };
        let Some(handle) = self.store.get(&record.job_id).await else {
            tracing::debug!("Completion for removed job {}", record.job_id);
            return;
        };
        self.history.append(record.clone()).await;
        if let Some(db) = &self.db
            && let Err(e) = db.append_record(&record)
        {
            tracing::warn!("⚠️ Failed to save execution record: {e}");
        }

        let mut job = handle.write().await;
        let success = record.outcome.is_success();
        match &record.outcome {
            ExecutionOutcome::Success { .. } => {
                tracing::info!(
                    "✅ Job '{}' succeeded ({}ms)",
                    job.name,
                    record.duration_ms()
                );
            }
            outcome => {
                tracing::warn!(
                    "⚠️ Job '{}' attempt {} failed: {}",
                    job.name,
                    record.attempt_number,
                    outcome.error().unwrap_or_default()
                );
            }
        }
        job.last_result = Some(record.outcome.clone());

        let now = self.clock.now();
        let result = if completion.manual {
            finish_manual(&mut job, success, completion.resume_state)
        } else if success {
            self.finish_success(&mut job, now)
        } else {
            self.finish_failure(&mut job, now)
        };
        if let Err(e) = result {
            tracing::warn!("⚠️ {e}");
        }
        if !job.enabled {
            job.next_fire_time = None;
        }
        self.persist(&job);
    }

    fn finish_success(&self, job: &mut Job, now: DateTime<Utc>) -> std::result::Result<(), String> {
        job.transition(JobState::Succeeded)?;
        job.retry_count = 0;
        let anchor = job.cycle_fire_time.take().unwrap_or(now);
        job.next_fire_time = self.next_fire(job, anchor, now);
        if job.next_fire_time.is_some() || job.is_dependency_triggered() {
            job.transition(JobState::Scheduled)
        } else {
            tracing::info!("🏁 Job '{}' completed", job.name);
            job.transition(JobState::Completed)
        }
    }

    fn finish_failure(&self, job: &mut Job, now: DateTime<Utc>) -> std::result::Result<(), String> {
        job.transition(JobState::Failed)?;
        if job.retry_count < job.max_retries {
            // Anchored to the cycle's fire time unless the attempt overran the delay
            let delay = self.retry.delay_chrono(job.retry_count);
            let anchored = job.cycle_fire_time.unwrap_or(now) + delay;
            let retry_at = if anchored > now { anchored } else { now + delay };
            job.retry_count += 1;
            job.next_fire_time = Some(retry_at);
            tracing::info!(
                "🔁 Retry {}/{} for '{}' at {}",
                job.retry_count,
                job.max_retries,
                job.name,
                retry_at
            );
            job.transition(JobState::Scheduled)
        } else {
            job.next_fire_time = None;
            job.cycle_fire_time = None;
            tracing::error!(
                "❌ Job '{}' permanently failed after {} attempt(s)",
                job.name,
                job.retry_count + 1
            );
            job.transition(JobState::PermanentlyFailed)
        }
    }

    /// Next trigger time after `anchor`; fires missed while running are skipped.
    fn next_fire(&self, job: &Job, anchor: DateTime<Utc>, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let next = trigger::next_fire_after(&job.trigger, anchor)
            .and_then(|next| match next {
                Some(at) if at <= now => trigger::next_fire_after(&job.trigger, now),
                other => Ok(other),
            });
        match next {
            Ok(next) => next,
            Err(e) => {
                tracing::warn!("⚠️ Cannot compute next fire time for '{}': {e}", job.name);
                None
            }
        }
    }

    fn is_in_flight(&self, job_id: &str) -> bool {
        lock(&self.in_flight).contains(job_id)
    }

    fn persist(&self, job: &Job) {
        if let Some(db) = &self.db
            && let Err(e) = db.save_job(job)
        {
            tracing::warn!("⚠️ Failed to save job '{}': {e}", job.job_id);
        }
    }
}

/// Manual runs never retry and never move the schedule. A finished job goes
/// back to the terminal state it was re-run from.
fn finish_manual(
    job: &mut Job,
    success: bool,
    resume_state: Option<JobState>,
) -> std::result::Result<(), String> {
    job.transition(if success {
        JobState::Succeeded
    } else {
        JobState::Failed
    })?;
    match resume_state {
        Some(terminal) => job.transition(terminal),
        None => job.transition(JobState::Scheduled),
    }
}

/// Invoke under a timeout on its own task so a panic surfaces as a `JoinError`.
async fn invoke_capability(
    capability: Option<Arc<dyn Capability>>,
    task_type: &str,
    parameters: Parameters,
    timeout_secs: u64,
) -> ExecutionOutcome {
    let Some(capability) = capability else {
        return ExecutionOutcome::Failure {
            error: AutoloomError::execution(format!("no capability registered for '{task_type}'"))
                .to_string(),
        };
    };

    let mut handle: JoinHandle<Result<serde_json::Value>> =
        tokio::spawn(async move { capability.invoke(&parameters).await });

    match tokio::time::timeout(Duration::from_secs(timeout_secs), &mut handle).await {
        Ok(Ok(Ok(output))) => ExecutionOutcome::Success { output },
        Ok(Ok(Err(e))) => ExecutionOutcome::Failure {
            error: e.to_string(),
        },
        Ok(Err(join_error)) => ExecutionOutcome::Failure {
            error: AutoloomError::execution(panic_message(join_error)).to_string(),
        },
        Err(_) => {
            handle.abort();
            ExecutionOutcome::TimedOut {
                after_secs: timeout_secs,
            }
        }
    }
}

fn panic_message(error: tokio::task::JoinError) -> String {
    if !error.is_panic() {
        return format!("capability task cancelled: {error}");
    }
    let payload = error.into_panic();
    let detail = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".into());
    format!("capability panicked: {detail}")
}

fn lock<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Spawn the scheduler loop as a background tokio task.
/// Ticks at `tick_interval_ms` until [`SchedulerEngine::shutdown`] is called,
/// then waits briefly for in-flight runs to report back.
pub fn spawn_scheduler(engine: Arc<SchedulerEngine>) -> JoinHandle<()> {
    let mut shutdown = engine.subscribe_shutdown();
    tokio::spawn(async move {
        let every = Duration::from_millis(engine.config.tick_interval_ms.max(1));
        tracing::info!(
            "⏰ Scheduler started (tick every {}ms, {} workers)",
            every.as_millis(),
            engine.config.max_workers
        );

        let mut interval = tokio::time::interval(every);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            if *shutdown.borrow_and_update() {
                break;
            }
            tokio::select! {
                _ = interval.tick() => {
                    engine.tick().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        if engine.in_flight_count() > 0 {
            tracing::info!("⏳ Waiting for {} in-flight job(s)", engine.in_flight_count());
            if tokio::time::timeout(SHUTDOWN_GRACE, engine.settle()).await.is_err() {
                tracing::warn!("⚠️ In-flight jobs did not finish before shutdown");
            }
        }
        tracing::info!("⏰ Scheduler stopped");
    })
}
