//! The orchestration facade: one context object owning the parser, the task
//! registry, the scheduler engine, the process supervisor and the database.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use autoloom_core::clock::{Clock, SystemClock};
use autoloom_core::config::AutoloomConfig;
use autoloom_core::error::{AutoloomError, Result};
use autoloom_core::traits::Capability;
use autoloom_core::types::{ExecutionRecord, Job, JobSpec, ProcessEntry, Workflow};
use autoloom_db::OrchestratorDb;
use autoloom_scheduler::{
    JobStatusView, ResolveOptions, SchedulerEngine, TaskRegistry, resolve_with, spawn_scheduler,
};
use autoloom_supervisor::{ProcessSupervisor, spawn_supervisor};
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;

use crate::intent::IntentParser;
use crate::plan::PlanSummary;

pub struct Orchestrator {
    config: AutoloomConfig,
    clock: Arc<dyn Clock>,
    parser: IntentParser,
    registry: Arc<TaskRegistry>,
    engine: Arc<SchedulerEngine>,
    supervisor: Arc<ProcessSupervisor>,
    db: Option<Arc<OrchestratorDb>>,
    workflows: RwLock<BTreeMap<String, Workflow>>,
    loops: Mutex<Vec<JoinHandle<()>>>,
}

impl Orchestrator {
    /// Build from config: wall clock, SQLite at `storage.db_path` when
    /// storage is enabled, intent source per `[intent]`.
    pub fn open(config: AutoloomConfig) -> Result<Self> {
        config.validate()?;
        let db = if config.storage.enabled {
            let path = shellexpand::tilde(&config.storage.db_path).to_string();
            tracing::info!("💾 Database: {path}");
            Some(Arc::new(OrchestratorDb::open(Path::new(&path))?))
        } else {
            None
        };
        let parser = IntentParser::from_config(&config.intent)?;
        Ok(Self::with_parts(config, parser, Arc::new(SystemClock), db))
    }

    pub fn with_parts(
        config: AutoloomConfig,
        parser: IntentParser,
        clock: Arc<dyn Clock>,
        db: Option<Arc<OrchestratorDb>>,
    ) -> Self {
        let registry = Arc::new(TaskRegistry::with_builtins());
        let mut engine =
            SchedulerEngine::new(config.scheduler.clone(), registry.clone(), clock.clone());
        let mut supervisor =
            ProcessSupervisor::new(config.supervisor.clone(), registry.clone(), clock.clone());
        if let Some(db) = &db {
            engine = engine.with_db(db.clone());
            supervisor = supervisor.with_db(db.clone());
        }
        Self {
            config,
            clock,
            parser,
            registry,
            engine: Arc::new(engine),
            supervisor: Arc::new(supervisor),
            db,
            workflows: RwLock::new(BTreeMap::new()),
            loops: Mutex::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &AutoloomConfig {
        &self.config
    }

    pub fn engine(&self) -> &Arc<SchedulerEngine> {
        &self.engine
    }

    pub fn supervisor(&self) -> &Arc<ProcessSupervisor> {
        &self.supervisor
    }

    pub fn parser(&self) -> &IntentParser {
        &self.parser
    }

    // ─── Capabilities ───────────────────────────────────────

    /// Register a capability. Do this before orchestrating work that uses it.
    pub fn register_task(&self, task_type: &str, capability: Arc<dyn Capability>) -> Result<()> {
        self.registry.register(task_type, capability)
    }

    pub fn task_types(&self) -> Vec<String> {
        self.registry.task_types()
    }

    // ─── Workflows ──────────────────────────────────────────

    /// Parse, resolve and schedule. Either the whole workflow lands (memory
    /// and database) or nothing does.
    pub async fn orchestrate(&self, text: &str, workflow_name: &str) -> Result<Workflow> {
        let tasks = self.parser.parse(text).await?;
        let name = match workflow_name.trim() {
            "" => "workflow",
            name => name,
        };
        let mut workflow = Workflow::new(name, tasks);
        workflow.description = text.trim().to_string();
        self.submit_workflow(workflow).await
    }

    /// Resolve and schedule an already-built workflow, all or nothing.
    pub async fn submit_workflow(&self, mut workflow: Workflow) -> Result<Workflow> {
        workflow.created_at = self.clock.now();
        let batches = resolve_with(
            &workflow,
            &self.registry,
            ResolveOptions::from(&self.config.scheduler),
        )?;
        let batch_count = batches.len();
        let mut jobs: Vec<Job> = batches.into_iter().flatten().collect();
        for job in &mut jobs {
            self.engine.prepare_job(job)?;
        }

        if let Some(db) = &self.db {
            db.save_workflow_with_jobs(&workflow, &jobs)?;
        }
        if let Err(e) = self.engine.insert_jobs(jobs).await {
            if let Some(db) = &self.db
                && let Err(db_err) = db.delete_workflow(&workflow.id)
            {
                tracing::warn!("⚠️ Rollback of workflow '{}' failed: {db_err}", workflow.id);
            }
            return Err(e);
        }

        self.workflows
            .write()
            .await
            .insert(workflow.id.clone(), workflow.clone());
        tracing::info!(
            "🧵 Workflow '{}' created ({}): {} task(s) in {} batch(es)",
            workflow.name,
            workflow.id,
            workflow.tasks.len(),
            batch_count
        );
        Ok(workflow)
    }

    /// Parse and resolve without scheduling anything.
    pub async fn plan(&self, text: &str) -> Result<PlanSummary> {
        let tasks = self.parser.parse(text).await?;
        let mut workflow = Workflow::new("plan", tasks);
        workflow.created_at = self.clock.now();
        let batches = resolve_with(
            &workflow,
            &self.registry,
            ResolveOptions::from(&self.config.scheduler),
        )?;
        Ok(PlanSummary::from_batches(&batches))
    }

    pub async fn workflows(&self) -> Vec<Workflow> {
        self.workflows.read().await.values().cloned().collect()
    }

    pub async fn workflow(&self, workflow_id: &str) -> Option<Workflow> {
        self.workflows.read().await.get(workflow_id).cloned()
    }

    /// Delete a workflow and unschedule its jobs. In-flight runs finish but change nothing.
    pub async fn delete_workflow(&self, workflow_id: &str) -> Result<Workflow> {
        let workflow = self
            .workflows
            .write()
            .await
            .remove(workflow_id)
            .ok_or_else(|| AutoloomError::not_found(format!("workflow '{workflow_id}'")))?;
        let removed = self.engine.remove_workflow_jobs(workflow_id).await;
        if let Some(db) = &self.db {
            db.delete_workflow(workflow_id)?;
        }
        tracing::info!(
            "🗑️ Workflow '{}' deleted ({} job(s) unscheduled)",
            workflow.name,
            removed.len()
        );
        Ok(workflow)
    }

    /// Run every job of the workflow now, in dependency order.
    /// Returns the job ids queued.
    pub async fn execute_workflow(&self, workflow_id: &str) -> Result<Vec<String>> {
        let workflow = self
            .workflow(workflow_id)
            .await
            .ok_or_else(|| AutoloomError::not_found(format!("workflow '{workflow_id}'")))?;
        let job_ids: Vec<String> = workflow
            .tasks
            .iter()
            .map(|task| workflow.job_id_for(&task.name))
            .collect();
        self.engine.request_runs(&job_ids, true).await?;
        tracing::info!("▶️ Workflow '{}' queued for execution", workflow.name);
        Ok(job_ids)
    }

    // ─── Jobs ───────────────────────────────────────────────

    pub async fn add_job(&self, spec: JobSpec) -> Result<String> {
        self.engine.add_job(spec).await
    }

    pub async fn jobs(&self) -> Vec<JobStatusView> {
        self.engine.job_views().await
    }

    pub async fn job(&self, job_id: &str) -> Option<Job> {
        self.engine.job(job_id).await
    }

    pub async fn run_job(&self, job_id: &str) -> Result<()> {
        self.engine.run_now(job_id).await
    }

    pub async fn delete_job(&self, job_id: &str) -> Result<Job> {
        self.engine.remove_job(job_id).await
    }

    pub async fn set_job_enabled(&self, job_id: &str, enabled: bool) -> Result<()> {
        self.engine.set_enabled(job_id, enabled).await
    }

    /// Execution records of a job, optionally bounded by start time.
    pub async fn history(
        &self,
        job_id: &str,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> Result<Vec<ExecutionRecord>> {
        self.engine.history(job_id, from, to).await
    }

    // ─── Processes ──────────────────────────────────────────

    pub async fn add_process(&self, entry: ProcessEntry) -> Result<String> {
        self.supervisor.register(entry).await
    }

    pub async fn processes(&self) -> Vec<ProcessEntry> {
        self.supervisor.list().await
    }

    pub async fn process(&self, process_id: &str) -> Option<ProcessEntry> {
        self.supervisor.get(process_id).await
    }

    pub async fn start_process(&self, process_id: &str) -> Result<()> {
        self.supervisor.start(process_id).await
    }

    pub async fn stop_process(&self, process_id: &str) -> Result<()> {
        self.supervisor.stop(process_id).await
    }

    pub async fn restart_process(&self, process_id: &str) -> Result<()> {
        self.supervisor.restart(process_id).await
    }

    pub async fn remove_process(&self, process_id: &str) -> Result<ProcessEntry> {
        self.supervisor.remove(process_id).await
    }

    // ─── Lifecycle ──────────────────────────────────────────

    /// Reload persisted state and spawn the scheduler and supervisor loops.
    pub async fn start(&self) -> Result<()> {
        let mut loops = self.loops.lock().await;
        if !loops.is_empty() {
            return Ok(());
        }

        if let Some(db) = &self.db {
            let mut workflows = self.workflows.write().await;
            for workflow in db.load_workflows()? {
                workflows.entry(workflow.id.clone()).or_insert(workflow);
            }
        }
        self.engine.restore().await?;
        self.supervisor.restore().await?;

        loops.push(spawn_scheduler(self.engine.clone()));
        loops.push(spawn_supervisor(self.supervisor.clone()));

        let started = self.supervisor.start_all_enabled().await;
        tracing::info!(
            "🧵 Orchestrator running: {} workflow(s), {} job(s), {} process(es) started",
            self.workflows.read().await.len(),
            self.engine.jobs().await.len(),
            started
        );
        Ok(())
    }

    /// Stop both loops; waits for in-flight jobs and stops live processes.
    pub async fn shutdown(&self) {
        self.engine.shutdown();
        self.supervisor.shutdown();
        let handles: Vec<JoinHandle<()>> = self.loops.lock().await.drain(..).collect();
        for handle in handles {
            if let Err(e) = handle.await {
                tracing::warn!("⚠️ Background loop ended abnormally: {e}");
            }
        }
        tracing::info!("🧵 Orchestrator stopped");
    }
}
