//! Process Supervisor: lifecycle, health probing and crash-loop backoff.
//!
//! The supervisor owns every `ProcessEntry` exclusively. Each entry sits
//! behind its own lock so a slow stop or probe on one process never blocks
//! reads of the others.

use std::collections::BTreeMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use autoloom_core::clock::Clock;
use autoloom_core::config::SupervisorConfig;
use autoloom_core::error::{AutoloomError, GraphError, Result};
use autoloom_core::types::{DesiredState, HealthCheck, ProcessCommand, ProcessEntry, ProcessStatus};
use autoloom_db::OrchestratorDb;
use autoloom_scheduler::{RetryPolicy, TaskRegistry};
use chrono::{DateTime, Utc};
use tokio::process::Child;
use tokio::sync::{Mutex, RwLock, watch};
use tokio::task::JoinHandle;

use crate::resources::{self, CpuMark};

/// What is actually running for a process.
enum Runtime {
    Child(Child),
    Task(JoinHandle<Result<serde_json::Value>>),
}

impl Runtime {
    fn pid(&self) -> Option<u32> {
        match self {
            Self::Child(child) => child.id(),
            Self::Task(_) => None,
        }
    }

    /// `Some(reason)` once the process has exited.
    async fn poll_exit(&mut self) -> Option<String> {
        match self {
            Self::Child(child) => match child.try_wait() {
                Ok(Some(status)) => Some(format!("exited with {status}")),
                Ok(None) => None,
                Err(e) => Some(format!("wait failed: {e}")),
            },
            Self::Task(handle) => {
                if !handle.is_finished() {
                    return None;
                }
                Some(match handle.await {
                    Ok(Ok(_)) => "capability returned".to_string(),
                    Ok(Err(e)) => format!("capability failed: {e}"),
                    Err(e) if e.is_panic() => "capability panicked".to_string(),
                    Err(e) => format!("capability cancelled: {e}"),
                })
            }
        }
    }

    /// SIGKILL / abort, no grace.
    async fn kill(self) {
        match self {
            Self::Child(mut child) => {
                if let Some(pid) = child.id() {
                    signal_group(pid, "-KILL").await;
                }
                let _ = child.kill().await;
            }
            Self::Task(handle) => handle.abort(),
        }
    }

    /// SIGTERM to the process group, then SIGKILL once `grace` runs out.
    async fn terminate(self, grace: Duration, name: &str) {
        match self {
            Self::Child(mut child) => {
                let pid = child.id();
                if let Some(pid) = pid {
                    signal_group(pid, "-TERM").await;
                }
                if tokio::time::timeout(grace, child.wait()).await.is_err() {
                    tracing::warn!("⚠️ '{name}' ignored SIGTERM for {}s, killing", grace.as_secs());
                    if let Some(pid) = pid {
                        signal_group(pid, "-KILL").await;
                    }
                    let _ = child.kill().await;
                }
            }
            Self::Task(handle) => handle.abort(),
        }
    }
}

/// Children lead their own group (pgid == pid), so this reaches grandchildren too.
async fn signal_group(pid: u32, signal: &str) {
    let _ = tokio::process::Command::new("kill")
        .args([signal, "--", &format!("-{pid}")])
        .output()
        .await;
}

/// Supervisor-private state wrapped around an entry.
struct Supervised {
    entry: ProcessEntry,
    runtime: Option<Runtime>,
    /// Pending auto-restart. Cleared by `stop`.
    restart_at: Option<DateTime<Utc>>,
    /// `max_restarts` reached; no further auto-restarts until a manual start.
    gave_up: bool,
    cpu_mark: Option<CpuMark>,
}

impl Supervised {
    fn new(entry: ProcessEntry) -> Self {
        Self {
            entry,
            runtime: None,
            restart_at: None,
            gave_up: false,
            cpu_mark: None,
        }
    }
}

type ProcessHandle = Arc<RwLock<Supervised>>;

/// What one `check_all` pass did.
#[derive(Debug, Default, Clone)]
pub struct CheckReport {
    pub checked: usize,
    pub crashed: Vec<String>,
    pub restarted: Vec<String>,
    /// Hit `max_restarts` this pass.
    pub gave_up: Vec<String>,
    /// Restart counter reset after a sustained healthy run.
    pub reset: Vec<String>,
}

pub struct ProcessSupervisor {
    config: SupervisorConfig,
    registry: Arc<TaskRegistry>,
    clock: Arc<dyn Clock>,
    restart_policy: RetryPolicy,
    processes: RwLock<BTreeMap<String, ProcessHandle>>,
    db: Option<Arc<OrchestratorDb>>,
    http: reqwest::Client,
    check_lock: Mutex<()>,
    shutdown_tx: watch::Sender<bool>,
}

impl ProcessSupervisor {
    pub fn new(config: SupervisorConfig, registry: Arc<TaskRegistry>, clock: Arc<dyn Clock>) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            restart_policy: RetryPolicy::for_restarts(&config),
            config,
            registry,
            clock,
            processes: RwLock::new(BTreeMap::new()),
            db: None,
            http: reqwest::Client::new(),
            check_lock: Mutex::new(()),
            shutdown_tx,
        }
    }

    pub fn with_db(mut self, db: Arc<OrchestratorDb>) -> Self {
        self.db = Some(db);
        self
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    // ─── Registration ───────────────────────────────────────

    /// Register a process definition. It starts only on `start`.
    pub async fn register(&self, mut entry: ProcessEntry) -> Result<String> {
        self.validate(&entry)?;
        entry.status = ProcessStatus::NotStarted;
        entry.desired_state = DesiredState::Stopped;
        entry.pid = None;
        entry.restart_count = 0;
        entry.created_at = self.clock.now();

        let id = entry.process_id.clone();
        let mut processes = self.processes.write().await;
        if processes.contains_key(&id) {
            return Err(AutoloomError::config(format!("process '{id}' already registered")));
        }
        self.persist(&entry);
        tracing::info!(
            "📋 Process registered: '{}' ({}, {})",
            entry.name,
            id,
            entry.process_type.as_str()
        );
        processes.insert(id.clone(), Arc::new(RwLock::new(Supervised::new(entry))));
        Ok(id)
    }

    fn validate(&self, entry: &ProcessEntry) -> Result<()> {
        if entry.name.trim().is_empty() {
            return Err(AutoloomError::config("process name must not be empty"));
        }
        match &entry.command {
            ProcessCommand::Shell { program, .. } if program.trim().is_empty() => {
                return Err(AutoloomError::config(format!(
                    "process '{}' has an empty command",
                    entry.name
                )));
            }
            ProcessCommand::Shell { .. } => {}
            ProcessCommand::Capability {
                task_type,
                parameters,
            } => {
                if !self.registry.contains(task_type) {
                    return Err(GraphError::UnknownTaskType {
                        task: entry.name.clone(),
                        task_type: task_type.clone(),
                    }
                    .into());
                }
                self.registry.validate_params(task_type, parameters)?;
            }
        }
        if let HealthCheck::Http { url } = &entry.health_check
            && !(url.starts_with("http://") || url.starts_with("https://"))
        {
            return Err(AutoloomError::config(format!(
                "health check url must be http(s): {url}"
            )));
        }
        Ok(())
    }

    /// Reload process definitions. Nothing restored is running yet.
    pub async fn restore(&self) -> Result<usize> {
        let Some(db) = &self.db else {
            return Ok(0);
        };
        let mut processes = self.processes.write().await;
        let mut restored = 0;
        for mut entry in db.load_processes()? {
            if processes.contains_key(&entry.process_id) {
                continue;
            }
            entry.pid = None;
            entry.status = match entry.status {
                ProcessStatus::NotStarted => ProcessStatus::NotStarted,
                _ if entry.started_at.is_none() => ProcessStatus::NotStarted,
                _ => ProcessStatus::Stopped,
            };
            processes.insert(
                entry.process_id.clone(),
                Arc::new(RwLock::new(Supervised::new(entry))),
            );
            restored += 1;
        }
        if restored > 0 {
            tracing::info!("💾 Restored {restored} process definition(s)");
        }
        Ok(restored)
    }

    // ─── Lifecycle ──────────────────────────────────────────

    /// Start a process. Resets its restart counter. No-op if already alive,
    /// an error while a stop is still in progress.
    pub async fn start(&self, process_id: &str) -> Result<()> {
        let handle = self.handle(process_id).await?;
        let mut proc = handle.write().await;
        if proc.entry.status == ProcessStatus::Stopping {
            return Err(AutoloomError::supervisor(format!(
                "process '{}' is stopping",
                proc.entry.name
            )));
        }
        proc.entry.desired_state = DesiredState::Running;
        proc.restart_at = None;
        proc.gave_up = false;
        if proc.entry.status.is_alive() {
            return Ok(());
        }
        proc.entry.restart_count = 0;
        let result = self.launch(&mut proc);
        self.persist(&proc.entry);
        result
    }

    /// Stop a process. Cancels any pending auto-restart.
    pub async fn stop(&self, process_id: &str) -> Result<()> {
        let handle = self.handle(process_id).await?;
        let (runtime, name) = {
            let mut proc = handle.write().await;
            proc.entry.desired_state = DesiredState::Stopped;
            proc.restart_at = None;
            proc.gave_up = false;
            match proc.entry.status {
                ProcessStatus::Running => {
                    proc.entry
                        .transition(ProcessStatus::Stopping)
                        .map_err(AutoloomError::supervisor)?;
                    (proc.runtime.take(), proc.entry.name.clone())
                }
                ProcessStatus::Crashed => {
                    proc.entry
                        .transition(ProcessStatus::Stopped)
                        .map_err(AutoloomError::supervisor)?;
                    self.persist(&proc.entry);
                    return Ok(());
                }
                _ => {
                    self.persist(&proc.entry);
                    return Ok(());
                }
            }
        };

        if let Some(runtime) = runtime {
            runtime
                .terminate(Duration::from_secs(self.config.grace_period_secs), &name)
                .await;
        }

        let mut proc = handle.write().await;
        proc.entry
            .transition(ProcessStatus::Stopped)
            .map_err(AutoloomError::supervisor)?;
        proc.entry.pid = None;
        proc.entry.stopped_at = Some(self.clock.now());
        proc.cpu_mark = None;
        self.persist(&proc.entry);
        tracing::info!("⏹ Stopped process '{name}'");
        Ok(())
    }

    /// Stop, then start. A manual restart does not count against `max_restarts`.
    pub async fn restart(&self, process_id: &str) -> Result<()> {
        self.stop(process_id).await?;
        self.start(process_id).await
    }

    /// Stop (if needed) and forget a process.
    pub async fn remove(&self, process_id: &str) -> Result<ProcessEntry> {
        self.stop(process_id).await?;
        let handle = self
            .processes
            .write()
            .await
            .remove(process_id)
            .ok_or_else(|| AutoloomError::not_found(format!("process '{process_id}'")))?;
        if let Some(db) = &self.db {
            db.delete_process(process_id)?;
        }
        let entry = handle.read().await.entry.clone();
        tracing::info!("🗑️ Process removed: '{}'", entry.name);
        Ok(entry)
    }

    pub async fn get(&self, process_id: &str) -> Option<ProcessEntry> {
        let handle = self.processes.read().await.get(process_id).cloned()?;
        let entry = handle.read().await.entry.clone();
        Some(entry)
    }

    /// Current status of every process, in id order.
    pub async fn list(&self) -> Vec<ProcessEntry> {
        let mut out = Vec::new();
        for handle in self.handles().await {
            out.push(handle.read().await.entry.clone());
        }
        out
    }

    /// Start every process whose desired state is running. Returns how many started.
    pub async fn start_all_enabled(&self) -> usize {
        let mut started = 0;
        for entry in self.list().await {
            if entry.desired_state != DesiredState::Running || entry.status.is_alive() {
                continue;
            }
            match self.start(&entry.process_id).await {
                Ok(()) => started += 1,
                Err(e) => tracing::warn!("⚠️ Could not start '{}': {e}", entry.name),
            }
        }
        started
    }

    /// Stop everything that is alive.
    pub async fn stop_all(&self) {
        for entry in self.list().await {
            if entry.status.is_alive() || entry.status == ProcessStatus::Crashed {
                if let Err(e) = self.stop(&entry.process_id).await {
                    tracing::warn!("⚠️ Could not stop '{}': {e}", entry.name);
                }
            }
        }
    }

    // ─── Health loop ────────────────────────────────────────

    /// One supervision pass over every process.
    pub async fn check_all(&self) -> CheckReport {
        let _guard = self.check_lock.lock().await;
        let mut report = CheckReport::default();
        for handle in self.handles().await {
            let mut proc = handle.write().await;
            let before = (
                proc.entry.status,
                proc.entry.restart_count,
                proc.restart_at.is_some(),
            );
            self.check_one(&mut proc, &mut report).await;
            report.checked += 1;
            if before
                != (
                    proc.entry.status,
                    proc.entry.restart_count,
                    proc.restart_at.is_some(),
                )
            {
                self.persist(&proc.entry);
            }
        }
        report
    }

    async fn check_one(&self, proc: &mut Supervised, report: &mut CheckReport) {
        let now = self.clock.now();
        let id = proc.entry.process_id.clone();

        if proc.entry.status == ProcessStatus::Running {
            let exited = match proc.runtime.as_mut() {
                Some(runtime) => runtime.poll_exit().await,
                None => Some("no runtime attached".to_string()),
            };
            if let Some(reason) = exited {
                self.mark_crashed(proc, reason, now).await;
                report.crashed.push(id.clone());
            }
        }

        if proc.entry.status == ProcessStatus::Running {
            if let Some(reason) = self.probe_health(&proc.entry, now).await {
                self.mark_crashed(proc, reason, now).await;
                report.crashed.push(id.clone());
            } else {
                proc.entry.last_health_check = Some(now);
            }
        }

        if proc.entry.status == ProcessStatus::Running {
            let pid = proc.runtime.as_ref().and_then(Runtime::pid);
            let (sample, mark) = resources::sample(pid, proc.cpu_mark, now);
            proc.entry.resource_sample = Some(sample);
            proc.cpu_mark = mark;

            let sustained = proc.entry.started_at.is_some_and(|started| {
                now - started >= chrono::Duration::seconds(self.config.reset_after_secs as i64)
            });
            if proc.entry.restart_count > 0 && sustained {
                tracing::info!(
                    "♻️ '{}' healthy for {}s, restart counter reset",
                    proc.entry.name,
                    self.config.reset_after_secs
                );
                proc.entry.restart_count = 0;
                report.reset.push(id.clone());
            }
        }

        if proc.entry.status == ProcessStatus::Crashed
            && proc.entry.desired_state == DesiredState::Running
            && proc.entry.auto_restart
            && !proc.gave_up
        {
            match proc.restart_at {
                None => {
                    let exhausted = proc
                        .entry
                        .max_restarts
                        .is_some_and(|max| proc.entry.restart_count >= max);
                    if exhausted {
                        proc.gave_up = true;
                        tracing::error!(
                            "❌ '{}' crashed after {} restart(s), giving up",
                            proc.entry.name,
                            proc.entry.restart_count
                        );
                        report.gave_up.push(id);
                    } else {
                        let delay = self.restart_policy.delay_chrono(proc.entry.restart_count);
                        proc.restart_at = Some(now + delay);
                        tracing::info!(
                            "🔁 Restarting '{}' in {}s (restart {})",
                            proc.entry.name,
                            delay.num_seconds(),
                            proc.entry.restart_count + 1
                        );
                    }
                }
                Some(at) if at <= now => {
                    proc.restart_at = None;
                    proc.entry.restart_count += 1;
                    // A failed launch leaves it Crashed; the next pass schedules again
                    let _ = self.launch(proc);
                    report.restarted.push(id);
                }
                Some(_) => {}
            }
        }
    }

    /// `Some(reason)` when an HTTP probe fails. Liveness checks always pass here.
    async fn probe_health(&self, entry: &ProcessEntry, now: DateTime<Utc>) -> Option<String> {
        let HealthCheck::Http { url } = &entry.health_check else {
            return None;
        };
        let in_startup = entry.started_at.is_some_and(|started| {
            now - started < chrono::Duration::seconds(self.config.startup_grace_secs as i64)
        });
        if in_startup {
            return None;
        }

        let timeout = Duration::from_secs(self.config.health_timeout_secs.max(1));
        match tokio::time::timeout(timeout, self.http.get(url).send()).await {
            Ok(Ok(resp)) if resp.status().is_success() => None,
            Ok(Ok(resp)) => Some(format!("health check returned {}", resp.status())),
            Ok(Err(e)) => Some(format!("health check failed: {e}")),
            Err(_) => Some(format!(
                "health check timed out after {}s",
                timeout.as_secs()
            )),
        }
    }

    /// Crashed/Stopped/NotStarted → Starting → Running, or Crashed on failure.
    fn launch(&self, proc: &mut Supervised) -> Result<()> {
        let now = self.clock.now();
        proc.entry
            .transition(ProcessStatus::Starting)
            .map_err(AutoloomError::supervisor)?;

        match spawn_runtime(&self.registry, &proc.entry) {
            Ok(runtime) => {
                proc.entry.pid = runtime.pid();
                proc.runtime = Some(runtime);
                proc.entry.started_at = Some(now);
                proc.entry.stopped_at = None;
                proc.entry.last_error = None;
                proc.cpu_mark = None;
                proc.entry
                    .transition(ProcessStatus::Running)
                    .map_err(AutoloomError::supervisor)?;
                tracing::info!(
                    "🚀 Started process '{}' (pid={})",
                    proc.entry.name,
                    proc.entry
                        .pid
                        .map(|p| p.to_string())
                        .unwrap_or_else(|| "task".into())
                );
                Ok(())
            }
            Err(e) => {
                proc.entry.last_error = Some(e.to_string());
                proc.entry.stopped_at = Some(now);
                let _ = proc.entry.transition(ProcessStatus::Crashed);
                tracing::error!("❌ Failed to start '{}': {e}", proc.entry.name);
                Err(e)
            }
        }
    }

    async fn mark_crashed(&self, proc: &mut Supervised, reason: String, now: DateTime<Utc>) {
        if let Some(runtime) = proc.runtime.take() {
            runtime.kill().await;
        }
        if let Err(e) = proc.entry.transition(ProcessStatus::Crashed) {
            tracing::warn!("⚠️ {e}");
        }
        proc.entry.pid = None;
        proc.entry.stopped_at = Some(now);
        proc.cpu_mark = None;
        tracing::warn!("💥 Process '{}' crashed: {reason}", proc.entry.name);
        proc.entry.last_error = Some(reason);
    }

    async fn handle(&self, process_id: &str) -> Result<ProcessHandle> {
        self.processes
            .read()
            .await
            .get(process_id)
            .cloned()
            .ok_or_else(|| AutoloomError::not_found(format!("process '{process_id}'")))
    }

    async fn handles(&self) -> Vec<ProcessHandle> {
        self.processes.read().await.values().cloned().collect()
    }

    fn persist(&self, entry: &ProcessEntry) {
        if let Some(db) = &self.db
            && let Err(e) = db.save_process(entry)
        {
            tracing::warn!("⚠️ Failed to save process '{}': {e}", entry.process_id);
        }
    }

    pub fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);
    }
}

fn spawn_runtime(registry: &TaskRegistry, entry: &ProcessEntry) -> Result<Runtime> {
    match &entry.command {
        ProcessCommand::Shell {
            program,
            args,
            working_dir,
            env,
        } => {
            let mut command = tokio::process::Command::new(program);
            command
                .args(args)
                .envs(env)
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .kill_on_drop(true);
            if let Some(dir) = working_dir {
                command.current_dir(dir);
            }
            #[cfg(unix)]
            command.process_group(0);
            let child = command.spawn().map_err(|e| {
                AutoloomError::supervisor(format!("failed to spawn '{program}': {e}"))
            })?;
            Ok(Runtime::Child(child))
        }
        ProcessCommand::Capability {
            task_type,
            parameters,
        } => {
            let capability = registry.get(task_type).ok_or_else(|| {
                AutoloomError::supervisor(format!("no capability registered for '{task_type}'"))
            })?;
            let parameters = parameters.clone();
            Ok(Runtime::Task(tokio::spawn(async move {
                capability.invoke(&parameters).await
            })))
        }
    }
}

/// Spawn the supervision loop. On shutdown every live process is stopped.
pub fn spawn_supervisor(supervisor: Arc<ProcessSupervisor>) -> JoinHandle<()> {
    let mut shutdown = supervisor.shutdown_tx.subscribe();
    tokio::spawn(async move {
        let every = Duration::from_millis(supervisor.config.check_interval_ms.max(1));
        tracing::info!("🛡️ Supervisor started (check every {}ms)", every.as_millis());

        let mut interval = tokio::time::interval(every);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            if *shutdown.borrow_and_update() {
                break;
            }
            tokio::select! {
                _ = interval.tick() => {
                    supervisor.check_all().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        supervisor.stop_all().await;
        tracing::info!("🛡️ Supervisor stopped");
    })
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use autoloom_core::clock::ManualClock;
    use autoloom_core::traits::FnCapability;
    use autoloom_core::types::{Parameters, ProcessType};
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap()
    }

    fn registry() -> TaskRegistry {
        let registry = TaskRegistry::with_builtins();
        registry
            .register(
                "crash",
                Arc::new(FnCapability::new(|_p| async {
                    Err(AutoloomError::execution("worker died"))
                })),
            )
            .unwrap();
        registry
            .register(
                "forever",
                Arc::new(FnCapability::new(|_p| async {
                    std::future::pending::<()>().await;
                    Ok(serde_json::Value::Null)
                })),
            )
            .unwrap();
        registry
    }

    fn supervisor(clock: &ManualClock, registry: TaskRegistry) -> ProcessSupervisor {
        ProcessSupervisor::new(
            SupervisorConfig::default(),
            Arc::new(registry),
            Arc::new(clock.clone()),
        )
    }

    fn capability_process(name: &str, task_type: &str) -> ProcessEntry {
        ProcessEntry::new(
            name,
            ProcessCommand::capability(task_type, Parameters::new()),
            ProcessType::Worker,
        )
    }

    /// Let spawned capability tasks run to completion.
    async fn let_tasks_finish() {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    #[tokio::test]
    async fn test_crash_loop_restarts_with_backoff_then_gives_up() {
        let clock = ManualClock::new(t0());
        let sup = supervisor(&clock, registry());
        let id = sup
            .register(capability_process("flaky", "crash").with_max_restarts(Some(3)))
            .await
            .unwrap();
        sup.start(&id).await.unwrap();

        let mut restart_times = Vec::new();
        for _ in 0..200 {
            let_tasks_finish().await;
            let report = sup.check_all().await;
            if !report.restarted.is_empty() {
                restart_times.push((clock.now() - t0()).num_seconds());
            }
            if !report.gave_up.is_empty() {
                break;
            }
            // Detect the next crash at the instant of the restart
            if report.restarted.is_empty() {
                clock.advance_secs(1);
            }
        }

        // base 5s: 5, then +10, then +20
        assert_eq!(restart_times, vec![5, 15, 35]);
        let entry = sup.get(&id).await.unwrap();
        assert_eq!(entry.status, ProcessStatus::Crashed);
        assert_eq!(entry.restart_count, 3);
        assert!(entry.last_error.unwrap().contains("worker died"));

        clock.advance_secs(3600);
        assert!(sup.check_all().await.restarted.is_empty());
    }

    #[tokio::test]
    async fn test_stop_cancels_pending_restart() {
        let clock = ManualClock::new(t0());
        let sup = supervisor(&clock, registry());
        let id = sup.register(capability_process("flaky", "crash")).await.unwrap();
        sup.start(&id).await.unwrap();
        let_tasks_finish().await;
        assert_eq!(sup.check_all().await.crashed, vec![id.clone()]);

        sup.stop(&id).await.unwrap();
        clock.advance_secs(60);
        let report = sup.check_all().await;
        assert!(report.restarted.is_empty());
        let entry = sup.get(&id).await.unwrap();
        assert_eq!(entry.status, ProcessStatus::Stopped);
        assert_eq!(entry.desired_state, DesiredState::Stopped);
    }

    #[tokio::test]
    async fn test_restart_counter_resets_after_sustained_run() {
        let clock = ManualClock::new(t0());
        let calls = Arc::new(AtomicUsize::new(0));
        let registry = TaskRegistry::new();
        let counter = calls.clone();
        registry
            .register(
                "once_flaky",
                Arc::new(FnCapability::new(move |_p| {
                    let first = counter.fetch_add(1, Ordering::SeqCst) == 0;
                    async move {
                        if first {
                            return Err(AutoloomError::execution("cold start"));
                        }
                        std::future::pending::<()>().await;
                        Ok(serde_json::Value::Null)
                    }
                })),
            )
            .unwrap();
        let sup = supervisor(&clock, registry);
        let id = sup.register(capability_process("svc", "once_flaky")).await.unwrap();
        sup.start(&id).await.unwrap();
        let_tasks_finish().await;
        sup.check_all().await;

        clock.advance_secs(5);
        assert_eq!(sup.check_all().await.restarted, vec![id.clone()]);
        assert_eq!(sup.get(&id).await.unwrap().restart_count, 1);

        clock.advance_secs(599);
        sup.check_all().await;
        assert_eq!(sup.get(&id).await.unwrap().restart_count, 1);

        clock.advance_secs(1);
        assert_eq!(sup.check_all().await.reset, vec![id.clone()]);
        let entry = sup.get(&id).await.unwrap();
        assert_eq!(entry.restart_count, 0);
        assert_eq!(entry.status, ProcessStatus::Running);
        assert!(entry.resource_sample.is_some());

        sup.stop(&id).await.unwrap();
    }

    #[tokio::test]
    async fn test_no_auto_restart_stays_crashed() {
        let clock = ManualClock::new(t0());
        let sup = supervisor(&clock, registry());
        let id = sup
            .register(capability_process("flaky", "crash").with_auto_restart(false))
            .await
            .unwrap();
        sup.start(&id).await.unwrap();
        let_tasks_finish().await;
        sup.check_all().await;
        clock.advance_secs(600);
        assert!(sup.check_all().await.restarted.is_empty());
        assert_eq!(sup.get(&id).await.unwrap().status, ProcessStatus::Crashed);
    }

    #[tokio::test]
    async fn test_failed_health_probe_crashes_process() {
        let clock = ManualClock::new(t0());
        let sup = supervisor(&clock, registry());
        let entry = capability_process("api", "forever")
            .with_auto_restart(false)
            .with_health_check(HealthCheck::Http {
                url: "http://127.0.0.1:1/health".into(),
            });
        let id = sup.register(entry).await.unwrap();
        sup.start(&id).await.unwrap();

        // Within startup grace: not probed
        assert!(sup.check_all().await.crashed.is_empty());

        clock.advance_secs(5);
        assert_eq!(sup.check_all().await.crashed, vec![id.clone()]);
        let entry = sup.get(&id).await.unwrap();
        assert_eq!(entry.status, ProcessStatus::Crashed);
        assert!(entry.last_error.unwrap().contains("health check"));
    }

    #[tokio::test]
    async fn test_register_validation() {
        let clock = ManualClock::new(t0());
        let sup = supervisor(&clock, registry());
        assert!(matches!(
            sup.register(ProcessEntry::worker("w", "   ")).await,
            Err(AutoloomError::Config(_))
        ));
        assert!(matches!(
            sup.register(capability_process("c", "missing")).await,
            Err(AutoloomError::Graph(GraphError::UnknownTaskType { .. }))
        ));
        let bad_url = capability_process("c", "forever").with_health_check(HealthCheck::Http {
            url: "localhost:80".into(),
        });
        assert!(matches!(sup.register(bad_url).await, Err(AutoloomError::Config(_))));
        assert!(sup.list().await.is_empty());
    }

    #[tokio::test]
    async fn test_remove_stops_first() {
        let clock = ManualClock::new(t0());
        let db = Arc::new(OrchestratorDb::open_in_memory().unwrap());
        let sup = supervisor(&clock, registry()).with_db(db.clone());
        let id = sup.register(capability_process("svc", "forever")).await.unwrap();
        sup.start(&id).await.unwrap();
        assert_eq!(db.load_processes().unwrap()[0].status, ProcessStatus::Running);

        let removed = sup.remove(&id).await.unwrap();
        assert_eq!(removed.status, ProcessStatus::Stopped);
        assert!(sup.get(&id).await.is_none());
        assert!(db.load_processes().unwrap().is_empty());
        assert!(matches!(sup.start(&id).await, Err(AutoloomError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_restore_and_start_all_enabled() {
        let clock = ManualClock::new(t0());
        let db = Arc::new(OrchestratorDb::open_in_memory().unwrap());
        let first = supervisor(&clock, registry()).with_db(db.clone());
        let running = first.register(capability_process("a", "forever")).await.unwrap();
        let idle = first.register(capability_process("b", "forever")).await.unwrap();
        first.start(&running).await.unwrap();

        let second = supervisor(&clock, registry()).with_db(db);
        assert_eq!(second.restore().await.unwrap(), 2);
        assert_eq!(second.get(&running).await.unwrap().status, ProcessStatus::Stopped);
        assert_eq!(second.get(&idle).await.unwrap().status, ProcessStatus::NotStarted);

        assert_eq!(second.start_all_enabled().await, 1);
        assert_eq!(second.get(&running).await.unwrap().status, ProcessStatus::Running);
        second.stop_all().await;
        first.stop_all().await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_shell_process_start_and_graceful_stop() {
        let clock = ManualClock::new(t0());
        let sup = supervisor(&clock, registry());
        let id = sup
            .register(ProcessEntry::background_job("sleeper", "sleep 30"))
            .await
            .unwrap();
        sup.start(&id).await.unwrap();
        let entry = sup.get(&id).await.unwrap();
        assert_eq!(entry.status, ProcessStatus::Running);
        assert!(entry.pid.is_some());
        assert!(sup.check_all().await.crashed.is_empty());

        let started = std::time::Instant::now();
        sup.stop(&id).await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(5));
        let entry = sup.get(&id).await.unwrap();
        assert_eq!(entry.status, ProcessStatus::Stopped);
        assert_eq!(entry.pid, None);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_shell_pipeline_runs_and_stop_reaches_whole_group() {
        let clock = ManualClock::new(t0());
        let sup = supervisor(&clock, registry());
        let id = sup
            .register(ProcessEntry::worker(
                "piped",
                "echo 'a  b' | grep -q 'a  b' && sleep 30",
            ))
            .await
            .unwrap();
        sup.start(&id).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(sup.check_all().await.crashed.is_empty());
        let pid = sup.get(&id).await.unwrap().pid.unwrap();

        sup.stop(&id).await.unwrap();
        let group_alive = move || async move {
            tokio::process::Command::new("kill")
                .args(["-0", "--", &format!("-{pid}")])
                .output()
                .await
                .is_ok_and(|out| out.status.success())
        };
        let deadline = std::time::Instant::now() + Duration::from_secs(3);
        while group_alive().await && std::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(!group_alive().await, "sleep outlived its shell");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_start_while_stopping_is_rejected() {
        let clock = ManualClock::new(t0());
        let config = SupervisorConfig {
            grace_period_secs: 1,
            ..SupervisorConfig::default()
        };
        let sup = Arc::new(ProcessSupervisor::new(
            config,
            Arc::new(registry()),
            Arc::new(clock.clone()),
        ));
        let id = sup
            .register(ProcessEntry::worker("stubborn", "trap '' TERM; sleep 30"))
            .await
            .unwrap();
        sup.start(&id).await.unwrap();
        // Let the shell install its trap
        tokio::time::sleep(Duration::from_millis(200)).await;

        let stopping = {
            let sup = sup.clone();
            let id = id.clone();
            tokio::spawn(async move { sup.stop(&id).await })
        };
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while sup.get(&id).await.unwrap().status != ProcessStatus::Stopping {
            assert!(std::time::Instant::now() < deadline, "never saw Stopping");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        assert!(matches!(sup.start(&id).await, Err(AutoloomError::Supervisor(_))));
        stopping.await.unwrap().unwrap();
        let entry = sup.get(&id).await.unwrap();
        assert_eq!(entry.status, ProcessStatus::Stopped);
        assert_eq!(entry.desired_state, DesiredState::Stopped);

        sup.start(&id).await.unwrap();
        assert_eq!(sup.get(&id).await.unwrap().status, ProcessStatus::Running);
        sup.stop_all().await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_spawn_failure_is_surfaced() {
        let clock = ManualClock::new(t0());
        let sup = supervisor(&clock, registry());
        let id = sup
            .register(
                ProcessEntry::new(
                    "ghost",
                    ProcessCommand::Shell {
                        program: "/nonexistent/autoloom-worker".into(),
                        args: Vec::new(),
                        working_dir: None,
                        env: BTreeMap::new(),
                    },
                    ProcessType::Worker,
                )
                .with_auto_restart(false),
            )
            .await
            .unwrap();
        assert!(matches!(sup.start(&id).await, Err(AutoloomError::Supervisor(_))));
        let entry = sup.get(&id).await.unwrap();
        assert_eq!(entry.status, ProcessStatus::Crashed);
        assert!(entry.last_error.is_some());
    }
}
