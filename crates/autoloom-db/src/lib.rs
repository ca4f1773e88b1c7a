//! SQLite-backed persistence for workflows, jobs, execution history and
//! supervised processes. Survives restarts; every write is an upsert keyed by
//! the entity's string id.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use autoloom_core::error::{AutoloomError, Result};
use autoloom_core::types::{
    ExecutionOutcome, ExecutionRecord, Job, JobState, ProcessEntry, TaskSpec, TriggerSpec,
    Workflow, WorkflowStatus,
};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension, Row};

/// Persistence store shared by the engine, the supervisor and the orchestrator.
pub struct OrchestratorDb {
    conn: Mutex<Connection>,
}

impl OrchestratorDb {
    /// Open or create the database file.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path).map_err(|e| db_err("DB open", e))?;
        tracing::debug!("💾 Opened database at {}", path.display());
        Self::with_connection(conn)
    }

    /// Fresh database that lives as long as this value.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(|e| db_err("DB open", e))?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.migrate()?;
        Ok(db)
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn migrate(&self) -> Result<()> {
        self.lock()
            .execute_batch(
                "
            CREATE TABLE IF NOT EXISTS workflows (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                description TEXT NOT NULL DEFAULT '',
                tasks TEXT NOT NULL,              -- JSON array of task specs
                status TEXT NOT NULL DEFAULT 'active',
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS jobs (
                id TEXT PRIMARY KEY,
                workflow_id TEXT,
                name TEXT NOT NULL,
                task_type TEXT NOT NULL,
                parameters TEXT NOT NULL,         -- JSON object
                trigger_kind TEXT NOT NULL,       -- 'cron', 'interval', 'once', 'on_dependency'
                trigger_data TEXT NOT NULL,       -- JSON trigger spec
                depends_on TEXT NOT NULL DEFAULT '[]',
                state TEXT NOT NULL DEFAULT 'scheduled',
                next_fire_time TEXT,
                cycle_fire_time TEXT,
                last_run TEXT,
                last_result TEXT,
                retry_count INTEGER NOT NULL DEFAULT 0,
                max_retries INTEGER NOT NULL DEFAULT 0,
                timeout_secs INTEGER NOT NULL,
                enabled INTEGER NOT NULL DEFAULT 1,
                run_count INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL
            );

            -- Append-only: rows are never updated
            CREATE TABLE IF NOT EXISTS execution_records (
                id TEXT PRIMARY KEY,
                job_id TEXT NOT NULL,
                attempt_number INTEGER NOT NULL,
                started_at TEXT NOT NULL,
                finished_at TEXT NOT NULL,
                outcome TEXT NOT NULL,            -- JSON execution outcome
                manual INTEGER NOT NULL DEFAULT 0
            );
            CREATE INDEX IF NOT EXISTS idx_jobs_workflow ON jobs (workflow_id);
            CREATE INDEX IF NOT EXISTS idx_records_job_started
                ON execution_records (job_id, started_at);

            CREATE TABLE IF NOT EXISTS processes (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                status TEXT NOT NULL,
                data TEXT NOT NULL,               -- JSON process entry
                created_at TEXT NOT NULL
            );
         ",
            )
            .map_err(|e| db_err("Migration", e))
    }

    // ─── Workflows ──────────────────────────────────────────

    /// Save a workflow and its jobs in one transaction: all rows or none.
    pub fn save_workflow_with_jobs(&self, workflow: &Workflow, jobs: &[Job]) -> Result<()> {
        let mut conn = self.lock();
        let tx = conn.transaction().map_err(|e| db_err("Begin", e))?;
        upsert_workflow(&tx, workflow)?;
        for job in jobs {
            upsert_job(&tx, job)?;
        }
        tx.commit().map_err(|e| db_err("Commit", e))
    }

    pub fn save_workflow(&self, workflow: &Workflow) -> Result<()> {
        upsert_workflow(&self.lock(), workflow)
    }

    pub fn load_workflows(&self) -> Result<Vec<Workflow>> {
        let conn = self.lock();
        let mut stmt = conn
            .prepare(
                "SELECT id, name, description, tasks, status, created_at
                 FROM workflows ORDER BY created_at",
            )
            .map_err(|e| db_err("Load workflows", e))?;
        let rows = stmt
            .query_map([], workflow_from_row)
            .map_err(|e| db_err("Load workflows", e))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| db_err("Load workflows", e))
    }

    /// Delete a workflow; its jobs go with it.
    pub fn delete_workflow(&self, id: &str) -> Result<()> {
        let mut conn = self.lock();
        let tx = conn.transaction().map_err(|e| db_err("Begin", e))?;
        tx.execute("DELETE FROM jobs WHERE workflow_id = ?1", [id])
            .map_err(|e| db_err("Delete jobs", e))?;
        tx.execute("DELETE FROM workflows WHERE id = ?1", [id])
            .map_err(|e| db_err("Delete workflow", e))?;
        tx.commit().map_err(|e| db_err("Commit", e))
    }

    // ─── Jobs ───────────────────────────────────────────────

    pub fn save_job(&self, job: &Job) -> Result<()> {
        upsert_job(&self.lock(), job)
    }

    pub fn load_jobs(&self) -> Result<Vec<Job>> {
        let conn = self.lock();
        let mut stmt = conn
            .prepare(
                "SELECT id, workflow_id, name, task_type, parameters, trigger_data, depends_on,
                        state, next_fire_time, cycle_fire_time, last_run, last_result,
                        retry_count, max_retries, timeout_secs, enabled, run_count, created_at
                 FROM jobs ORDER BY created_at, id",
            )
            .map_err(|e| db_err("Load jobs", e))?;
        let rows = stmt
            .query_map([], job_from_row)
            .map_err(|e| db_err("Load jobs", e))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| db_err("Load jobs", e))
    }

    pub fn delete_job(&self, id: &str) -> Result<()> {
        self.lock()
            .execute("DELETE FROM jobs WHERE id = ?1", [id])
            .map_err(|e| db_err("Delete job", e))?;
        Ok(())
    }

    // ─── Execution history ──────────────────────────────────

    pub fn append_record(&self, record: &ExecutionRecord) -> Result<()> {
        self.lock()
            .execute(
                "INSERT INTO execution_records
                 (id, job_id, attempt_number, started_at, finished_at, outcome, manual)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                rusqlite::params![
                    record.record_id,
                    record.job_id,
                    record.attempt_number,
                    ts(record.started_at),
                    ts(record.finished_at),
                    serde_json::to_string(&record.outcome)?,
                    record.manual as i32,
                ],
            )
            .map_err(|e| db_err("Append record", e))?;
        Ok(())
    }

    /// Records of one job started within `[from, to]`, oldest first.
    pub fn records_for(
        &self,
        job_id: &str,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> Result<Vec<ExecutionRecord>> {
        let from = from.map(ts).unwrap_or_default();
        let to = to.map(ts).unwrap_or_else(|| "9999".into());
        let conn = self.lock();
        let mut stmt = conn
            .prepare(
                "SELECT id, job_id, attempt_number, started_at, finished_at, outcome, manual
                 FROM execution_records
                 WHERE job_id = ?1 AND started_at >= ?2 AND started_at <= ?3
                 ORDER BY started_at, id",
            )
            .map_err(|e| db_err("Load records", e))?;
        let rows = stmt
            .query_map(rusqlite::params![job_id, from, to], record_from_row)
            .map_err(|e| db_err("Load records", e))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| db_err("Load records", e))
    }

    /// Latest `limit` records of one job, oldest first.
    pub fn recent_records(&self, job_id: &str, limit: usize) -> Result<Vec<ExecutionRecord>> {
        let conn = self.lock();
        let mut stmt = conn
            .prepare(
                "SELECT id, job_id, attempt_number, started_at, finished_at, outcome, manual
                 FROM execution_records WHERE job_id = ?1
                 ORDER BY started_at DESC, id DESC LIMIT ?2",
            )
            .map_err(|e| db_err("Load records", e))?;
        let rows = stmt
            .query_map(rusqlite::params![job_id, limit as i64], record_from_row)
            .map_err(|e| db_err("Load records", e))?;
        let mut records = rows
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| db_err("Load records", e))?;
        records.reverse();
        Ok(records)
    }

    // ─── Processes ──────────────────────────────────────────

    pub fn save_process(&self, entry: &ProcessEntry) -> Result<()> {
        self.lock()
            .execute(
                "INSERT OR REPLACE INTO processes (id, name, status, data, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                rusqlite::params![
                    entry.process_id,
                    entry.name,
                    entry.status.as_str(),
                    serde_json::to_string(entry)?,
                    ts(entry.created_at),
                ],
            )
            .map_err(|e| db_err("Save process", e))?;
        Ok(())
    }

    pub fn load_processes(&self) -> Result<Vec<ProcessEntry>> {
        let conn = self.lock();
        let mut stmt = conn
            .prepare("SELECT data FROM processes ORDER BY created_at, id")
            .map_err(|e| db_err("Load processes", e))?;
        let rows = stmt
            .query_map([], |row| json_col::<ProcessEntry>(row, 0))
            .map_err(|e| db_err("Load processes", e))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| db_err("Load processes", e))
    }

    pub fn delete_process(&self, id: &str) -> Result<()> {
        self.lock()
            .execute("DELETE FROM processes WHERE id = ?1", [id])
            .map_err(|e| db_err("Delete process", e))?;
        Ok(())
    }

    pub fn job_exists(&self, id: &str) -> Result<bool> {
        self.lock()
            .query_row("SELECT 1 FROM jobs WHERE id = ?1", [id], |_| Ok(()))
            .optional()
            .map(|row| row.is_some())
            .map_err(|e| db_err("Lookup job", e))
    }
}

fn db_err(context: &str, e: rusqlite::Error) -> AutoloomError {
    AutoloomError::database(format!("{context}: {e}"))
}

/// Fixed-width UTC timestamps so text comparison matches time order.
fn ts(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|d| d.with_timezone(&Utc))
}

fn ts_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    Ok(row
        .get::<_, Option<String>>(idx)?
        .as_deref()
        .and_then(parse_ts))
}

fn json_col<T: serde::de::DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn upsert_workflow(conn: &Connection, workflow: &Workflow) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO workflows (id, name, description, tasks, status, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        rusqlite::params![
            workflow.id,
            workflow.name,
            workflow.description,
            serde_json::to_string(&workflow.tasks)?,
            workflow.status.as_str(),
            ts(workflow.created_at),
        ],
    )
    .map_err(|e| db_err("Save workflow", e))?;
    Ok(())
}

fn upsert_job(conn: &Connection, job: &Job) -> Result<()> {
    let last_result = job
        .last_result
        .as_ref()
        .map(serde_json::to_string)
        .transpose()?;
    conn.execute(
        "INSERT OR REPLACE INTO jobs
         (id, workflow_id, name, task_type, parameters, trigger_kind, trigger_data, depends_on,
          state, next_fire_time, cycle_fire_time, last_run, last_result, retry_count,
          max_retries, timeout_secs, enabled, run_count, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19)",
        rusqlite::params![
            job.job_id,
            job.workflow_id,
            job.name,
            job.task_type,
            serde_json::to_string(&job.parameters)?,
            job.trigger.kind(),
            serde_json::to_string(&job.trigger)?,
            serde_json::to_string(&job.depends_on)?,
            job.state.as_str(),
            job.next_fire_time.map(ts),
            job.cycle_fire_time.map(ts),
            job.last_run.map(ts),
            last_result,
            job.retry_count,
            job.max_retries,
            job.timeout_secs as i64,
            job.enabled as i32,
            job.run_count,
            ts(job.created_at),
        ],
    )
    .map_err(|e| db_err("Save job", e))?;
    Ok(())
}

fn workflow_from_row(row: &Row<'_>) -> rusqlite::Result<Workflow> {
    let status: String = row.get(4)?;
    Ok(Workflow {
        id: row.get(0)?,
        name: row.get(1)?,
        description: row.get(2)?,
        tasks: json_col::<Vec<TaskSpec>>(row, 3)?,
        status: WorkflowStatus::parse(&status),
        created_at: ts_col(row, 5)?.unwrap_or_else(Utc::now),
    })
}

fn job_from_row(row: &Row<'_>) -> rusqlite::Result<Job> {
    let state: String = row.get(7)?;
    let last_result: Option<String> = row.get(11)?;
    Ok(Job {
        job_id: row.get(0)?,
        workflow_id: row.get(1)?,
        name: row.get(2)?,
        task_type: row.get(3)?,
        parameters: json_col(row, 4)?,
        trigger: json_col::<TriggerSpec>(row, 5)?,
        depends_on: json_col(row, 6)?,
        state: JobState::parse(&state),
        next_fire_time: ts_col(row, 8)?,
        cycle_fire_time: ts_col(row, 9)?,
        last_run: ts_col(row, 10)?,
        last_result: last_result.and_then(|s| serde_json::from_str::<ExecutionOutcome>(&s).ok()),
        retry_count: row.get(12)?,
        max_retries: row.get(13)?,
        timeout_secs: row.get::<_, i64>(14)? as u64,
        enabled: row.get::<_, i32>(15)? != 0,
        run_count: row.get(16)?,
        created_at: ts_col(row, 17)?.unwrap_or_else(Utc::now),
    })
}

fn record_from_row(row: &Row<'_>) -> rusqlite::Result<ExecutionRecord> {
    Ok(ExecutionRecord {
        record_id: row.get(0)?,
        job_id: row.get(1)?,
        attempt_number: row.get(2)?,
        started_at: ts_col(row, 3)?.unwrap_or_else(Utc::now),
        finished_at: ts_col(row, 4)?.unwrap_or_else(Utc::now),
        outcome: json_col(row, 5)?,
        manual: row.get::<_, i32>(6)? != 0,
    })
}
