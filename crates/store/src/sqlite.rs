//! `SQLite`-backed `PrimitiveStore`/`JobStore`, selected by `loom-cli`
//! config for durable single-node deployments.
//!
//! Follows the same pattern as the workflow event log this project grew
//! out of: every operation opens its own connection inside
//! `spawn_blocking`, `SQLite`'s WAL mode handles concurrent access, and
//! schema migration runs once at construction.

use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use loom_core::model::{
    Agent, AgentTool, Job, JobStatus, JobStep, Provider, Tool, ToolType, WasmModule, Workflow,
    WorkflowStep,
};
use rusqlite::{params, Connection, OptionalExtension};
use tokio::task;
use uuid::Uuid;

use crate::error::{StoreError, StoreResult};
use crate::{JobStore, PrimitiveStore};

fn backend_err(err: impl std::error::Error + Send + Sync + 'static) -> StoreError {
    StoreError::Backend(anyhow::Error::new(err))
}

fn parse_uuid(s: &str) -> StoreResult<Uuid> {
    Uuid::parse_str(s).map_err(|e| StoreError::Backend(anyhow::Error::new(e)))
}

fn parse_dt(s: &str) -> StoreResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::Backend(anyhow::Error::new(e)))
}

fn parse_json(s: &str) -> StoreResult<serde_json::Value> {
    serde_json::from_str(s).map_err(|e| StoreError::Backend(anyhow::Error::new(e)))
}

fn step_type_str(t: loom_core::model::StepType) -> &'static str {
    match t {
        loom_core::model::StepType::Agent => "agent",
        loom_core::model::StepType::WasmModule => "wasm_module",
    }
}

fn tool_type_str(t: ToolType) -> &'static str {
    match t {
        ToolType::Memory => "memory",
        ToolType::Filesystem => "filesystem",
        ToolType::Http => "http",
        ToolType::Database => "database",
        ToolType::Bash => "bash",
    }
}

fn parse_tool_type(s: &str) -> StoreResult<ToolType> {
    Ok(match s {
        "memory" => ToolType::Memory,
        "filesystem" => ToolType::Filesystem,
        "http" => ToolType::Http,
        "database" => ToolType::Database,
        "bash" => ToolType::Bash,
        other => {
            return Err(StoreError::Backend(anyhow::anyhow!(
                "unknown tool_type '{other}' in database"
            )))
        }
    })
}

fn job_status_str(s: JobStatus) -> &'static str {
    match s {
        JobStatus::Queued => "queued",
        JobStatus::Running => "running",
        JobStatus::Completed => "completed",
        JobStatus::Failed => "failed",
        JobStatus::Cancelled => "cancelled",
    }
}

fn parse_job_status(s: &str) -> StoreResult<JobStatus> {
    Ok(match s {
        "queued" => JobStatus::Queued,
        "running" => JobStatus::Running,
        "completed" => JobStatus::Completed,
        "failed" => JobStatus::Failed,
        "cancelled" => JobStatus::Cancelled,
        other => {
            return Err(StoreError::Backend(anyhow::anyhow!(
                "unknown job status '{other}' in database"
            )))
        }
    })
}

/// Shared schema/connection handling for the two `SQLite`-backed
/// stores. Both [`SqlitePrimitiveStore`] and [`SqliteJobStore`] may
/// point at the same file; each opens independent connections per call.
#[derive(Debug, Clone)]
pub struct SqliteHandle {
    db_path: PathBuf,
}

impl SqliteHandle {
    /// Open (creating if needed) a database at `path`, or `:memory:` for
    /// an ephemeral shared-cache database, and run schema migration.
    pub async fn open<P: Into<PathBuf>>(path: P) -> StoreResult<Self> {
        let mut db_path = path.into();
        if db_path.to_str() == Some(":memory:") {
            db_path = PathBuf::from("file::memory:?cache=shared");
        }
        let handle = Self { db_path };
        handle.migrate().await?;
        Ok(handle)
    }

    fn connect(&self) -> StoreResult<Connection> {
        let conn = Connection::open(&self.db_path).map_err(backend_err)?;
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "foreign_keys", "ON").ok();
        Ok(conn)
    }

    async fn migrate(&self) -> StoreResult<()> {
        let db_path = self.db_path.clone();
        task::spawn_blocking(move || -> StoreResult<()> {
            let conn = Connection::open(&db_path).map_err(backend_err)?;
            conn.pragma_update(None, "journal_mode", "WAL").ok();
            conn.execute_batch(
                r"
                CREATE TABLE IF NOT EXISTS providers (
                    id TEXT PRIMARY KEY,
                    name TEXT NOT NULL,
                    api_base_url TEXT NOT NULL,
                    api_key TEXT NOT NULL,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );
                CREATE TABLE IF NOT EXISTS agents (
                    id TEXT PRIMARY KEY,
                    name TEXT NOT NULL,
                    description TEXT,
                    provider_id TEXT NOT NULL,
                    model_id TEXT NOT NULL,
                    system_prompt TEXT,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );
                CREATE TABLE IF NOT EXISTS tools (
                    id TEXT PRIMARY KEY,
                    name TEXT NOT NULL,
                    description TEXT NOT NULL,
                    tool_type TEXT NOT NULL,
                    metadata TEXT NOT NULL,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );
                CREATE TABLE IF NOT EXISTS agent_tools (
                    agent_id TEXT NOT NULL,
                    tool_id TEXT NOT NULL,
                    PRIMARY KEY (agent_id, tool_id)
                );
                CREATE TABLE IF NOT EXISTS workflows (
                    id TEXT PRIMARY KEY,
                    name TEXT NOT NULL,
                    description TEXT,
                    is_async INTEGER NOT NULL,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );
                CREATE TABLE IF NOT EXISTS workflow_steps (
                    id TEXT PRIMARY KEY,
                    workflow_id TEXT NOT NULL,
                    step_order INTEGER NOT NULL,
                    step_type TEXT NOT NULL,
                    agent_id TEXT,
                    wasm_module_id TEXT,
                    config TEXT NOT NULL,
                    created_at TEXT NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_workflow_steps_workflow
                    ON workflow_steps(workflow_id, step_order);
                CREATE TABLE IF NOT EXISTS wasm_modules (
                    id TEXT PRIMARY KEY,
                    name TEXT NOT NULL,
                    description TEXT,
                    module_bytes BLOB NOT NULL,
                    config TEXT NOT NULL,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );
                CREATE TABLE IF NOT EXISTS settings (
                    key TEXT PRIMARY KEY,
                    value TEXT NOT NULL
                );
                CREATE TABLE IF NOT EXISTS jobs (
                    id TEXT PRIMARY KEY,
                    workflow_id TEXT,
                    wasm_module_id TEXT,
                    status TEXT NOT NULL,
                    input_data TEXT NOT NULL,
                    output_data TEXT NOT NULL,
                    working_dir TEXT,
                    error_message TEXT,
                    created_at TEXT NOT NULL,
                    started_at TEXT,
                    completed_at TEXT
                );
                CREATE INDEX IF NOT EXISTS idx_jobs_status_created
                    ON jobs(status, created_at);
                CREATE TABLE IF NOT EXISTS job_steps (
                    id TEXT PRIMARY KEY,
                    job_id TEXT NOT NULL,
                    workflow_step_id TEXT NOT NULL,
                    step_order INTEGER NOT NULL,
                    status TEXT NOT NULL,
                    input_data TEXT NOT NULL,
                    output_data TEXT NOT NULL,
                    started_at TEXT,
                    completed_at TEXT,
                    error_message TEXT
                );
                CREATE INDEX IF NOT EXISTS idx_job_steps_job
                    ON job_steps(job_id, step_order);
                ",
            )
            .map_err(backend_err)?;
            Ok(())
        })
        .await
        .map_err(|e| StoreError::Backend(anyhow::Error::new(e)))?
    }
}

/// `SQLite`-backed [`PrimitiveStore`].
#[derive(Debug, Clone)]
pub struct SqlitePrimitiveStore {
    handle: SqliteHandle,
}

impl SqlitePrimitiveStore {
    #[must_use]
    pub fn new(handle: SqliteHandle) -> Self {
        Self { handle }
    }
}

#[async_trait]
impl PrimitiveStore for SqlitePrimitiveStore {
    async fn get_provider(&self, id: Uuid) -> StoreResult<Provider> {
        let handle = self.handle.clone();
        task::spawn_blocking(move || -> StoreResult<Provider> {
            let conn = handle.connect()?;
            conn.query_row(
                "SELECT id, name, api_base_url, api_key, created_at, updated_at
                 FROM providers WHERE id = ?1",
                params![id.to_string()],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, String>(5)?,
                    ))
                },
            )
            .optional()
            .map_err(backend_err)?
            .ok_or_else(|| StoreError::not_found("provider", id))
            .and_then(|(id, name, api_base_url, api_key, created_at, updated_at)| {
                Ok(Provider {
                    id: parse_uuid(&id)?,
                    name,
                    api_base_url,
                    api_key,
                    created_at: parse_dt(&created_at)?,
                    updated_at: parse_dt(&updated_at)?,
                })
            })
        })
        .await
        .map_err(|e| StoreError::Backend(anyhow::Error::new(e)))?
    }

    async fn get_agent(&self, id: Uuid) -> StoreResult<Agent> {
        let handle = self.handle.clone();
        task::spawn_blocking(move || -> StoreResult<Agent> {
            let conn = handle.connect()?;
            conn.query_row(
                "SELECT id, name, description, provider_id, model_id, system_prompt,
                        created_at, updated_at
                 FROM agents WHERE id = ?1",
                params![id.to_string()],
                row_to_agent,
            )
            .optional()
            .map_err(backend_err)?
            .ok_or_else(|| StoreError::not_found("agent", id))?
        })
        .await
        .map_err(|e| StoreError::Backend(anyhow::Error::new(e)))?
    }

    async fn list_agents(&self) -> StoreResult<Vec<Agent>> {
        let handle = self.handle.clone();
        task::spawn_blocking(move || -> StoreResult<Vec<Agent>> {
            let conn = handle.connect()?;
            let mut stmt = conn
                .prepare(
                    "SELECT id, name, description, provider_id, model_id, system_prompt,
                            created_at, updated_at
                     FROM agents",
                )
                .map_err(backend_err)?;
            let rows = stmt.query_map([], row_to_agent).map_err(backend_err)?;
            rows.collect::<Result<Vec<_>, _>>()
                .map_err(backend_err)?
                .into_iter()
                .collect()
        })
        .await
        .map_err(|e| StoreError::Backend(anyhow::Error::new(e)))?
    }

    async fn get_agent_tools(&self, agent_id: Uuid) -> StoreResult<Vec<Tool>> {
        let handle = self.handle.clone();
        task::spawn_blocking(move || -> StoreResult<Vec<Tool>> {
            let conn = handle.connect()?;
            let mut stmt = conn
                .prepare(
                    "SELECT t.id, t.name, t.description, t.tool_type, t.metadata,
                            t.created_at, t.updated_at
                     FROM tools t
                     JOIN agent_tools at ON at.tool_id = t.id
                     WHERE at.agent_id = ?1",
                )
                .map_err(backend_err)?;
            let rows = stmt
                .query_map(params![agent_id.to_string()], row_to_tool)
                .map_err(backend_err)?;
            rows.collect::<Result<Vec<_>, _>>()
                .map_err(backend_err)?
                .into_iter()
                .collect()
        })
        .await
        .map_err(|e| StoreError::Backend(anyhow::Error::new(e)))?
    }

    async fn get_tool(&self, id: Uuid) -> StoreResult<Tool> {
        let handle = self.handle.clone();
        task::spawn_blocking(move || -> StoreResult<Tool> {
            let conn = handle.connect()?;
            conn.query_row(
                "SELECT id, name, description, tool_type, metadata, created_at, updated_at
                 FROM tools WHERE id = ?1",
                params![id.to_string()],
                row_to_tool,
            )
            .optional()
            .map_err(backend_err)?
            .ok_or_else(|| StoreError::not_found("tool", id))?
        })
        .await
        .map_err(|e| StoreError::Backend(anyhow::Error::new(e)))?
    }

    async fn get_workflow(&self, id: Uuid) -> StoreResult<Workflow> {
        let handle = self.handle.clone();
        task::spawn_blocking(move || -> StoreResult<Workflow> {
            let conn = handle.connect()?;
            conn.query_row(
                "SELECT id, name, description, is_async, created_at, updated_at
                 FROM workflows WHERE id = ?1",
                params![id.to_string()],
                row_to_workflow,
            )
            .optional()
            .map_err(backend_err)?
            .ok_or_else(|| StoreError::not_found("workflow", id))?
        })
        .await
        .map_err(|e| StoreError::Backend(anyhow::Error::new(e)))?
    }

    async fn list_workflows(&self) -> StoreResult<Vec<Workflow>> {
        let handle = self.handle.clone();
        task::spawn_blocking(move || -> StoreResult<Vec<Workflow>> {
            let conn = handle.connect()?;
            let mut stmt = conn
                .prepare("SELECT id, name, description, is_async, created_at, updated_at FROM workflows")
                .map_err(backend_err)?;
            let rows = stmt.query_map([], row_to_workflow).map_err(backend_err)?;
            rows.collect::<Result<Vec<_>, _>>()
                .map_err(backend_err)?
                .into_iter()
                .collect()
        })
        .await
        .map_err(|e| StoreError::Backend(anyhow::Error::new(e)))?
    }

    async fn list_workflow_steps(&self, workflow_id: Uuid) -> StoreResult<Vec<WorkflowStep>> {
        let handle = self.handle.clone();
        task::spawn_blocking(move || -> StoreResult<Vec<WorkflowStep>> {
            let conn = handle.connect()?;
            let mut stmt = conn
                .prepare(
                    "SELECT id, workflow_id, step_order, step_type, agent_id, wasm_module_id,
                            config, created_at
                     FROM workflow_steps WHERE workflow_id = ?1 ORDER BY step_order ASC",
                )
                .map_err(backend_err)?;
            let rows = stmt
                .query_map(params![workflow_id.to_string()], row_to_workflow_step)
                .map_err(backend_err)?;
            rows.collect::<Result<Vec<_>, _>>()
                .map_err(backend_err)?
                .into_iter()
                .collect()
        })
        .await
        .map_err(|e| StoreError::Backend(anyhow::Error::new(e)))?
    }

    async fn get_wasm_module(&self, id: Uuid) -> StoreResult<WasmModule> {
        let handle = self.handle.clone();
        task::spawn_blocking(move || -> StoreResult<WasmModule> {
            let conn = handle.connect()?;
            conn.query_row(
                "SELECT id, name, description, module_bytes, config, created_at, updated_at
                 FROM wasm_modules WHERE id = ?1",
                params![id.to_string()],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, Option<String>>(2)?,
                        row.get::<_, Vec<u8>>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, String>(5)?,
                        row.get::<_, String>(6)?,
                    ))
                },
            )
            .optional()
            .map_err(backend_err)?
            .ok_or_else(|| StoreError::not_found("wasm_module", id))
            .and_then(
                |(id, name, description, module_bytes, config, created_at, updated_at)| {
                    Ok(WasmModule {
                        id: parse_uuid(&id)?,
                        name,
                        description,
                        module_bytes,
                        config: parse_json(&config)?,
                        created_at: parse_dt(&created_at)?,
                        updated_at: parse_dt(&updated_at)?,
                    })
                },
            )
        })
        .await
        .map_err(|e| StoreError::Backend(anyhow::Error::new(e)))?
    }

    async fn get_setting(&self, key: &str) -> StoreResult<Option<String>> {
        let handle = self.handle.clone();
        let key = key.to_string();
        task::spawn_blocking(move || -> StoreResult<Option<String>> {
            let conn = handle.connect()?;
            conn.query_row(
                "SELECT value FROM settings WHERE key = ?1",
                params![key],
                |row| row.get::<_, String>(0),
            )
            .optional()
            .map_err(backend_err)
        })
        .await
        .map_err(|e| StoreError::Backend(anyhow::Error::new(e)))?
    }
}

fn row_to_agent(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoreResult<Agent>> {
    let id: String = row.get(0)?;
    let name: String = row.get(1)?;
    let description: Option<String> = row.get(2)?;
    let provider_id: String = row.get(3)?;
    let model_id: String = row.get(4)?;
    let system_prompt: Option<String> = row.get(5)?;
    let created_at: String = row.get(6)?;
    let updated_at: String = row.get(7)?;
    Ok((|| {
        Ok(Agent {
            id: parse_uuid(&id)?,
            name,
            description,
            provider_id: parse_uuid(&provider_id)?,
            model_id,
            system_prompt,
            created_at: parse_dt(&created_at)?,
            updated_at: parse_dt(&updated_at)?,
        })
    })())
}

fn row_to_tool(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoreResult<Tool>> {
    let id: String = row.get(0)?;
    let name: String = row.get(1)?;
    let description: String = row.get(2)?;
    let tool_type: String = row.get(3)?;
    let metadata: String = row.get(4)?;
    let created_at: String = row.get(5)?;
    let updated_at: String = row.get(6)?;
    Ok((|| {
        Ok(Tool {
            id: parse_uuid(&id)?,
            name,
            description,
            tool_type: parse_tool_type(&tool_type)?,
            metadata: parse_json(&metadata)?,
            created_at: parse_dt(&created_at)?,
            updated_at: parse_dt(&updated_at)?,
        })
    })())
}

fn row_to_workflow(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoreResult<Workflow>> {
    let id: String = row.get(0)?;
    let name: String = row.get(1)?;
    let description: Option<String> = row.get(2)?;
    let is_async: i64 = row.get(3)?;
    let created_at: String = row.get(4)?;
    let updated_at: String = row.get(5)?;
    Ok((|| {
        Ok(Workflow {
            id: parse_uuid(&id)?,
            name,
            description,
            is_async: is_async != 0,
            created_at: parse_dt(&created_at)?,
            updated_at: parse_dt(&updated_at)?,
        })
    })())
}

fn row_to_workflow_step(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoreResult<WorkflowStep>> {
    let id: String = row.get(0)?;
    let workflow_id: String = row.get(1)?;
    let step_order: i64 = row.get(2)?;
    let step_type: String = row.get(3)?;
    let agent_id: Option<String> = row.get(4)?;
    let wasm_module_id: Option<String> = row.get(5)?;
    let config: String = row.get(6)?;
    let created_at: String = row.get(7)?;
    Ok((|| {
        Ok(WorkflowStep {
            id: parse_uuid(&id)?,
            workflow_id: parse_uuid(&workflow_id)?,
            step_order: u32::try_from(step_order).unwrap_or(0),
            step_type: match step_type.as_str() {
                "agent" => loom_core::model::StepType::Agent,
                "wasm_module" => loom_core::model::StepType::WasmModule,
                other => {
                    return Err(StoreError::Backend(anyhow::anyhow!(
                        "unknown step_type '{other}' in database"
                    )))
                }
            },
            agent_id: agent_id.map(|s| parse_uuid(&s)).transpose()?,
            wasm_module_id: wasm_module_id.map(|s| parse_uuid(&s)).transpose()?,
            config: parse_json(&config)?,
            created_at: parse_dt(&created_at)?,
        })
    })())
}

fn job_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoreResult<Job>> {
    let id: String = row.get(0)?;
    let workflow_id: Option<String> = row.get(1)?;
    let wasm_module_id: Option<String> = row.get(2)?;
    let status: String = row.get(3)?;
    let input_data: String = row.get(4)?;
    let output_data: String = row.get(5)?;
    let working_dir: Option<String> = row.get(6)?;
    let error_message: Option<String> = row.get(7)?;
    let created_at: String = row.get(8)?;
    let started_at: Option<String> = row.get(9)?;
    let completed_at: Option<String> = row.get(10)?;
    Ok((|| {
        Ok(Job {
            id: parse_uuid(&id)?,
            workflow_id: workflow_id.map(|s| parse_uuid(&s)).transpose()?,
            wasm_module_id: wasm_module_id.map(|s| parse_uuid(&s)).transpose()?,
            status: parse_job_status(&status)?,
            input_data: parse_json(&input_data)?,
            output_data: parse_json(&output_data)?,
            working_dir,
            error_message,
            created_at: parse_dt(&created_at)?,
            started_at: started_at.map(|s| parse_dt(&s)).transpose()?,
            completed_at: completed_at.map(|s| parse_dt(&s)).transpose()?,
        })
    })())
}

fn job_step_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoreResult<JobStep>> {
    let id: String = row.get(0)?;
    let job_id: String = row.get(1)?;
    let workflow_step_id: String = row.get(2)?;
    let step_order: i64 = row.get(3)?;
    let status: String = row.get(4)?;
    let input_data: String = row.get(5)?;
    let output_data: String = row.get(6)?;
    let started_at: Option<String> = row.get(7)?;
    let completed_at: Option<String> = row.get(8)?;
    let error_message: Option<String> = row.get(9)?;
    Ok((|| {
        Ok(JobStep {
            id: parse_uuid(&id)?,
            job_id: parse_uuid(&job_id)?,
            workflow_step_id: parse_uuid(&workflow_step_id)?,
            step_order: u32::try_from(step_order).unwrap_or(0),
            status: parse_job_status(&status)?,
            input_data: parse_json(&input_data)?,
            output_data: parse_json(&output_data)?,
            started_at: started_at.map(|s| parse_dt(&s)).transpose()?,
            completed_at: completed_at.map(|s| parse_dt(&s)).transpose()?,
            error_message,
        })
    })())
}

/// `SQLite`-backed [`JobStore`].
#[derive(Debug, Clone)]
pub struct SqliteJobStore {
    handle: SqliteHandle,
}

impl SqliteJobStore {
    #[must_use]
    pub fn new(handle: SqliteHandle) -> Self {
        Self { handle }
    }
}

#[async_trait]
impl JobStore for SqliteJobStore {
    async fn create_job(&self, job: Job) -> StoreResult<Job> {
        let handle = self.handle.clone();
        let job_clone = job.clone();
        task::spawn_blocking(move || -> StoreResult<()> {
            let conn = handle.connect()?;
            conn.execute(
                "INSERT INTO jobs (id, workflow_id, wasm_module_id, status, input_data,
                    output_data, working_dir, error_message, created_at, started_at, completed_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    job_clone.id.to_string(),
                    job_clone.workflow_id.map(|v| v.to_string()),
                    job_clone.wasm_module_id.map(|v| v.to_string()),
                    job_status_str(job_clone.status),
                    job_clone.input_data.to_string(),
                    job_clone.output_data.to_string(),
                    job_clone.working_dir,
                    job_clone.error_message,
                    job_clone.created_at.to_rfc3339(),
                    job_clone.started_at.map(|v| v.to_rfc3339()),
                    job_clone.completed_at.map(|v| v.to_rfc3339()),
                ],
            )
            .map_err(backend_err)?;
            Ok(())
        })
        .await
        .map_err(|e| StoreError::Backend(anyhow::Error::new(e)))??;
        Ok(job)
    }

    async fn get_job(&self, id: Uuid) -> StoreResult<Job> {
        let handle = self.handle.clone();
        task::spawn_blocking(move || -> StoreResult<Job> {
            let conn = handle.connect()?;
            conn.query_row(
                "SELECT id, workflow_id, wasm_module_id, status, input_data, output_data,
                        working_dir, error_message, created_at, started_at, completed_at
                 FROM jobs WHERE id = ?1",
                params![id.to_string()],
                job_from_row,
            )
            .optional()
            .map_err(backend_err)?
            .ok_or_else(|| StoreError::not_found("job", id))?
        })
        .await
        .map_err(|e| StoreError::Backend(anyhow::Error::new(e)))?
    }

    async fn update_job(&self, job: Job) -> StoreResult<Job> {
        let handle = self.handle.clone();
        let job_clone = job.clone();
        task::spawn_blocking(move || -> StoreResult<()> {
            let conn = handle.connect()?;
            conn.execute(
                "UPDATE jobs SET workflow_id = ?2, wasm_module_id = ?3, status = ?4,
                    input_data = ?5, output_data = ?6, working_dir = ?7, error_message = ?8,
                    started_at = ?9, completed_at = ?10
                 WHERE id = ?1",
                params![
                    job_clone.id.to_string(),
                    job_clone.workflow_id.map(|v| v.to_string()),
                    job_clone.wasm_module_id.map(|v| v.to_string()),
                    job_status_str(job_clone.status),
                    job_clone.input_data.to_string(),
                    job_clone.output_data.to_string(),
                    job_clone.working_dir,
                    job_clone.error_message,
                    job_clone.started_at.map(|v| v.to_rfc3339()),
                    job_clone.completed_at.map(|v| v.to_rfc3339()),
                ],
            )
            .map_err(backend_err)?;
            Ok(())
        })
        .await
        .map_err(|e| StoreError::Backend(anyhow::Error::new(e)))??;
        Ok(job)
    }

    /// Peek only: does not claim the job. The worker claims it by calling
    /// `mark_job_running`, whose `WHERE status = 'queued'`-guarded update
    /// is what makes concurrent claims of the same id race-safe — the
    /// loser's update affects zero rows and its `Job::transition` check
    /// (re-read after the no-op update) reports `InvalidTransition`.
    async fn get_next_queued_job(&self) -> StoreResult<Option<Job>> {
        let handle = self.handle.clone();
        task::spawn_blocking(move || -> StoreResult<Option<Job>> {
            let conn = handle.connect()?;
            conn.query_row(
                "SELECT id, workflow_id, wasm_module_id, status, input_data, output_data,
                        working_dir, error_message, created_at, started_at, completed_at
                 FROM jobs WHERE status = 'queued'
                 ORDER BY created_at ASC LIMIT 1",
                [],
                job_from_row,
            )
            .optional()
            .map_err(backend_err)?
            .transpose()
        })
        .await
        .map_err(|e| StoreError::Backend(anyhow::Error::new(e)))?
    }

    async fn mark_job_running(&self, id: Uuid) -> StoreResult<Job> {
        self.set_job_status(id, JobStatus::Running, None, None).await
    }

    async fn mark_job_completed(&self, id: Uuid, output: serde_json::Value) -> StoreResult<Job> {
        self.set_job_status(id, JobStatus::Completed, Some(output), None)
            .await
    }

    async fn mark_job_failed(&self, id: Uuid, error: String) -> StoreResult<Job> {
        self.set_job_status(id, JobStatus::Failed, None, Some(error))
            .await
    }

    async fn cancel_job(&self, id: Uuid) -> StoreResult<Job> {
        self.set_job_status(id, JobStatus::Cancelled, None, None).await
    }

    async fn create_job_step(&self, step: JobStep) -> StoreResult<JobStep> {
        let handle = self.handle.clone();
        let step_clone = step.clone();
        task::spawn_blocking(move || -> StoreResult<()> {
            let conn = handle.connect()?;
            conn.execute(
                "INSERT INTO job_steps (id, job_id, workflow_step_id, step_order, status,
                    input_data, output_data, started_at, completed_at, error_message)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    step_clone.id.to_string(),
                    step_clone.job_id.to_string(),
                    step_clone.workflow_step_id.to_string(),
                    step_clone.step_order,
                    job_status_str(step_clone.status),
                    step_clone.input_data.to_string(),
                    step_clone.output_data.to_string(),
                    step_clone.started_at.map(|v| v.to_rfc3339()),
                    step_clone.completed_at.map(|v| v.to_rfc3339()),
                    step_clone.error_message,
                ],
            )
            .map_err(backend_err)?;
            Ok(())
        })
        .await
        .map_err(|e| StoreError::Backend(anyhow::Error::new(e)))??;
        Ok(step)
    }

    async fn get_job_step(&self, id: Uuid) -> StoreResult<JobStep> {
        let handle = self.handle.clone();
        task::spawn_blocking(move || -> StoreResult<JobStep> {
            let conn = handle.connect()?;
            conn.query_row(
                "SELECT id, job_id, workflow_step_id, step_order, status, input_data,
                        output_data, started_at, completed_at, error_message
                 FROM job_steps WHERE id = ?1",
                params![id.to_string()],
                job_step_from_row,
            )
            .optional()
            .map_err(backend_err)?
            .ok_or_else(|| StoreError::not_found("job_step", id))?
        })
        .await
        .map_err(|e| StoreError::Backend(anyhow::Error::new(e)))?
    }

    async fn list_job_steps(&self, job_id: Uuid) -> StoreResult<Vec<JobStep>> {
        let handle = self.handle.clone();
        task::spawn_blocking(move || -> StoreResult<Vec<JobStep>> {
            let conn = handle.connect()?;
            let mut stmt = conn
                .prepare(
                    "SELECT id, job_id, workflow_step_id, step_order, status, input_data,
                            output_data, started_at, completed_at, error_message
                     FROM job_steps WHERE job_id = ?1 ORDER BY step_order ASC",
                )
                .map_err(backend_err)?;
            let rows = stmt
                .query_map(params![job_id.to_string()], job_step_from_row)
                .map_err(backend_err)?;
            rows.collect::<Result<Vec<_>, _>>()
                .map_err(backend_err)?
                .into_iter()
                .collect()
        })
        .await
        .map_err(|e| StoreError::Backend(anyhow::Error::new(e)))?
    }

    async fn mark_job_step_running(&self, id: Uuid) -> StoreResult<JobStep> {
        self.set_job_step_status(id, JobStatus::Running, None, None).await
    }

    async fn mark_job_step_completed(
        &self,
        id: Uuid,
        output: serde_json::Value,
    ) -> StoreResult<JobStep> {
        self.set_job_step_status(id, JobStatus::Completed, Some(output), None)
            .await
    }

    async fn mark_job_step_failed(&self, id: Uuid, error: String) -> StoreResult<JobStep> {
        self.set_job_step_status(id, JobStatus::Failed, None, Some(error))
            .await
    }
}

impl SqliteJobStore {
    async fn set_job_status(
        &self,
        id: Uuid,
        next: JobStatus,
        output: Option<serde_json::Value>,
        error: Option<String>,
    ) -> StoreResult<Job> {
        let handle = self.handle.clone();
        task::spawn_blocking(move || -> StoreResult<Job> {
            let mut conn = handle.connect()?;
            let tx = conn.transaction().map_err(backend_err)?;

            let mut job: Job = tx
                .query_row(
                    "SELECT id, workflow_id, wasm_module_id, status, input_data, output_data,
                            working_dir, error_message, created_at, started_at, completed_at
                     FROM jobs WHERE id = ?1",
                    params![id.to_string()],
                    job_from_row,
                )
                .optional()
                .map_err(backend_err)?
                .ok_or_else(|| StoreError::not_found("job", id))??;

            job.transition(next)?;
            if let Some(output) = output {
                job.output_data = output;
            }
            if let Some(error) = error {
                job.error_message = Some(error);
            }

            tx.execute(
                "UPDATE jobs SET status = ?2, output_data = ?3, error_message = ?4,
                    started_at = ?5, completed_at = ?6 WHERE id = ?1",
                params![
                    id.to_string(),
                    job_status_str(job.status),
                    job.output_data.to_string(),
                    job.error_message,
                    job.started_at.map(|v| v.to_rfc3339()),
                    job.completed_at.map(|v| v.to_rfc3339()),
                ],
            )
            .map_err(backend_err)?;
            tx.commit().map_err(backend_err)?;
            Ok(job)
        })
        .await
        .map_err(|e| StoreError::Backend(anyhow::Error::new(e)))?
    }

    async fn set_job_step_status(
        &self,
        id: Uuid,
        next: JobStatus,
        output: Option<serde_json::Value>,
        error: Option<String>,
    ) -> StoreResult<JobStep> {
        let handle = self.handle.clone();
        task::spawn_blocking(move || -> StoreResult<JobStep> {
            let mut conn = handle.connect()?;
            let tx = conn.transaction().map_err(backend_err)?;

            let mut step: JobStep = tx
                .query_row(
                    "SELECT id, job_id, workflow_step_id, step_order, status, input_data,
                            output_data, started_at, completed_at, error_message
                     FROM job_steps WHERE id = ?1",
                    params![id.to_string()],
                    job_step_from_row,
                )
                .optional()
                .map_err(backend_err)?
                .ok_or_else(|| StoreError::not_found("job_step", id))??;

            step.transition(next)?;
            if let Some(output) = output {
                step.output_data = output;
            }
            if let Some(error) = error {
                step.error_message = Some(error);
            }

            tx.execute(
                "UPDATE job_steps SET status = ?2, output_data = ?3, error_message = ?4,
                    started_at = ?5, completed_at = ?6 WHERE id = ?1",
                params![
                    id.to_string(),
                    job_status_str(step.status),
                    step.output_data.to_string(),
                    step.error_message,
                    step.started_at.map(|v| v.to_rfc3339()),
                    step.completed_at.map(|v| v.to_rfc3339()),
                ],
            )
            .map_err(backend_err)?;
            tx.commit().map_err(backend_err)?;
            Ok(step)
        })
        .await
        .map_err(|e| StoreError::Backend(anyhow::Error::new(e)))?
    }
}

/// Catalog-writing helpers used by migrations, fixtures, and tests to
/// populate the read-mostly tables [`PrimitiveStore`] exposes. There is
/// no admin surface for these in the store trait itself — catalog
/// entities are expected to be provisioned out of band.
pub async fn seed_provider(handle: &SqliteHandle, provider: Provider) -> StoreResult<()> {
    let handle = handle.clone();
    task::spawn_blocking(move || -> StoreResult<()> {
        let conn = handle.connect()?;
        conn.execute(
            "INSERT OR REPLACE INTO providers
                (id, name, api_base_url, api_key, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                provider.id.to_string(),
                provider.name,
                provider.api_base_url,
                provider.api_key,
                provider.created_at.to_rfc3339(),
                provider.updated_at.to_rfc3339(),
            ],
        )
        .map_err(backend_err)?;
        Ok(())
    })
    .await
    .map_err(|e| StoreError::Backend(anyhow::Error::new(e)))?
}

pub async fn seed_agent(handle: &SqliteHandle, agent: Agent) -> StoreResult<()> {
    let handle = handle.clone();
    task::spawn_blocking(move || -> StoreResult<()> {
        let conn = handle.connect()?;
        conn.execute(
            "INSERT OR REPLACE INTO agents
                (id, name, description, provider_id, model_id, system_prompt,
                 created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                agent.id.to_string(),
                agent.name,
                agent.description,
                agent.provider_id.to_string(),
                agent.model_id,
                agent.system_prompt,
                agent.created_at.to_rfc3339(),
                agent.updated_at.to_rfc3339(),
            ],
        )
        .map_err(backend_err)?;
        Ok(())
    })
    .await
    .map_err(|e| StoreError::Backend(anyhow::Error::new(e)))?
}

pub async fn seed_tool(handle: &SqliteHandle, tool: Tool) -> StoreResult<()> {
    let handle = handle.clone();
    task::spawn_blocking(move || -> StoreResult<()> {
        let conn = handle.connect()?;
        conn.execute(
            "INSERT OR REPLACE INTO tools
                (id, name, description, tool_type, metadata, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                tool.id.to_string(),
                tool.name,
                tool.description,
                tool_type_str(tool.tool_type),
                tool.metadata.to_string(),
                tool.created_at.to_rfc3339(),
                tool.updated_at.to_rfc3339(),
            ],
        )
        .map_err(backend_err)?;
        Ok(())
    })
    .await
    .map_err(|e| StoreError::Backend(anyhow::Error::new(e)))?
}

pub async fn seed_agent_tool(handle: &SqliteHandle, rel: AgentTool) -> StoreResult<()> {
    let handle = handle.clone();
    task::spawn_blocking(move || -> StoreResult<()> {
        let conn = handle.connect()?;
        conn.execute(
            "INSERT OR IGNORE INTO agent_tools (agent_id, tool_id) VALUES (?1, ?2)",
            params![rel.agent_id.to_string(), rel.tool_id.to_string()],
        )
        .map_err(backend_err)?;
        Ok(())
    })
    .await
    .map_err(|e| StoreError::Backend(anyhow::Error::new(e)))?
}

pub async fn seed_workflow(
    handle: &SqliteHandle,
    workflow: Workflow,
    steps: Vec<WorkflowStep>,
) -> StoreResult<()> {
    let handle = handle.clone();
    task::spawn_blocking(move || -> StoreResult<()> {
        let mut conn = handle.connect()?;
        let tx = conn.transaction().map_err(backend_err)?;
        tx.execute(
            "INSERT OR REPLACE INTO workflows
                (id, name, description, is_async, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                workflow.id.to_string(),
                workflow.name,
                workflow.description,
                i64::from(workflow.is_async),
                workflow.created_at.to_rfc3339(),
                workflow.updated_at.to_rfc3339(),
            ],
        )
        .map_err(backend_err)?;
        for step in steps {
            step.validate()?;
            tx.execute(
                "INSERT OR REPLACE INTO workflow_steps
                    (id, workflow_id, step_order, step_type, agent_id, wasm_module_id,
                     config, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    step.id.to_string(),
                    step.workflow_id.to_string(),
                    step.step_order,
                    step_type_str(step.step_type),
                    step.agent_id.map(|v| v.to_string()),
                    step.wasm_module_id.map(|v| v.to_string()),
                    step.config.to_string(),
                    step.created_at.to_rfc3339(),
                ],
            )
            .map_err(backend_err)?;
        }
        tx.commit().map_err(backend_err)?;
        Ok(())
    })
    .await
    .map_err(|e| StoreError::Backend(anyhow::Error::new(e)))?
}

pub async fn seed_wasm_module(handle: &SqliteHandle, module: WasmModule) -> StoreResult<()> {
    let handle = handle.clone();
    task::spawn_blocking(move || -> StoreResult<()> {
        let conn = handle.connect()?;
        conn.execute(
            "INSERT OR REPLACE INTO wasm_modules
                (id, name, description, module_bytes, config, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                module.id.to_string(),
                module.name,
                module.description,
                module.module_bytes,
                module.config.to_string(),
                module.created_at.to_rfc3339(),
                module.updated_at.to_rfc3339(),
            ],
        )
        .map_err(backend_err)?;
        Ok(())
    })
    .await
    .map_err(|e| StoreError::Backend(anyhow::Error::new(e)))?
}

pub async fn seed_setting(handle: &SqliteHandle, key: &str, value: &str) -> StoreResult<()> {
    let handle = handle.clone();
    let key = key.to_string();
    let value = value.to_string();
    task::spawn_blocking(move || -> StoreResult<()> {
        let conn = handle.connect()?;
        conn.execute(
            "INSERT OR REPLACE INTO settings (key, value) VALUES (?1, ?2)",
            params![key, value],
        )
        .map_err(backend_err)?;
        Ok(())
    })
    .await
    .map_err(|e| StoreError::Backend(anyhow::Error::new(e)))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn job_store() -> SqliteJobStore {
        let handle = SqliteHandle::open(":memory:").await.unwrap();
        SqliteJobStore::new(handle)
    }

    #[tokio::test]
    async fn job_round_trips_through_sqlite() {
        let store = job_store().await;
        let job = Job::new(None, None, json!({"prompt": "hi"}), None);
        let id = job.id;
        store.create_job(job).await.unwrap();

        let claimed = store.get_next_queued_job().await.unwrap().unwrap();
        assert_eq!(claimed.id, id);
        assert_eq!(claimed.status, JobStatus::Queued);

        store.mark_job_running(id).await.unwrap();
        let completed = store
            .mark_job_completed(id, json!({"output": "done"}))
            .await
            .unwrap();
        assert_eq!(completed.status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn invalid_transition_is_rejected_by_sqlite_store() {
        let store = job_store().await;
        let job = Job::new(None, None, json!({}), None);
        let id = job.id;
        store.create_job(job).await.unwrap();

        let err = store.mark_job_completed(id, json!(null)).await.unwrap_err();
        assert!(matches!(err, StoreError::Core(_)));
    }

    #[tokio::test]
    async fn primitive_store_reads_back_seeded_catalog() {
        let handle = SqliteHandle::open(":memory:").await.unwrap();
        let now = Utc::now();
        let provider = Provider {
            id: Uuid::new_v4(),
            name: "local".to_string(),
            api_base_url: "http://localhost:11434".to_string(),
            api_key: "unused".to_string(),
            created_at: now,
            updated_at: now,
        };
        let agent = Agent {
            id: Uuid::new_v4(),
            name: "assistant".to_string(),
            description: None,
            provider_id: provider.id,
            model_id: "llama3".to_string(),
            system_prompt: Some("be helpful".to_string()),
            created_at: now,
            updated_at: now,
        };
        let tool = Tool {
            id: Uuid::new_v4(),
            name: "fs".to_string(),
            description: "filesystem access".to_string(),
            tool_type: ToolType::Filesystem,
            metadata: json!({}),
            created_at: now,
            updated_at: now,
        };

        seed_provider(&handle, provider.clone()).await.unwrap();
        seed_agent(&handle, agent.clone()).await.unwrap();
        seed_tool(&handle, tool.clone()).await.unwrap();
        seed_agent_tool(
            &handle,
            AgentTool {
                agent_id: agent.id,
                tool_id: tool.id,
            },
        )
        .await
        .unwrap();

        let store = SqlitePrimitiveStore::new(handle);
        let fetched_agent = store.get_agent(agent.id).await.unwrap();
        assert_eq!(fetched_agent.model_id, "llama3");

        let tools = store.get_agent_tools(agent.id).await.unwrap();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].tool_type, ToolType::Filesystem);
    }
}
