//! Entities from the data model: providers, agents, tools, workflows,
//! jobs, and the settings table.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{CoreError, CoreResult};

/// An LLM provider configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Provider {
    pub id: Uuid,
    pub name: String,
    pub api_base_url: String,
    /// Never logged or serialized in debug output directly by callers;
    /// the store is responsible for keeping this at rest securely.
    pub api_key: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A persistent LLM agent configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub provider_id: Uuid,
    pub model_id: String,
    pub system_prompt: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// The built-in capability a [`Tool`] exposes, selected by
/// `metadata.tool_type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolType {
    Memory,
    Filesystem,
    Http,
    Database,
    Bash,
}

/// A tool an agent may call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tool {
    pub id: Uuid,
    pub name: String,
    pub description: String,
    pub tool_type: ToolType,
    /// Opaque per-tool configuration (e.g. allow-listed hosts for `http`).
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A workflow: an ordered list of steps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub is_async: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// The kind of a [`WorkflowStep`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    Agent,
    WasmModule,
}

/// One step in a workflow. Exactly one of `agent_id` / `wasm_module_id`
/// is populated, and it must match `step_type` — enforced by the
/// constructors below rather than by leaving both fields open to
/// arbitrary mutation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowStep {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub step_order: u32,
    pub step_type: StepType,
    pub agent_id: Option<Uuid>,
    pub wasm_module_id: Option<Uuid>,
    pub config: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl WorkflowStep {
    /// Build an agent-kind step. `step_order` must be >= 1.
    pub fn for_agent(
        workflow_id: Uuid,
        step_order: u32,
        agent_id: Uuid,
        config: serde_json::Value,
    ) -> CoreResult<Self> {
        if step_order < 1 {
            return Err(CoreError::InvalidStep(
                "step_order must be >= 1".to_string(),
            ));
        }
        Ok(Self {
            id: Uuid::new_v4(),
            workflow_id,
            step_order,
            step_type: StepType::Agent,
            agent_id: Some(agent_id),
            wasm_module_id: None,
            config,
            created_at: Utc::now(),
        })
    }

    /// Build a WASM-module-kind step. `step_order` must be >= 1.
    pub fn for_wasm(
        workflow_id: Uuid,
        step_order: u32,
        wasm_module_id: Uuid,
        config: serde_json::Value,
    ) -> CoreResult<Self> {
        if step_order < 1 {
            return Err(CoreError::InvalidStep(
                "step_order must be >= 1".to_string(),
            ));
        }
        Ok(Self {
            id: Uuid::new_v4(),
            workflow_id,
            step_order,
            step_type: StepType::WasmModule,
            agent_id: None,
            wasm_module_id: Some(wasm_module_id),
            config,
            created_at: Utc::now(),
        })
    }

    /// Validate the step-type/target invariant holds. Stores should call
    /// this before persisting a step built from external input.
    pub fn validate(&self) -> CoreResult<()> {
        match (self.step_type, self.agent_id, self.wasm_module_id) {
            (StepType::Agent, Some(_), None) => Ok(()),
            (StepType::WasmModule, None, Some(_)) => Ok(()),
            _ => Err(CoreError::InvalidStep(format!(
                "step {} has step_type={:?} but agent_id={:?} wasm_module_id={:?}",
                self.id, self.step_type, self.agent_id, self.wasm_module_id
            ))),
        }
    }
}

/// A sandboxed WASM module artifact.
#[derive(Clone, Serialize, Deserialize)]
pub struct WasmModule {
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub module_bytes: Vec<u8>,
    pub config: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl std::fmt::Debug for WasmModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WasmModule")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("module_bytes", &format!("<{} bytes>", self.module_bytes.len()))
            .field("config", &self.config)
            .finish()
    }
}

/// Job status, forming the finite state machine from the data model:
/// `Queued -> Running -> {Completed | Failed | Cancelled}`, plus the
/// direct `Queued -> {Failed | Cancelled}` shortcuts. Terminal states are
/// sinks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// Whether transitioning from `self` to `next` is a valid edge in the
    /// state machine.
    #[must_use]
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Queued, Running)
                | (Queued, Failed)
                | (Queued, Cancelled)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Cancelled)
        )
    }
}

/// One attempt to execute a workflow against a specific input.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub workflow_id: Option<Uuid>,
    pub wasm_module_id: Option<Uuid>,
    pub status: JobStatus,
    pub input_data: serde_json::Value,
    pub output_data: serde_json::Value,
    /// Filesystem scope handed to WASM steps, if any. May change
    /// mid-job via `set_working_directory`.
    pub working_dir: Option<String>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Job {
    #[must_use]
    pub fn new(
        workflow_id: Option<Uuid>,
        wasm_module_id: Option<Uuid>,
        input_data: serde_json::Value,
        working_dir: Option<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            workflow_id,
            wasm_module_id,
            status: JobStatus::Queued,
            input_data,
            output_data: serde_json::Value::Null,
            working_dir,
            error_message: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    /// Attempt the transition, enforcing the state machine.
    pub fn transition(&mut self, next: JobStatus) -> CoreResult<()> {
        if !self.status.can_transition_to(next) {
            return Err(CoreError::InvalidTransition {
                from: format!("{:?}", self.status),
                to: format!("{:?}", next),
            });
        }
        self.status = next;
        if next == JobStatus::Running {
            self.started_at = Some(Utc::now());
        }
        if next.is_terminal() {
            self.completed_at = Some(Utc::now());
        }
        Ok(())
    }
}

/// The per-step execution record: one row per attempted workflow step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobStep {
    pub id: Uuid,
    pub job_id: Uuid,
    pub workflow_step_id: Uuid,
    pub step_order: u32,
    pub status: JobStatus,
    pub input_data: serde_json::Value,
    pub output_data: serde_json::Value,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

impl JobStep {
    #[must_use]
    pub fn queued(
        job_id: Uuid,
        workflow_step_id: Uuid,
        step_order: u32,
        input_data: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            job_id,
            workflow_step_id,
            step_order,
            status: JobStatus::Queued,
            input_data,
            output_data: serde_json::Value::Null,
            started_at: None,
            completed_at: None,
            error_message: None,
        }
    }

    pub fn transition(&mut self, next: JobStatus) -> CoreResult<()> {
        if !self.status.can_transition_to(next) {
            return Err(CoreError::InvalidTransition {
                from: format!("{:?}", self.status),
                to: format!("{:?}", next),
            });
        }
        self.status = next;
        if next == JobStatus::Running {
            self.started_at = Some(Utc::now());
        }
        if next.is_terminal() {
            self.completed_at = Some(Utc::now());
        }
        Ok(())
    }
}

/// A recognized key in the Setting table, with its validated default.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettingKey {
    TimeoutWorkflowSeconds,
    TimeoutJobSeconds,
}

impl SettingKey {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            SettingKey::TimeoutWorkflowSeconds => "timeout_workflow_seconds",
            SettingKey::TimeoutJobSeconds => "timeout_job_seconds",
        }
    }

    #[must_use]
    pub fn default_value(self) -> u64 {
        match self {
            SettingKey::TimeoutWorkflowSeconds => 300,
            SettingKey::TimeoutJobSeconds => 3600,
        }
    }
}

/// Parse and validate a setting's raw string value (must be `> 0`).
pub fn parse_timeout_setting(key: SettingKey, raw: Option<&str>) -> CoreResult<u64> {
    let Some(raw) = raw else {
        return Ok(key.default_value());
    };
    let value: u64 = raw.parse().map_err(|_| CoreError::InvalidSetting {
        key: key.as_str().to_string(),
        reason: format!("'{raw}' is not a positive integer"),
    })?;
    if value == 0 {
        return Err(CoreError::InvalidSetting {
            key: key.as_str().to_string(),
            reason: "must be > 0".to_string(),
        });
    }
    Ok(value)
}

/// Many-to-many relation between agents and tools.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentTool {
    pub agent_id: Uuid,
    pub tool_id: Uuid,
}

/// Append-only audit log of job/step transitions, kept alongside the
/// Job Store for observability and debugging. This is *not* an
/// event-sourced replay log: the store's row state is authoritative,
/// this is a side channel a caller can inspect.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum JobEvent {
    JobQueued {
        job_id: Uuid,
        workflow_id: Option<Uuid>,
        input: serde_json::Value,
        at: DateTime<Utc>,
    },
    StepStarted {
        job_id: Uuid,
        job_step_id: Uuid,
        step_order: u32,
        at: DateTime<Utc>,
    },
    StepCompleted {
        job_id: Uuid,
        job_step_id: Uuid,
        output: serde_json::Value,
        at: DateTime<Utc>,
    },
    StepFailed {
        job_id: Uuid,
        job_step_id: Uuid,
        error: String,
        at: DateTime<Utc>,
    },
    JobCompleted {
        job_id: Uuid,
        output: serde_json::Value,
        at: DateTime<Utc>,
    },
    JobFailed {
        job_id: Uuid,
        error: String,
        at: DateTime<Utc>,
    },
    JobCancelled {
        job_id: Uuid,
        at: DateTime<Utc>,
    },
}

/// Opaque-map merge used by both the settings loader and the WASM
/// executor's config+input merge: `incoming` wins on key conflict.
#[must_use]
pub fn merge_maps(base: &serde_json::Value, incoming: &serde_json::Value) -> serde_json::Value {
    let mut merged: HashMap<String, serde_json::Value> = base
        .as_object()
        .map(|m| m.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
        .unwrap_or_default();

    if let Some(incoming_obj) = incoming.as_object() {
        for (k, v) in incoming_obj {
            merged.insert(k.clone(), v.clone());
        }
    }

    serde_json::to_value(merged).unwrap_or(serde_json::Value::Null)
}
