//! Sandboxed WASM module execution: fresh `wasmtime` store per call,
//! WASI P1 plus the custom `env` host ABI, and the module lifecycle
//! (resolve → merge config+input → compile → instantiate →
//! `_initialize`/`_start` → parse stdout → structured result).
//!
//! This crate never talks to the Primitive Store or the Scheduler
//! directly — callers inject an [`ExecutionHost`] so `execute_target`
//! and the job-output host functions can reach back into the rest of
//! the system without creating a dependency cycle.

pub mod cache;
pub mod error;
pub mod executor;
pub mod host_abi;

pub use error::{WasmError, WasmResult};
pub use executor::{WasmExecutor, WasmExecutorConfig, WasmResultValue};

use std::time::Instant;

use async_trait::async_trait;
use uuid::Uuid;

/// The target of `execute_target`/`trigger_workflow_or_agent`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetKind {
    Workflow,
    Agent,
}

/// The rest-of-the-system callback a [`WasmExecutor`] uses to service
/// `execute_target`, `get_job_output`, and `wait_for_job_and_get_output`.
/// Implemented by `loom-engine` (for workflow/job targets) composed with
/// `loom-agent` (for agent targets).
#[async_trait]
pub trait ExecutionHost: Send + Sync {
    async fn execute_target(
        &self,
        kind: TargetKind,
        id: &str,
        params: serde_json::Value,
    ) -> WasmResult<serde_json::Value>;

    async fn get_job_output(&self, job_id: Uuid) -> WasmResult<Option<serde_json::Value>>;

    async fn wait_for_job_output(
        &self,
        job_id: Uuid,
        deadline: Instant,
    ) -> WasmResult<serde_json::Value>;
}
