//! Shared fixtures for unit tests across this crate's modules.

use async_trait::async_trait;
use loom_core::model::{Agent, Provider, Tool, WasmModule, Workflow, WorkflowStep};
use loom_store::{PrimitiveStore, StoreError, StoreResult};
use uuid::Uuid;

/// A `PrimitiveStore` that answers every lookup with `NotFound`. Good
/// enough for tool tests that never exercise the catalog path.
#[derive(Debug, Default)]
pub struct NoopStore;

#[async_trait]
impl PrimitiveStore for NoopStore {
    async fn get_provider(&self, id: Uuid) -> StoreResult<Provider> {
        Err(StoreError::not_found("provider", id))
    }

    async fn get_agent(&self, id: Uuid) -> StoreResult<Agent> {
        Err(StoreError::not_found("agent", id))
    }

    async fn list_agents(&self) -> StoreResult<Vec<Agent>> {
        Ok(Vec::new())
    }

    async fn get_agent_tools(&self, _agent_id: Uuid) -> StoreResult<Vec<Tool>> {
        Ok(Vec::new())
    }

    async fn get_tool(&self, id: Uuid) -> StoreResult<Tool> {
        Err(StoreError::not_found("tool", id))
    }

    async fn get_workflow(&self, id: Uuid) -> StoreResult<Workflow> {
        Err(StoreError::not_found("workflow", id))
    }

    async fn list_workflows(&self) -> StoreResult<Vec<Workflow>> {
        Ok(Vec::new())
    }

    async fn list_workflow_steps(&self, _workflow_id: Uuid) -> StoreResult<Vec<WorkflowStep>> {
        Ok(Vec::new())
    }

    async fn get_wasm_module(&self, id: Uuid) -> StoreResult<WasmModule> {
        Err(StoreError::not_found("wasm_module", id))
    }

    async fn get_setting(&self, _key: &str) -> StoreResult<Option<String>> {
        Ok(None)
    }
}
