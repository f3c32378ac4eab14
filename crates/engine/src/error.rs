use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("job {0} exceeded its deadline")]
    Deadline(uuid::Uuid),

    #[error("job {0} was cancelled")]
    Cancelled(uuid::Uuid),

    #[error(transparent)]
    Store(#[from] loom_store::StoreError),

    #[error(transparent)]
    Wasm(#[from] loom_wasm::WasmError),

    #[error(transparent)]
    Agent(#[from] loom_agent::AgentError),

    #[error(transparent)]
    Core(#[from] loom_core::CoreError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type EngineResult<T> = std::result::Result<T, EngineError>;
