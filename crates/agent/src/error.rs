use thiserror::Error;

#[derive(Error, Debug)]
pub enum AgentError {
    #[error("agent '{0}' not found")]
    AgentNotFound(String),

    #[error("workflow '{0}' not found")]
    WorkflowNotFound(String),

    #[error("invalid model string: {0}")]
    InvalidModel(String),

    #[error("upstream LLM error: {0}")]
    Upstream(String),

    #[error("LLM returned no choices")]
    EmptyCompletion,

    #[error(transparent)]
    Store(#[from] loom_store::StoreError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type AgentResult<T> = std::result::Result<T, AgentError>;
