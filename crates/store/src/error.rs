use thiserror::Error;
use uuid::Uuid;

/// Errors surfaced by [`crate::PrimitiveStore`] and [`crate::JobStore`]
/// implementations.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },

    #[error("invalid state transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error(transparent)]
    Core(#[from] loom_core::CoreError),

    #[error("storage backend error: {0}")]
    Backend(#[source] anyhow::Error),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

impl StoreError {
    #[must_use]
    pub fn not_found(entity: &'static str, id: Uuid) -> Self {
        StoreError::NotFound {
            entity,
            id: id.to_string(),
        }
    }
}
