use thiserror::Error;

/// Core error type shared by the data model helpers in this crate.
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("invalid state transition: {from:?} -> {to:?}")]
    InvalidTransition { from: String, to: String },

    #[error("workflow step invariant violated: {0}")]
    InvalidStep(String),

    #[error("invalid setting {key}: {reason}")]
    InvalidSetting { key: String, reason: String },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type CoreResult<T> = std::result::Result<T, CoreError>;
