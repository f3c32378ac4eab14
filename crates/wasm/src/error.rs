use thiserror::Error;

/// Errors surfaced by the WASM executor. `Capability` carries the host
/// ABI's error-code sentinel so callers that care about the wire value
/// (tests, the executor's own retry-free error path) don't have to
/// re-derive it from the message.
#[derive(Error, Debug)]
pub enum WasmError {
    #[error("module not found: {0}")]
    ModuleNotFound(uuid::Uuid),

    #[error("invalid module bytes: {0}")]
    InvalidModule(String),

    #[error("capability denied: {reason} (code {code:#x})")]
    Capability { reason: String, code: u32 },

    #[error("execution deadline exceeded")]
    Deadline,

    #[error("execution cancelled")]
    Cancelled,

    #[error("upstream call failed: {0}")]
    Upstream(String),

    #[error("instantiation failed: {0}")]
    Instantiation(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type WasmResult<T> = std::result::Result<T, WasmError>;

/// The error-code sentinel band from the host ABI: any u32 return value
/// `>= ERROR_BAND_START` is an error, not a byte count.
pub const ERROR_BAND_START: u32 = 0xFFFF_FFF0;

pub const ERR_GENERIC: u32 = 0xFFFF_FFF0;
pub const ERR_NOT_FOUND: u32 = 0xFFFF_FFF1;
pub const ERR_INVALID_ARG: u32 = 0xFFFF_FFF2;
pub const ERR_MEMORY_ACCESS: u32 = 0xFFFF_FFF3;
pub const ERR_CAPABILITY_DENIED: u32 = 0xFFFF_FFFE;
pub const ERR_UPSTREAM: u32 = 0xFFFF_FFFF;

#[must_use]
pub fn is_error_code(value: u32) -> bool {
    value >= ERROR_BAND_START
}
