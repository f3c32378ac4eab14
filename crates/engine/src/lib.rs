//! The Scheduler/Engine: a poller task plus a worker pool that drains
//! queued jobs from the Job Store, runs each workflow step through
//! either the Agent Runtime or the WASM Executor, and threads the
//! "carry" value between steps. Also the synchronous waiter (component
//! F) and the glue that lets `loom-agent`/`loom-wasm` call back into
//! the rest of the system without either crate depending on this one.

pub mod config;
pub mod error;
pub mod host;
pub mod metrics;
pub mod scheduler;
pub mod waiter;

pub use config::EngineConfig;
pub use error::{EngineError, EngineResult};
pub use host::{EngineExecutionHost, EngineWorkflowSubmitter};
pub use scheduler::Engine;
pub use waiter::SyncWaiter;
