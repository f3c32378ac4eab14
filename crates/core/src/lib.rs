//! Shared data model for the workflow execution platform.
//!
//! This crate has no I/O: it defines the entities from the data model
//! (providers, agents, tools, workflows, jobs), the job status state
//! machine, and the small set of conventions ("carry") threaded between
//! workflow steps by the scheduler.

pub mod carry;
pub mod error;
pub mod model;

pub use error::{CoreError, CoreResult};
