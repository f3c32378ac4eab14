//! Agent Runtime: resolves an agent and its provider, assembles a chat
//! request, and runs the bounded tool-call loop against the five
//! built-in tool capabilities. `ExecuteWorkflow` is a thin adapter over
//! an injected [`runtime::WorkflowSubmitter`] so this crate never
//! depends on `loom-engine`.

pub mod error;
pub mod llm_client;
pub mod runtime;
pub mod tools;

#[cfg(test)]
mod tests_support;

pub use error::{AgentError, AgentResult};
pub use runtime::{AgentQueryRequest, AgentRuntime, Completion, CompletionChoice, RoutedTarget, WorkflowSubmitter, route_model};
