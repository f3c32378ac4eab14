//! The small set of conventions the scheduler uses to thread data
//! between workflow steps.
//!
//! Each step receives the previous step's output merged under its own
//! config, and agent/WASM steps disagree about what "the input" and
//! "the output" look like on the wire — this module is the adapter.

use serde_json::{json, Value};

use crate::model::merge_maps;

/// Build the input handed to a step: the step's static `config` with
/// `incoming` (the prior step's carry, or the job's `input_data` for the
/// first step) merged on top, so a later step can override a module's
/// defaults but never its own persisted shape.
#[must_use]
pub fn build_step_input(config: &Value, incoming: &Value) -> Value {
    merge_maps(config, incoming)
}

/// Wrap a plain string as the `{"prompt": ...}` shape the agent runtime
/// emits and WASM steps expect as the simplest form of carry.
#[must_use]
pub fn wrap_prompt(text: impl Into<String>) -> Value {
    json!({ "prompt": text.into() })
}

/// Extract the carry value a step should pass on to the next step.
///
/// Agent steps produce `{"output": "<text>"}`; WASM steps produce
/// arbitrary JSON. The convention: if the step output has an `output`
/// field, that field's value becomes the next step's prompt/carry;
/// otherwise the whole output value is passed through unchanged.
#[must_use]
pub fn next_carry(step_output: &Value) -> Value {
    match step_output.get("output") {
        Some(inner) => inner.clone(),
        None => step_output.clone(),
    }
}

/// Unwrap the `prompt` field a step input carries, if present, falling
/// back to rendering the whole carry as a string for steps that expect
/// a plain-text prompt (e.g. the agent runtime's user message).
#[must_use]
pub fn unwrap_prompt(input: &Value) -> String {
    match input.get("prompt").and_then(Value::as_str) {
        Some(s) => s.to_string(),
        None => match input {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_step_input_merges_with_incoming_precedence() {
        let config = json!({"model": "gpt-4", "temperature": 0.2});
        let incoming = json!({"temperature": 0.9, "prompt": "hi"});
        let merged = build_step_input(&config, &incoming);
        assert_eq!(merged["model"], "gpt-4");
        assert_eq!(merged["temperature"], 0.9);
        assert_eq!(merged["prompt"], "hi");
    }

    #[test]
    fn wrap_and_unwrap_prompt_round_trip() {
        let wrapped = wrap_prompt("hello");
        assert_eq!(unwrap_prompt(&wrapped), "hello");
    }

    #[test]
    fn next_carry_prefers_output_field() {
        let step_output = json!({"output": "result text", "tokens": 42});
        assert_eq!(next_carry(&step_output), json!("result text"));

        let raw = json!({"foo": "bar"});
        assert_eq!(next_carry(&raw), raw);
    }

    #[test]
    fn unwrap_prompt_falls_back_to_plain_string_carry() {
        assert_eq!(unwrap_prompt(&json!("plain text")), "plain text");
    }
}
