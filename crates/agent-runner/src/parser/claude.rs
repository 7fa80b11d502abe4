//! Parser for Claude Code `--output-format stream-json` output

use autorun_core::batch::UsageStats;
use serde_json::Value;

use super::OutputParser;
use crate::event::{AgentEvent, OutputStream};

/// Parser for Claude Code stream-json lines
pub struct ClaudeStreamParser;

impl ClaudeStreamParser {
    pub fn new() -> Self {
        Self
    }
}

impl Default for ClaudeStreamParser {
    fn default() -> Self {
        Self::new()
    }
}

fn str_field(value: &Value, key: &str) -> Option<String> {
    value.get(key).and_then(Value::as_str).map(str::to_string)
}

fn parse_usage(message: &Value) -> Option<UsageStats> {
    let usage = message.get("usage")?;
    let count = |key: &str| usage.get(key).and_then(Value::as_u64).unwrap_or(0);
    Some(UsageStats {
        input_tokens: count("input_tokens"),
        output_tokens: count("output_tokens"),
        cache_read_tokens: count("cache_read_input_tokens"),
        cache_creation_tokens: count("cache_creation_input_tokens"),
        total_cost_usd: message
            .get("total_cost_usd")
            .and_then(Value::as_f64)
            .unwrap_or(0.0),
    })
}

fn parse_assistant(message: &Value) -> Option<AgentEvent> {
    let content = message.get("message")?.get("content")?.as_array()?;

    let text = content
        .iter()
        .filter(|block| block.get("type").and_then(Value::as_str) == Some("text"))
        .filter_map(|block| block.get("text").and_then(Value::as_str))
        .collect::<Vec<_>>()
        .join("\n");
    if !text.is_empty() {
        return Some(AgentEvent::Message { content: text });
    }

    content
        .iter()
        .find(|block| block.get("type").and_then(Value::as_str) == Some("tool_use"))
        .map(|block| AgentEvent::ToolCall {
            tool: str_field(block, "name").unwrap_or_default(),
            args: block.get("input").cloned().unwrap_or(Value::Null),
        })
}

impl OutputParser for ClaudeStreamParser {
    fn parse(&mut self, line: &str, stream: OutputStream) -> AgentEvent {
        let raw = || AgentEvent::RawOutput {
            stream,
            content: line.to_string(),
        };

        let trimmed = line.trim();
        if stream == OutputStream::Stderr || !trimmed.starts_with('{') {
            return raw();
        }
        let Ok(message) = serde_json::from_str::<Value>(trimmed) else {
            return raw();
        };

        let event = match message.get("type").and_then(Value::as_str) {
            Some("system") => str_field(&message, "session_id")
                .map(|session_id| AgentEvent::SessionStarted { session_id }),
            Some("assistant") => parse_assistant(&message),
            Some("result") => {
                let is_error = message
                    .get("is_error")
                    .and_then(Value::as_bool)
                    .unwrap_or(false)
                    || message.get("subtype").and_then(Value::as_str).is_some_and(|s| s != "success");
                Some(AgentEvent::Result {
                    content: str_field(&message, "result").unwrap_or_default(),
                    is_error,
                    session_id: str_field(&message, "session_id"),
                    usage: parse_usage(&message),
                })
            }
            Some("error") => Some(AgentEvent::Error {
                message: message
                    .get("error")
                    .and_then(|e| e.get("message").or(Some(e)))
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .unwrap_or_else(|| trimmed.to_string()),
                recoverable: true,
            }),
            _ => None,
        };

        event.unwrap_or_else(raw)
    }
}
