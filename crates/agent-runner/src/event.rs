//! Event types emitted while an agent process runs

use autorun_core::batch::{AgentErrorKind, UsageStats};
use serde::{Deserialize, Serialize};

/// Events parsed from agent output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    /// The agent announced the id of its conversation
    SessionStarted { session_id: String },

    /// Agent sent a message
    Message { content: String },

    /// Agent called a tool
    ToolCall {
        tool: String,
        args: serde_json::Value,
    },

    /// Final result of a non-interactive run
    Result {
        content: String,
        is_error: bool,
        session_id: Option<String>,
        usage: Option<UsageStats>,
    },

    /// Agent encountered an error
    Error { message: String, recoverable: bool },

    /// Raw output from the agent
    RawOutput {
        stream: OutputStream,
        content: String,
    },
}

/// Output stream type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// Everything collected from one agent run
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AgentRunOutput {
    pub result: Option<String>,
    pub messages: Vec<String>,
    pub raw_stdout: Vec<String>,
    pub stderr: Vec<String>,
    pub errors: Vec<String>,
    pub agent_session_id: Option<String>,
    pub usage: UsageStats,
    pub tool_calls: usize,
    pub exit_code: Option<i32>,
}

impl AgentRunOutput {
    pub fn apply(&mut self, event: AgentEvent) {
        match event {
            AgentEvent::SessionStarted { session_id } => {
                self.agent_session_id.get_or_insert(session_id);
            }
            AgentEvent::Message { content } => self.messages.push(content),
            AgentEvent::ToolCall { .. } => self.tool_calls += 1,
            AgentEvent::Result {
                content,
                is_error,
                session_id,
                usage,
            } => {
                if is_error {
                    self.errors.push(content.clone());
                }
                self.result = Some(content);
                if let Some(session_id) = session_id {
                    self.agent_session_id = Some(session_id);
                }
                if let Some(usage) = usage {
                    self.usage += usage;
                }
            }
            AgentEvent::Error { message, .. } => self.errors.push(message),
            AgentEvent::RawOutput {
                stream: OutputStream::Stdout,
                content,
            } => self.raw_stdout.push(content),
            AgentEvent::RawOutput {
                stream: OutputStream::Stderr,
                content,
            } => self.stderr.push(content),
        }
    }

    /// Response text: the final result, else the messages, else raw stdout
    pub fn response(&self) -> String {
        if let Some(result) = &self.result {
            return result.clone();
        }
        if !self.messages.is_empty() {
            return self.messages.join("\n");
        }
        self.raw_stdout.join("\n")
    }

    pub fn succeeded(&self) -> bool {
        self.exit_code == Some(0) && self.errors.is_empty()
    }

    /// Best description of why the run failed
    pub fn failure_message(&self) -> String {
        if let Some(error) = self.errors.last() {
            return error.clone();
        }
        let stderr = self
            .stderr
            .iter()
            .rev()
            .take(5)
            .rev()
            .cloned()
            .collect::<Vec<_>>()
            .join("\n");
        if !stderr.trim().is_empty() {
            return stderr;
        }
        format!("Agent exited with code {:?}", self.exit_code)
    }
}

/// Map an agent error message onto an error kind
pub fn classify_error(message: &str) -> AgentErrorKind {
    let lower = message.to_lowercase();
    let has = |needles: &[&str]| needles.iter().any(|n| lower.contains(n));

    if has(&["rate limit", "rate_limit", "429", "too many requests", "overloaded"]) {
        AgentErrorKind::RateLimited
    } else if has(&[
        "unauthorized",
        "401",
        "invalid api key",
        "authentication",
        "please run /login",
        "oauth token",
    ]) {
        AgentErrorKind::AuthExpired
    } else if has(&[
        "prompt is too long",
        "context length",
        "context window",
        "maximum context",
        "token limit",
    ]) {
        AgentErrorKind::TokenExhaustion
    } else if has(&["permission denied", "eacces", "not permitted"]) {
        AgentErrorKind::PermissionDenied
    } else if has(&["no conversation found", "session not found"]) {
        AgentErrorKind::SessionNotFound
    } else if has(&[
        "econnreset",
        "econnrefused",
        "enotfound",
        "network",
        "connection reset",
        "socket hang up",
    ]) {
        AgentErrorKind::NetworkError
    } else if has(&["timed out", "killed", "crash", "panicked", "exited with code"]) {
        AgentErrorKind::AgentCrashed
    } else {
        AgentErrorKind::Unknown
    }
}
