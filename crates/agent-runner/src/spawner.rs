//! Agent spawning seam used by the batch engine

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use autorun_core::batch::{AgentError, AgentErrorKind, UsageStats};
use tracing::{info, warn};

use crate::event::classify_error;
use crate::process::{run_agent, AgentConfig, AgentType};

/// One agent call for one task
#[derive(Debug, Clone)]
pub struct SpawnRequest {
    /// Batch session the call belongs to
    pub session_id: String,
    pub prompt: String,
    /// Directory the agent works in
    pub cwd: PathBuf,
}

/// Result of one agent call
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SpawnResult {
    pub success: bool,
    pub response: Option<String>,
    pub agent_session_id: Option<String>,
    pub usage: Option<UsageStats>,
    /// Set when the call failed
    pub error: Option<AgentError>,
}

impl SpawnResult {
    pub fn succeeded(response: impl Into<String>) -> Self {
        Self {
            success: true,
            response: Some(response.into()),
            ..Default::default()
        }
    }

    pub fn failed(error: AgentError) -> Self {
        Self {
            success: false,
            error: Some(error),
            ..Default::default()
        }
    }
}

/// Runs an agent against a prompt
///
/// Implementations never fail: problems are reported through
/// [`SpawnResult::error`].
#[async_trait]
pub trait AgentSpawner: Send + Sync {
    async fn spawn(&self, request: SpawnRequest) -> SpawnResult;
}

/// Spawner running one of the supported agent CLIs per call
#[derive(Debug, Clone)]
pub struct CliAgentSpawner {
    agent_type: AgentType,
    env: Vec<(String, String)>,
    timeout: Option<Duration>,
    program: Option<String>,
}

impl CliAgentSpawner {
    pub fn new(agent_type: AgentType) -> Self {
        Self {
            agent_type,
            env: Vec::new(),
            timeout: None,
            program: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Run a different executable with the agent's arguments
    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = Some(program.into());
        self
    }

    pub fn agent_type(&self) -> AgentType {
        self.agent_type
    }
}

#[async_trait]
impl AgentSpawner for CliAgentSpawner {
    async fn spawn(&self, request: SpawnRequest) -> SpawnResult {
        let config = AgentConfig {
            agent_type: self.agent_type,
            working_dir: request.cwd,
            prompt: request.prompt,
            env: self.env.clone(),
            timeout: self.timeout,
            program: self.program.clone(),
        };
        let agent_id = self.agent_type.as_str();

        let output = match run_agent(&config).await {
            Ok(output) => output,
            Err(e) => {
                warn!(session_id = %request.session_id, "Agent call failed: {}", e);
                let message = e.to_string();
                let kind = match classify_error(&message) {
                    AgentErrorKind::Unknown => AgentErrorKind::AgentCrashed,
                    kind => kind,
                };
                return SpawnResult::failed(AgentError::new(kind, message, agent_id));
            }
        };

        let usage = (!output.usage.is_empty()).then_some(output.usage);
        if output.succeeded() {
            info!(
                session_id = %request.session_id,
                tool_calls = output.tool_calls,
                "Agent call finished"
            );
            return SpawnResult {
                success: true,
                response: Some(output.response()),
                agent_session_id: output.agent_session_id,
                usage,
                error: None,
            };
        }

        let message = output.failure_message();
        warn!(
            session_id = %request.session_id,
            exit_code = ?output.exit_code,
            "Agent reported failure: {}",
            message
        );
        SpawnResult {
            success: false,
            response: Some(output.response()).filter(|r| !r.is_empty()),
            agent_session_id: output.agent_session_id,
            usage,
            error: Some(AgentError::new(classify_error(&message), message, agent_id)),
        }
    }
}
