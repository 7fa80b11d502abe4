//! Agent process management

use std::path::PathBuf;
use std::process::Stdio;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::{ExecutorError, Result};
use crate::event::{AgentEvent, AgentRunOutput, OutputStream};
use crate::parser::create_parser;

/// Supported agent types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentType {
    ClaudeCode,
    OpenCode,
    Codex,
    GeminiCli,
}

impl FromStr for AgentType {
    type Err = ExecutorError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "claude" | "claude-code" | "claudecode" => Ok(Self::ClaudeCode),
            "opencode" => Ok(Self::OpenCode),
            "codex" => Ok(Self::Codex),
            "gemini-cli" | "geminicli" | "gemini" => Ok(Self::GeminiCli),
            _ => Err(ExecutorError::InvalidAgentType {
                agent_type: s.to_string(),
            }),
        }
    }
}

impl AgentType {
    /// Get the canonical string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ClaudeCode => "claude-code",
            Self::OpenCode => "opencode",
            Self::Codex => "codex",
            Self::GeminiCli => "gemini-cli",
        }
    }

    /// Get the command to run this agent
    pub fn command(&self) -> &'static str {
        match self {
            Self::ClaudeCode => {
                if cfg!(target_os = "windows") {
                    "claude.cmd"
                } else {
                    "claude"
                }
            }
            Self::OpenCode => {
                if cfg!(target_os = "windows") {
                    "opencode.cmd"
                } else {
                    "opencode"
                }
            }
            Self::Codex => "codex",
            Self::GeminiCli => "gemini",
        }
    }

    /// Arguments for a single non-interactive run; the prompt goes last
    pub fn batch_args(&self) -> Vec<&'static str> {
        match self {
            Self::ClaudeCode => vec![
                "--print",
                "--verbose",
                "--output-format",
                "stream-json",
                "--dangerously-skip-permissions",
            ],
            Self::OpenCode => vec!["run"],
            Self::Codex => vec!["exec", "--full-auto"],
            Self::GeminiCli => vec!["--yolo", "--prompt"],
        }
    }
}

/// Configuration for an agent process
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Type of agent to run
    pub agent_type: AgentType,
    /// Working directory for the agent
    pub working_dir: PathBuf,
    /// The prompt to send to the agent
    pub prompt: String,
    /// Additional environment variables
    pub env: Vec<(String, String)>,
    /// Upper bound for the whole run
    pub timeout: Option<Duration>,
    /// Override the executable, mainly for wrappers
    pub program: Option<String>,
}

impl AgentConfig {
    pub fn new(agent_type: AgentType, working_dir: impl Into<PathBuf>, prompt: impl Into<String>) -> Self {
        Self {
            agent_type,
            working_dir: working_dir.into(),
            prompt: prompt.into(),
            env: Vec::new(),
            timeout: None,
            program: None,
        }
    }
}

/// Represents a running agent process
pub struct AgentProcess {
    /// The child process
    child: Child,
    /// Agent type
    agent_type: AgentType,
    /// Event sender
    event_tx: mpsc::Sender<AgentEvent>,
}

impl AgentProcess {
    /// Spawn a new agent process
    pub async fn spawn(config: &AgentConfig, event_tx: mpsc::Sender<AgentEvent>) -> Result<Self> {
        let command = config
            .program
            .as_deref()
            .unwrap_or_else(|| config.agent_type.command());
        let args = config.agent_type.batch_args();

        info!(
            "Spawning {} in {:?} with prompt: {}",
            command,
            config.working_dir,
            config.prompt.chars().take(100).collect::<String>()
        );

        let mut cmd = if cfg!(target_os = "windows") && command.ends_with(".cmd") {
            let mut c = Command::new("cmd");
            c.arg("/C").arg(command);
            c
        } else {
            Command::new(command)
        };
        cmd.args(&args).arg(&config.prompt);

        cmd.current_dir(&config.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        for (key, value) in &config.env {
            cmd.env(key, value);
        }

        let child = cmd.spawn().map_err(|e| {
            ExecutorError::spawn_failed_with_source(format!("Failed to spawn {}: {}", command, e), e)
        })?;

        Ok(Self {
            child,
            agent_type: config.agent_type,
            event_tx,
        })
    }

    /// Start reading output from the process
    pub fn start_output_reader(mut self) -> Result<OutputReaderHandle> {
        let stdout = self
            .child
            .stdout
            .take()
            .ok_or_else(|| ExecutorError::spawn_failed("Failed to capture stdout"))?;

        let stderr = self
            .child
            .stderr
            .take()
            .ok_or_else(|| ExecutorError::spawn_failed("Failed to capture stderr"))?;

        let agent_type = self.agent_type;

        let stdout_tx = self.event_tx.clone();
        let stdout_handle = tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            let mut parser = create_parser(agent_type);

            while let Ok(Some(line)) = lines.next_line().await {
                debug!("stdout: {}", line);
                let event = parser.parse(&line, OutputStream::Stdout);
                if stdout_tx.send(event).await.is_err() {
                    warn!("Event channel closed, stopping stdout reader");
                    break;
                }
            }
        });

        let stderr_tx = self.event_tx;
        let stderr_handle = tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            let mut parser = create_parser(agent_type);

            while let Ok(Some(line)) = lines.next_line().await {
                debug!("stderr: {}", line);
                let event = parser.parse(&line, OutputStream::Stderr);
                if stderr_tx.send(event).await.is_err() {
                    warn!("Event channel closed, stopping stderr reader");
                    break;
                }
            }
        });

        Ok(OutputReaderHandle {
            child: self.child,
            stdout_handle,
            stderr_handle,
        })
    }
}

/// Handle for the output reader tasks
pub struct OutputReaderHandle {
    child: Child,
    stdout_handle: tokio::task::JoinHandle<()>,
    stderr_handle: tokio::task::JoinHandle<()>,
}

impl OutputReaderHandle {
    /// Wait for the process to complete
    pub async fn wait(mut self) -> Result<i32> {
        let status = self.child.wait().await?;

        let _ = self.stdout_handle.await;
        let _ = self.stderr_handle.await;

        Ok(status.code().unwrap_or(-1))
    }

    /// Get the process ID
    pub fn pid(&self) -> Option<u32> {
        self.child.id()
    }
}

/// Run an agent to completion and collect its output
///
/// The process is killed if the timeout elapses.
pub async fn run_agent(config: &AgentConfig) -> Result<AgentRunOutput> {
    let (event_tx, mut event_rx) = mpsc::channel(256);
    let process = AgentProcess::spawn(config, event_tx).await?;
    let handle = process.start_output_reader()?;
    debug!("Agent process started with pid {:?}", handle.pid());

    let collect = async move {
        let mut output = AgentRunOutput::default();
        while let Some(event) = event_rx.recv().await {
            output.apply(event);
        }
        output.exit_code = Some(handle.wait().await?);
        Ok(output)
    };

    match config.timeout {
        Some(limit) => tokio::time::timeout(limit, collect)
            .await
            .map_err(|_| ExecutorError::Timeout {
                seconds: limit.as_secs(),
            })?,
        None => collect.await,
    }
}
