//! Agent Runner - auto-run batch engine
//!
//! This crate runs agent CLIs (Claude Code, OpenCode, Codex, Gemini CLI)
//! non-interactively against markdown task documents, one task per call,
//! optionally inside an isolated git worktree.

pub mod batch;
mod error;
mod event;
mod executor;
mod parser;
mod process;
mod spawner;

pub use batch::{BatchOutcome, BatchRequest, BroadcastSink, Collaborators, OrchestratorConfig, WorktreeProvider};
pub use error::{ExecutorError, Result};
pub use event::{classify_error, AgentEvent, AgentRunOutput, OutputStream};
pub use executor::BatchExecutor;
pub use parser::{create_parser, OutputParser};
pub use process::{run_agent, AgentConfig, AgentProcess, AgentType, OutputReaderHandle};
pub use spawner::{AgentSpawner, CliAgentSpawner, SpawnRequest, SpawnResult};
