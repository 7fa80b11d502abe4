//! Server settings read from the environment

use std::path::PathBuf;
use std::time::Duration;

use agent_runner::batch::env_flag;
use agent_runner::AgentType;

pub const DEFAULT_REST_PORT: u16 = 8081;
pub const DEFAULT_SOCKET_PORT: u16 = 8080;
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub data_dir: PathBuf,
    pub repo_path: PathBuf,
    pub agent_type: AgentType,
    /// Overrides the agent binary looked up on `PATH`
    pub agent_program: Option<String>,
    pub rest_port: u16,
    pub socket_port: u16,
    pub shutdown_grace: Duration,
    /// Also accept Socket.IO long-polling, not just WebSocket
    pub allow_polling: bool,
}

impl ServerConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let agent_type = match std::env::var("AUTORUN_AGENT") {
            Ok(raw) => raw.parse()?,
            Err(_) => AgentType::ClaudeCode,
        };

        Ok(Self {
            data_dir: env_path("AUTORUN_DATA_DIR", ".autorun-data"),
            repo_path: env_path("AUTORUN_REPO_PATH", "."),
            agent_type,
            agent_program: std::env::var("AUTORUN_AGENT_PROGRAM")
                .ok()
                .filter(|p| !p.trim().is_empty()),
            rest_port: env_port("AUTORUN_REST_PORT", DEFAULT_REST_PORT),
            socket_port: env_port("AUTORUN_SOCKET_PORT", DEFAULT_SOCKET_PORT),
            shutdown_grace: std::env::var("AUTORUN_SHUTDOWN_GRACE_SECS")
                .ok()
                .and_then(|raw| raw.trim().parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_SHUTDOWN_GRACE),
            allow_polling: env_flag("AUTORUN_SOCKET_POLLING", false),
        })
    }
}

fn env_path(name: &str, default: &str) -> PathBuf {
    std::env::var(name)
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(default))
}

fn env_port(name: &str, default: u16) -> u16 {
    match std::env::var(name) {
        Ok(raw) => raw.trim().parse().unwrap_or_else(|_| {
            tracing::warn!("Ignoring invalid {}={:?}, using {}", name, raw, default);
            default
        }),
        Err(_) => default,
    }
}
