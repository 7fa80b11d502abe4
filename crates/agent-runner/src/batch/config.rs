//! Batch engine configuration

use std::time::Duration;

/// Consecutive no-change agent calls before a document counts as stalled
pub const DEFAULT_STALL_THRESHOLD: u32 = 2;

/// Delay used to coalesce progress broadcasts
pub const DEFAULT_BROADCAST_DEBOUNCE: Duration = Duration::from_millis(200);

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub stall_threshold: u32,
    pub broadcast_debounce: Duration,
    /// Upper bound for a single agent call
    pub agent_timeout: Option<Duration>,
    /// Pause the run when an agent call fails instead of counting it as no progress
    pub pause_on_agent_error: bool,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            stall_threshold: DEFAULT_STALL_THRESHOLD,
            broadcast_debounce: DEFAULT_BROADCAST_DEBOUNCE,
            agent_timeout: None,
            pause_on_agent_error: true,
        }
    }
}

impl OrchestratorConfig {
    /// Read overrides from `AUTORUN_*` environment variables
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            stall_threshold: env_u64("AUTORUN_STALL_THRESHOLD")
                .and_then(|v| u32::try_from(v).ok())
                .filter(|v| *v > 0)
                .unwrap_or(defaults.stall_threshold),
            broadcast_debounce: env_u64("AUTORUN_BROADCAST_DEBOUNCE_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.broadcast_debounce),
            agent_timeout: env_u64("AUTORUN_AGENT_TIMEOUT_SECS")
                .filter(|v| *v > 0)
                .map(Duration::from_secs)
                .or(defaults.agent_timeout),
            pause_on_agent_error: env_flag(
                "AUTORUN_PAUSE_ON_AGENT_ERROR",
                defaults.pause_on_agent_error,
            ),
        }
    }

    pub fn with_stall_threshold(mut self, threshold: u32) -> Self {
        self.stall_threshold = threshold.max(1);
        self
    }

    pub fn with_broadcast_debounce(mut self, debounce: Duration) -> Self {
        self.broadcast_debounce = debounce;
        self
    }

    pub fn with_pause_on_agent_error(mut self, pause: bool) -> Self {
        self.pause_on_agent_error = pause;
        self
    }
}

/// Read a boolean switch, falling back to `default` when unset or unrecognised
pub fn env_flag(name: &str, default: bool) -> bool {
    match std::env::var(name) {
        Ok(raw) => match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => true,
            "0" | "false" | "no" | "off" => false,
            _ => default,
        },
        Err(_) => default,
    }
}

fn env_u64(name: &str) -> Option<u64> {
    std::env::var(name).ok()?.trim().parse().ok()
}
