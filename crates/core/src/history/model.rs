//! History record types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::batch::UsageStats;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryKind {
    Task,
    Stall,
    LoopSummary,
    BatchSummary,
    PullRequest,
}

/// How a batch run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Completed,
    CompletedWithStalls,
    /// Loop mode gave up after a pass with no progress anywhere
    Stalled,
    Stopped,
}

impl BatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::CompletedWithStalls => "completed with stalls",
            Self::Stalled => "stalled",
            Self::Stopped => "stopped",
        }
    }
}

impl std::fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Progress metadata attached to the final summary
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Achievements {
    pub documents_processed: u32,
    pub tasks_completed: u32,
    pub loops_completed: u32,
    pub stalled_documents: Vec<String>,
    pub tasks_per_hour: f64,
    pub average_task_time_ms: u64,
}

impl Achievements {
    pub fn compute(
        documents_processed: u32,
        tasks_completed: u32,
        loops_completed: u32,
        stalled_documents: Vec<String>,
        elapsed_ms: u64,
        cumulative_task_time_ms: u64,
    ) -> Self {
        let tasks_per_hour = if elapsed_ms == 0 {
            0.0
        } else {
            f64::from(tasks_completed) * 3_600_000.0 / elapsed_ms as f64
        };
        let average_task_time_ms = cumulative_task_time_ms
            .checked_div(u64::from(tasks_completed))
            .unwrap_or(0);

        Self {
            documents_processed,
            tasks_completed,
            loops_completed,
            stalled_documents,
            tasks_per_hour,
            average_task_time_ms,
        }
    }
}

/// One history record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    pub id: Uuid,
    pub session_id: String,
    pub kind: HistoryKind,
    pub timestamp: DateTime<Utc>,
    pub summary: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub loop_iteration: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub elapsed_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<UsageStats>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<BatchStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub achievements: Option<Achievements>,
}

impl HistoryEntry {
    pub fn new(session_id: impl Into<String>, kind: HistoryKind, summary: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            session_id: session_id.into(),
            kind,
            timestamp: Utc::now(),
            summary: summary.into(),
            success: true,
            document: None,
            details: None,
            agent_session_id: None,
            loop_iteration: None,
            elapsed_ms: None,
            usage: None,
            status: None,
            achievements: None,
        }
    }

    /// Record of one agent call against a document
    pub fn task(session_id: impl Into<String>, document: impl Into<String>, summary: impl Into<String>) -> Self {
        Self::new(session_id, HistoryKind::Task, summary).with_document(document)
    }

    /// Record of a document that stopped making progress
    pub fn stall(session_id: impl Into<String>, document: impl Into<String>, reason: impl Into<String>) -> Self {
        let reason = reason.into();
        Self {
            success: false,
            details: Some(reason.clone()),
            ..Self::new(session_id, HistoryKind::Stall, reason)
        }
        .with_document(document)
    }

    pub fn loop_summary(session_id: impl Into<String>, loop_iteration: u32, tasks_completed: u32) -> Self {
        let summary = format!(
            "Loop {} completed: {} task{}",
            loop_iteration + 1,
            tasks_completed,
            if tasks_completed == 1 { "" } else { "s" }
        );
        Self {
            loop_iteration: Some(loop_iteration),
            ..Self::new(session_id, HistoryKind::LoopSummary, summary)
        }
    }

    pub fn batch_summary(session_id: impl Into<String>, status: BatchStatus, achievements: Achievements) -> Self {
        let summary = format!(
            "Auto run {}: {} task{} across {} document{}",
            status,
            achievements.tasks_completed,
            if achievements.tasks_completed == 1 { "" } else { "s" },
            achievements.documents_processed,
            if achievements.documents_processed == 1 { "" } else { "s" },
        );
        Self {
            success: matches!(status, BatchStatus::Completed | BatchStatus::CompletedWithStalls),
            status: Some(status),
            achievements: Some(achievements),
            ..Self::new(session_id, HistoryKind::BatchSummary, summary)
        }
    }

    pub fn pull_request(session_id: impl Into<String>, url: Option<String>, error: Option<String>) -> Self {
        let summary = match (&url, &error) {
            (Some(url), _) => format!("Opened pull request {url}"),
            (None, Some(error)) => format!("Failed to open pull request: {error}"),
            (None, None) => "Failed to open pull request".to_string(),
        };
        Self {
            success: url.is_some(),
            details: url.or(error),
            ..Self::new(session_id, HistoryKind::PullRequest, summary)
        }
    }

    pub fn with_document(mut self, document: impl Into<String>) -> Self {
        self.document = Some(document.into());
        self
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    pub fn with_success(mut self, success: bool) -> Self {
        self.success = success;
        self
    }

    pub fn with_agent_session(mut self, agent_session_id: Option<String>) -> Self {
        self.agent_session_id = agent_session_id;
        self
    }

    pub fn with_loop_iteration(mut self, loop_iteration: u32) -> Self {
        self.loop_iteration = Some(loop_iteration);
        self
    }

    pub fn with_elapsed_ms(mut self, elapsed_ms: u64) -> Self {
        self.elapsed_ms = Some(elapsed_ms);
        self
    }

    pub fn with_usage(mut self, usage: Option<UsageStats>) -> Self {
        self.usage = usage.filter(|u| !u.is_empty());
        self
    }
}
