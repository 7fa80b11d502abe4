//! Runs one agent call against one task document and measures the result

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use autorun_core::batch::{AgentError, UsageStats};
use autorun_core::document::{
    count_tasks, document_path, first_unchecked_task, DocumentRepository, TaskCounts,
};
use tokio::time::Instant;
use tracing::debug;

use super::template::{build_prompt, substitute, TemplateContext};
use crate::error::Result;
use crate::spawner::{AgentSpawner, SpawnRequest};

/// What one task call is about
#[derive(Debug, Clone)]
pub struct TaskInput<'a> {
    pub session_id: &'a str,
    pub session_name: &'a str,
    pub folder: &'a Path,
    pub filename: &'a str,
    pub prompt_template: &'a str,
    /// Directory the agent works in
    pub cwd: &'a Path,
    /// Zero-based loop iteration
    pub loop_iteration: u32,
    pub git_branch: Option<&'a str>,
}

/// Measured outcome of one task call
#[derive(Debug, Clone)]
pub struct TaskRun {
    /// Document content the agent started from, after variable substitution
    pub content_before: String,
    pub content_after: String,
    pub counts_before: TaskCounts,
    pub counts_after: TaskCounts,
    /// Tasks newly checked by the call
    pub completed: u32,
    /// Tasks the agent added to the document
    pub added: u32,
    pub task_description: Option<String>,
    pub response: Option<String>,
    pub agent_session_id: Option<String>,
    pub usage: Option<UsageStats>,
    pub error: Option<AgentError>,
    pub elapsed: Duration,
}

impl TaskRun {
    /// Neither the content nor the checkmarks moved
    pub fn made_no_change(&self) -> bool {
        self.completed == 0 && self.content_before == self.content_after
    }
}

/// Document name as shown to the agent: the filename without `.md`
pub fn document_name(filename: &str) -> &str {
    filename.strip_suffix(".md").unwrap_or(filename)
}

pub struct DocumentProcessor {
    documents: Arc<dyn DocumentRepository>,
    spawner: Arc<dyn AgentSpawner>,
}

impl DocumentProcessor {
    pub fn new(documents: Arc<dyn DocumentRepository>, spawner: Arc<dyn AgentSpawner>) -> Self {
        Self { documents, spawner }
    }

    pub fn documents(&self) -> &Arc<dyn DocumentRepository> {
        &self.documents
    }

    /// Read a document and count its checkboxes
    pub async fn count(&self, folder: &Path, filename: &str) -> Result<TaskCounts> {
        let content = self.documents.read(folder, filename).await?;
        Ok(count_tasks(&content))
    }

    /// Hand the document's next task to the agent
    pub async fn process_task(&self, input: TaskInput<'_>) -> Result<TaskRun> {
        let path = document_path(input.folder, input.filename)?;
        let context = template_context(&input, &path);

        let raw = self.documents.read(input.folder, input.filename).await?;
        let content_before = substitute(&raw, &context);
        if content_before != raw {
            debug!(document = input.filename, "Writing back substituted template variables");
            self.documents
                .write(input.folder, input.filename, &content_before)
                .await?;
        }

        let counts_before = count_tasks(&content_before);
        let task_description = first_unchecked_task(&content_before);
        let prompt = build_prompt(input.prompt_template, &context);

        let started = Instant::now();
        let result = self
            .spawner
            .spawn(SpawnRequest {
                session_id: input.session_id.to_string(),
                prompt,
                cwd: input.cwd.to_path_buf(),
            })
            .await;
        let elapsed = started.elapsed();

        let content_after = self.documents.read(input.folder, input.filename).await?;
        let counts_after = count_tasks(&content_after);
        let completed = counts_after.checked.saturating_sub(counts_before.checked);
        let added = counts_after.total().saturating_sub(counts_before.total());

        debug!(
            document = input.filename,
            completed,
            added,
            remaining = counts_after.unchecked,
            "Task call measured"
        );

        Ok(TaskRun {
            content_before,
            content_after,
            counts_before,
            counts_after,
            completed,
            added,
            task_description,
            response: result.response,
            agent_session_id: result.agent_session_id,
            usage: result.usage,
            error: if result.success { None } else { result.error },
            elapsed,
        })
    }
}

fn template_context(input: &TaskInput<'_>, path: &Path) -> TemplateContext {
    TemplateContext {
        agent_name: input.session_name.to_string(),
        agent_path: input.cwd.display().to_string(),
        agent_session_id: None,
        document_name: document_name(input.filename).to_string(),
        document_path: path.display().to_string(),
        autorun_folder: input.folder.display().to_string(),
        loop_number: input.loop_iteration + 1,
        git_branch: input.git_branch.map(str::to_string),
        cwd: input.cwd.display().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spawner::SpawnResult;
    use async_trait::async_trait;
    use autorun_core::batch::AgentErrorKind;
    use autorun_core::document::FileDocumentStore;
    use tempfile::TempDir;

    /// Checks the first box of the document whose path is the prompt
    struct CheckFirstBox;

    #[async_trait]
    impl AgentSpawner for CheckFirstBox {
        async fn spawn(&self, request: SpawnRequest) -> SpawnResult {
            let content = tokio::fs::read_to_string(&request.prompt).await.unwrap();
            let updated = content.replacen("- [ ]", "- [x]", 1) + "- [ ] follow-up\n";
            tokio::fs::write(&request.prompt, updated).await.unwrap();
            SpawnResult::succeeded("done")
        }
    }

    struct Failing;

    #[async_trait]
    impl AgentSpawner for Failing {
        async fn spawn(&self, _request: SpawnRequest) -> SpawnResult {
            SpawnResult::failed(AgentError::new(AgentErrorKind::RateLimited, "429", "mock"))
        }
    }

    fn input<'a>(folder: &'a Path) -> TaskInput<'a> {
        TaskInput {
            session_id: "s1",
            session_name: "agent",
            folder,
            filename: "setup.md",
            prompt_template: "{{DOCUMENT_PATH}}",
            cwd: folder,
            loop_iteration: 0,
            git_branch: None,
        }
    }

    #[tokio::test]
    async fn test_measures_completed_and_added() {
        let dir = TempDir::new().unwrap();
        tokio::fs::write(dir.path().join("setup.md"), "# Setup {{DOCUMENT_NAME}}\n- [ ] one\n- [ ] two\n")
            .await
            .unwrap();

        let processor = DocumentProcessor::new(Arc::new(FileDocumentStore::new()), Arc::new(CheckFirstBox));
        let run = processor.process_task(input(dir.path())).await.unwrap();

        assert_eq!(run.content_before, "# Setup setup\n- [ ] one\n- [ ] two\n");
        assert_eq!(run.task_description.as_deref(), Some("one"));
        assert_eq!(run.counts_before.unchecked, 2);
        assert_eq!(run.completed, 1);
        assert_eq!(run.added, 1);
        assert_eq!(run.counts_after.unchecked, 2);
        assert!(!run.made_no_change());
        assert!(run.error.is_none());
    }

    #[tokio::test]
    async fn test_failed_call_is_no_change() {
        let dir = TempDir::new().unwrap();
        tokio::fs::write(dir.path().join("setup.md"), "- [ ] one\n").await.unwrap();

        let processor = DocumentProcessor::new(Arc::new(FileDocumentStore::new()), Arc::new(Failing));
        let run = processor.process_task(input(dir.path())).await.unwrap();

        assert!(run.made_no_change());
        assert_eq!(run.error.unwrap().kind, AgentErrorKind::RateLimited);
    }

    #[test]
    fn test_document_name() {
        assert_eq!(document_name("setup.md"), "setup");
        assert_eq!(document_name("notes.txt"), "notes.txt");
    }
}
