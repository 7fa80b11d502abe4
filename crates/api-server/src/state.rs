//! Application state

use std::path::{Path, PathBuf};
use std::sync::Arc;

use agent_runner::BatchExecutor;
use autorun_core::history::JsonlHistoryStore;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    executor: Arc<BatchExecutor>,
    history: JsonlHistoryStore,
    data_dir: PathBuf,
    repo_path: PathBuf,
}

impl AppState {
    pub fn new(
        executor: Arc<BatchExecutor>,
        history: JsonlHistoryStore,
        data_dir: PathBuf,
        repo_path: PathBuf,
    ) -> Self {
        Self {
            inner: Arc::new(AppStateInner {
                executor,
                history,
                data_dir,
                repo_path,
            }),
        }
    }

    pub fn executor(&self) -> &Arc<BatchExecutor> {
        &self.inner.executor
    }

    pub fn history(&self) -> &JsonlHistoryStore {
        &self.inner.history
    }

    pub fn data_dir(&self) -> &Path {
        &self.inner.data_dir
    }

    /// Default working directory for runs that don't name one
    pub fn repo_path(&self) -> &Path {
        &self.inner.repo_path
    }
}
