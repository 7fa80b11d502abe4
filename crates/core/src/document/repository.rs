//! Document repository trait
//!
//! Documents are addressed by the folder a run works in and a filename
//! relative to it.

use async_trait::async_trait;
use std::path::{Path, PathBuf};

use crate::Result;

/// Storage interface for task documents and their backups
#[async_trait]
pub trait DocumentRepository: Send + Sync {
    /// Read a document's content
    async fn read(&self, folder: &Path, filename: &str) -> Result<String>;

    /// Replace a document's content
    async fn write(&self, folder: &Path, filename: &str, content: &str) -> Result<()>;

    /// Copy the document to its backup, replacing any previous backup
    async fn create_backup(&self, folder: &Path, filename: &str) -> Result<PathBuf>;

    /// Copy the backup back over the document
    async fn restore_backup(&self, folder: &Path, filename: &str) -> Result<()>;

    /// Remove one document's backup, returning whether it existed
    async fn delete_backup(&self, folder: &Path, filename: &str) -> Result<bool>;

    /// Remove the backups of the named documents, returning how many existed
    ///
    /// Other files under `folder` are left alone, whatever their name.
    async fn delete_backups(&self, folder: &Path, filenames: &[String]) -> Result<usize>;

    async fn has_backup(&self, folder: &Path, filename: &str) -> Result<bool>;
}
