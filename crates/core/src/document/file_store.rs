//! File-based document storage
//!
//! Documents live on disk under the run's folder. Backups sit beside the
//! document as `<name>.backup.md`.

use async_trait::async_trait;
use std::path::{Component, Path, PathBuf};
use tracing::debug;

use super::repository::DocumentRepository;
use crate::{Error, Result};

pub const BACKUP_SUFFIX: &str = ".backup.md";

/// Resolve a document filename inside `folder`
///
/// Filenames without an extension get `.md`. Absolute paths, `..`
/// components and backup names are rejected.
pub fn document_path(folder: &Path, filename: &str) -> Result<PathBuf> {
    let relative = Path::new(filename);
    if filename.trim().is_empty() {
        return Err(Error::InvalidInput("Document filename is empty".to_string()));
    }
    if relative
        .components()
        .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
    {
        return Err(Error::InvalidInput(format!(
            "Document filename must stay inside the folder: {filename}"
        )));
    }

    let mut path = folder.join(relative);
    if path.extension().is_none() {
        path.set_extension("md");
    }
    if is_backup(&path) {
        return Err(Error::InvalidInput(format!(
            "Document filename is reserved for backups: {filename}"
        )));
    }
    Ok(path)
}

/// Path of the backup kept for a document
///
/// `plan.md` is backed up as `plan.backup.md`; other extensions keep their
/// full name, so `plan.txt` becomes `plan.txt.backup.md`.
pub fn backup_path(folder: &Path, filename: &str) -> Result<PathBuf> {
    let path = document_path(folder, filename)?;
    let name = path
        .file_name()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let base = name.strip_suffix(".md").unwrap_or(&name);
    Ok(path.with_file_name(format!("{base}{BACKUP_SUFFIX}")))
}

fn is_backup(path: &Path) -> bool {
    path.file_name()
        .and_then(|name| name.to_str())
        .is_some_and(|name| name.ends_with(BACKUP_SUFFIX))
}

/// Document store on the local filesystem
#[derive(Debug, Clone, Default)]
pub struct FileDocumentStore;

impl FileDocumentStore {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl DocumentRepository for FileDocumentStore {
    async fn read(&self, folder: &Path, filename: &str) -> Result<String> {
        let path = document_path(folder, filename)?;
        match tokio::fs::read_to_string(&path).await {
            Ok(content) => Ok(content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(Error::DocumentNotFound(path)),
            Err(e) => Err(e.into()),
        }
    }

    async fn write(&self, folder: &Path, filename: &str, content: &str) -> Result<()> {
        let path = document_path(folder, filename)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, content).await?;
        Ok(())
    }

    async fn create_backup(&self, folder: &Path, filename: &str) -> Result<PathBuf> {
        let path = document_path(folder, filename)?;
        let backup = backup_path(folder, filename)?;
        if !tokio::fs::try_exists(&path).await? {
            return Err(Error::DocumentNotFound(path));
        }
        tokio::fs::copy(&path, &backup).await?;
        debug!(document = %path.display(), "Created document backup");
        Ok(backup)
    }

    async fn restore_backup(&self, folder: &Path, filename: &str) -> Result<()> {
        let path = document_path(folder, filename)?;
        let backup = backup_path(folder, filename)?;
        if !tokio::fs::try_exists(&backup).await? {
            return Err(Error::BackupNotFound(backup));
        }
        tokio::fs::copy(&backup, &path).await?;
        debug!(document = %path.display(), "Restored document from backup");
        Ok(())
    }

    async fn delete_backup(&self, folder: &Path, filename: &str) -> Result<bool> {
        let backup = backup_path(folder, filename)?;
        match tokio::fs::remove_file(&backup).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete_backups(&self, folder: &Path, filenames: &[String]) -> Result<usize> {
        let mut removed = 0;
        for filename in filenames {
            if self.delete_backup(folder, filename).await? {
                removed += 1;
            }
        }
        if removed > 0 {
            debug!(folder = %folder.display(), removed, "Deleted document backups");
        }
        Ok(removed)
    }

    async fn has_backup(&self, folder: &Path, filename: &str) -> Result<bool> {
        let backup = backup_path(folder, filename)?;
        Ok(tokio::fs::try_exists(&backup).await?)
    }
}
