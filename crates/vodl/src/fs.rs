// File-system service: scoped temp directories, atomic moves, recursive
// cleanup. Every job owns exactly one temp directory created here.

use std::path::{Path, PathBuf};

use rand::RngExt;
use tracing::debug;

use crate::error::FileSystemError;

const TEMP_DIR_PREFIX: &str = "vodl";

#[derive(Debug, Clone, Copy, Default)]
pub struct FsService;

impl FsService {
    pub fn new() -> Self {
        Self
    }

    pub async fn create_dir_all(&self, path: &Path) -> Result<(), FileSystemError> {
        tokio::fs::create_dir_all(path)
            .await
            .map_err(|e| FileSystemError::from_io(path, &e, false))
    }

    pub async fn exists(&self, path: &Path) -> bool {
        tokio::fs::try_exists(path).await.unwrap_or(false)
    }

    /// Remove a directory tree; a missing directory counts as success.
    pub async fn remove_dir_recursively(&self, path: &Path) -> Result<(), FileSystemError> {
        match tokio::fs::remove_dir_all(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(FileSystemError::from_io(path, &e, true)),
        }
    }

    /// Create a uniquely named directory under the system temp dir.
    ///
    /// The optional salt becomes part of the name so a job's scratch space
    /// is recognizable on disk.
    pub async fn create_temp_dir(&self, salt: Option<&str>) -> Result<PathBuf, FileSystemError> {
        let base = std::env::temp_dir();
        let salt = salt.map(|s| format!("{s}-")).unwrap_or_default();
        // A handful of attempts is plenty; collisions need a 32-bit tie.
        for _ in 0..16 {
            let suffix: u32 = rand::rng().random_range(0..u32::MAX);
            let path = base.join(format!("{TEMP_DIR_PREFIX}-{salt}{suffix:08x}"));
            match tokio::fs::create_dir(&path).await {
                Ok(()) => {
                    debug!(path = %path.display(), "Created temp directory");
                    return Ok(path);
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(FileSystemError::from_io(path, &e, false)),
            }
        }
        Err(FileSystemError::CreateFailed {
            path: base,
            reason: "could not find a free temp directory name".to_owned(),
        })
    }

    /// Move a file, falling back to copy+remove when rename crosses a
    /// file-system boundary.
    pub async fn move_file(&self, from: &Path, to: &Path) -> Result<(), FileSystemError> {
        match tokio::fs::rename(from, to).await {
            Ok(()) => Ok(()),
            Err(rename_err) => {
                tokio::fs::copy(from, to).await.map_err(|e| {
                    // Prefer the copy error but keep the rename context.
                    FileSystemError::WriteFailed {
                        path: to.to_path_buf(),
                        reason: format!("rename failed ({rename_err}), copy failed: {e}"),
                    }
                })?;
                tokio::fs::remove_file(from)
                    .await
                    .map_err(|e| FileSystemError::from_io(from, &e, true))
            }
        }
    }
}
