// Muxer adapter: builds a concat manifest over the downloaded segments and
// invokes the external muxer binary (concat demuxer, stream copy). Encrypted
// segments are decrypted to `dec_*` twins first and the manifest points at
// those.

use std::path::{Path, PathBuf};

use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::crypto;
use crate::error::{EngineError, FileSystemError, MuxerError, OrchestratorError};
use crate::fetch::SegmentDescriptor;

const CONCAT_MANIFEST: &str = "concat.txt";

pub struct MuxerAdapter {
    muxer_path: PathBuf,
}

impl MuxerAdapter {
    pub fn new(muxer_path: impl Into<PathBuf>) -> Self {
        Self {
            muxer_path: muxer_path.into(),
        }
    }

    /// Check that the muxer binary exists. Bare command names are probed
    /// against `PATH`; explicit paths are checked directly.
    pub fn ensure_available(&self) -> Result<(), EngineError> {
        let found = if self.muxer_path.components().count() > 1 || self.muxer_path.is_absolute() {
            self.muxer_path.is_file()
        } else {
            std::env::var_os("PATH").is_some_and(|paths| {
                std::env::split_paths(&paths).any(|dir| dir.join(&self.muxer_path).is_file())
            })
        };
        if found {
            Ok(())
        } else {
            Err(MuxerError::MuxerNotFound {
                path: self.muxer_path.clone(),
            }
            .into())
        }
    }

    /// Concatenate the segments in `temp_dir` into `output`.
    ///
    /// `segments` must already be on disk under their `file_name()` names.
    pub async fn mux(
        &self,
        temp_dir: &Path,
        segments: &[SegmentDescriptor],
        output: &Path,
        token: &CancellationToken,
    ) -> Result<(), EngineError> {
        // Decryption pass, kept distinct from both fetch and mux so each
        // stage stays testable on its own.
        for segment in segments {
            let Some(key) = segment.key else { continue };
            if token.is_cancelled() {
                return Err(OrchestratorError::Cancelled.into());
            }
            let input = temp_dir.join(segment.file_name());
            let decrypted = temp_dir.join(segment.decrypted_file_name());
            crypto::decrypt_file(&input, &decrypted, key).await?;
            debug!(index = segment.index, "Segment decrypted");
        }

        let manifest_path = temp_dir.join(CONCAT_MANIFEST);
        let mut manifest = String::new();
        for segment in segments {
            let name = if segment.key.is_some() {
                segment.decrypted_file_name()
            } else {
                segment.file_name()
            };
            manifest.push_str(&format!("file '{name}'\n"));
        }
        tokio::fs::write(&manifest_path, &manifest)
            .await
            .map_err(|e| FileSystemError::from_io(&manifest_path, &e, true))?;

        if token.is_cancelled() {
            return Err(OrchestratorError::Cancelled.into());
        }

        info!(
            muxer = %self.muxer_path.display(),
            segments = segments.len(),
            output = %output.display(),
            "Invoking muxer"
        );
        // Relative manifest entries resolve against the working directory,
        // which keeps the manifest free of path quoting concerns.
        let result = Command::new(&self.muxer_path)
            .current_dir(temp_dir)
            .args(["-y", "-f", "concat", "-safe", "0", "-i", CONCAT_MANIFEST, "-c", "copy"])
            .arg(output)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::piped())
            .output()
            .await;

        let output_data = match result {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(MuxerError::MuxerNotFound {
                    path: self.muxer_path.clone(),
                }
                .into());
            }
            Err(e) => {
                return Err(MuxerError::MuxingFailed {
                    stderr: format!("failed to spawn muxer: {e}"),
                }
                .into());
            }
        };

        if token.is_cancelled() {
            // The syscall completed; its result is discarded.
            return Err(OrchestratorError::Cancelled.into());
        }
        if !output_data.status.success() {
            let stderr = String::from_utf8_lossy(&output_data.stderr).trim().to_owned();
            return Err(MuxerError::MuxingFailed { stderr }.into());
        }
        Ok(())
    }
}
