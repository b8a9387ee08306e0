use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::EngineError;

/// Hard ceiling on per-job segment download parallelism.
pub const MAX_DOWNLOAD_CONCURRENCY: usize = 20;

pub const DEFAULT_ACCEPT_ENCODING: &str = "gzip, deflate";

/// Configurable options for the engine.
///
/// Immutable after engine construction; `initialize` swaps the whole
/// engine to reconfigure.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Path to the external muxer binary (e.g. ffmpeg).
    pub muxer_path: PathBuf,

    /// Max concurrent segment downloads per job (clamped to 1..=20).
    pub max_concurrent_downloads: usize,

    /// Max simultaneously running jobs (min 1).
    pub max_concurrent_tasks: usize,

    /// Per-request timeout for playlist/key/segment downloads.
    pub download_timeout: Duration,

    /// Overall timeout for a single resource transfer, body included.
    pub resource_timeout: Duration,

    /// Headers attached to every outgoing request.
    pub default_headers: HashMap<String, String>,

    /// Engine-wide decryption key override (hex), applied when a request
    /// does not carry its own.
    pub default_key_hex: Option<String>,

    /// Engine-wide IV override (hex).
    pub default_iv_hex: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            muxer_path: PathBuf::from("ffmpeg"),
            max_concurrent_downloads: 5,
            max_concurrent_tasks: 4,
            download_timeout: Duration::from_secs(30),
            resource_timeout: Duration::from_secs(300),
            default_headers: HashMap::new(),
            default_key_hex: None,
            default_iv_hex: None,
        }
    }
}

impl EngineConfig {
    /// Clamp out-of-range values and reject the unusable ones.
    pub fn validated(mut self) -> Result<Self, EngineError> {
        if self.muxer_path.as_os_str().is_empty() {
            return Err(EngineError::configuration("muxer_path is empty"));
        }
        if self.download_timeout.is_zero() {
            return Err(EngineError::configuration("download_timeout must be non-zero"));
        }
        self.max_concurrent_downloads = self
            .max_concurrent_downloads
            .clamp(1, MAX_DOWNLOAD_CONCURRENCY);
        self.max_concurrent_tasks = self.max_concurrent_tasks.max(1);
        Ok(self)
    }
}
