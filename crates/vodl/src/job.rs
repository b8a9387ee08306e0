// Job model: what callers submit and what the orchestrator tracks per job.

use std::path::PathBuf;

use tokio_util::sync::CancellationToken;
use url::Url;

use crate::error::{EngineError, ProcessingError};

/// Opaque job identifier, unique per engine instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct JobId(String);

impl JobId {
    pub(crate) fn from_counter(n: u64) -> Self {
        Self(format!("job-{n}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Per-job state machine. Terminal states are sticky.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Queued,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }
}

/// Where the playlist comes from.
#[derive(Debug, Clone)]
pub enum Source {
    Remote(Url),
    Local(PathBuf),
}

impl Source {
    /// Interpret caller input: `http`/`https` URLs are remote, anything
    /// with another scheme is rejected, the rest is a local path.
    pub fn parse(input: &str) -> Result<Self, EngineError> {
        if let Ok(url) = Url::parse(input) {
            return match url.scheme() {
                "http" | "https" => Ok(Self::Remote(url)),
                // Windows drive letters parse as single-letter schemes.
                scheme if scheme.len() == 1 => Ok(Self::Local(PathBuf::from(input))),
                scheme => Err(EngineError::configuration(format!(
                    "unsupported URL scheme `{scheme}`; only http and https are accepted"
                ))),
            };
        }
        Ok(Self::Local(PathBuf::from(input)))
    }
}

impl std::fmt::Display for Source {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Remote(url) => write!(f, "{url}"),
            Self::Local(path) => write!(f, "{}", path.display()),
        }
    }
}

/// A download submission.
#[derive(Debug, Clone)]
pub struct DownloadRequest {
    pub source: Source,
    pub output_dir: PathBuf,
    /// Output file name; derived from the source when absent, `.mp4`
    /// appended when no extension is given.
    pub output_name: Option<String>,
    /// Hex decryption key overriding the playlist's key URI.
    pub key_hex: Option<String>,
    /// Hex IV overriding both the playlist IV and the sequence-derived one.
    pub iv_hex: Option<String>,
    pub verbose: bool,
}

impl DownloadRequest {
    pub fn new(source: Source, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            source,
            output_dir: output_dir.into(),
            output_name: None,
            key_hex: None,
            iv_hex: None,
            verbose: false,
        }
    }
}

/// Book-keeping the orchestrator holds for one job.
#[derive(Debug)]
pub(crate) struct JobEntry {
    pub state: JobState,
    pub error: Option<ProcessingError>,
    pub token: CancellationToken,
    pub temp_dir: Option<PathBuf>,
}

impl JobEntry {
    pub fn new(token: CancellationToken) -> Self {
        Self {
            state: JobState::Queued,
            error: None,
            token,
            temp_dir: None,
        }
    }
}
