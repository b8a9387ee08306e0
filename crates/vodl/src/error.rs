// Engine error taxonomy. One enum per component, aggregated into
// `EngineError`; the orchestrator wraps stage failures in a
// `ProcessingError` envelope that keeps the originating job id.

use std::path::PathBuf;

pub use m3u8::ParseError;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum NetworkError {
    #[error("request timed out")]
    Timeout,

    #[error("connection failed: {reason}")]
    ConnectionFailed { reason: String },

    #[error("client error HTTP {status}")]
    ClientError { status: u16 },

    #[error("server error HTTP {status}")]
    ServerError { status: u16 },

    #[error("invalid response: {reason}")]
    InvalidResponse { reason: String },
}

impl NetworkError {
    /// Transient failures worth another attempt. Client errors and
    /// malformed responses are permanent.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout | Self::ConnectionFailed { .. } | Self::ServerError { .. } => true,
            Self::ClientError { .. } | Self::InvalidResponse { .. } => false,
        }
    }

    /// Classify a transport-level reqwest error.
    pub fn from_reqwest(error: &reqwest::Error) -> Self {
        if error.is_timeout() {
            Self::Timeout
        } else if error.is_connect() || error.is_request() || error.is_body() {
            Self::ConnectionFailed {
                reason: error.to_string(),
            }
        } else {
            Self::InvalidResponse {
                reason: error.to_string(),
            }
        }
    }

    /// Classify a response status; `None` means the status is a success.
    pub fn from_status(status: reqwest::StatusCode) -> Option<Self> {
        if status.is_success() {
            None
        } else if status.is_client_error() {
            Some(Self::ClientError {
                status: status.as_u16(),
            })
        } else if status.is_server_error() {
            Some(Self::ServerError {
                status: status.as_u16(),
            })
        } else {
            Some(Self::InvalidResponse {
                reason: format!("unexpected HTTP status {status}"),
            })
        }
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CryptoError {
    #[error("invalid key: {reason}")]
    InvalidKey { reason: String },

    #[error("invalid IV: {reason}")]
    InvalidIv { reason: String },

    #[error("decryption failed: {reason}")]
    DecryptionFailed { reason: String },
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum FileSystemError {
    #[error("permission denied: {path}")]
    PermissionDenied { path: PathBuf },

    #[error("not found: {path}")]
    NotFound { path: PathBuf },

    #[error("failed to create {path}: {reason}")]
    CreateFailed { path: PathBuf, reason: String },

    #[error("failed to write {path}: {reason}")]
    WriteFailed { path: PathBuf, reason: String },
}

impl FileSystemError {
    /// Map an I/O failure on `path`, preserving the interesting kinds.
    pub fn from_io(path: impl Into<PathBuf>, error: &std::io::Error, writing: bool) -> Self {
        let path = path.into();
        match error.kind() {
            std::io::ErrorKind::PermissionDenied => Self::PermissionDenied { path },
            std::io::ErrorKind::NotFound => Self::NotFound { path },
            _ if writing => Self::WriteFailed {
                path,
                reason: error.to_string(),
            },
            _ => Self::CreateFailed {
                path,
                reason: error.to_string(),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum MuxerError {
    #[error("muxer binary not found at `{path}`")]
    MuxerNotFound { path: PathBuf },

    #[error("muxing failed: {stderr}")]
    MuxingFailed { stderr: String },
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum OrchestratorError {
    #[error("maximum of {limit} concurrent tasks reached")]
    MaxConcurrentTasksReached { limit: usize },

    #[error("no job with id `{id}`")]
    JobNotFound { id: String },

    #[error("cancelled")]
    Cancelled,
}

/// Aggregate error for every engine operation.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error(transparent)]
    Network(#[from] NetworkError),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    FileSystem(#[from] FileSystemError),

    #[error(transparent)]
    Muxer(#[from] MuxerError),

    #[error(transparent)]
    Orchestrator(#[from] OrchestratorError),

    #[error("configuration error: {reason}")]
    Configuration { reason: String },
}

impl EngineError {
    pub fn configuration(reason: impl Into<String>) -> Self {
        Self::Configuration {
            reason: reason.into(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Orchestrator(OrchestratorError::Cancelled))
    }

    /// Stable numeric code, banded per component: 1xx parse, 2xx network,
    /// 3xx crypto, 4xx file system, 5xx muxer, 6xx orchestrator, 900
    /// configuration.
    pub fn code(&self) -> u16 {
        match self {
            Self::Parse(e) => match e {
                ParseError::MalformedPlaylist { .. } => 101,
                ParseError::MissingRequiredTag { .. } => 102,
                ParseError::PlaylistTypeMismatch { .. } => 103,
                ParseError::InvalidAttribute { .. } => 104,
            },
            Self::Network(e) => match e {
                NetworkError::Timeout => 201,
                NetworkError::ConnectionFailed { .. } => 202,
                NetworkError::ClientError { .. } => 203,
                NetworkError::ServerError { .. } => 204,
                NetworkError::InvalidResponse { .. } => 205,
            },
            Self::Crypto(e) => match e {
                CryptoError::InvalidKey { .. } => 301,
                CryptoError::InvalidIv { .. } => 302,
                CryptoError::DecryptionFailed { .. } => 303,
            },
            Self::FileSystem(e) => match e {
                FileSystemError::PermissionDenied { .. } => 401,
                FileSystemError::NotFound { .. } => 402,
                FileSystemError::CreateFailed { .. } => 403,
                FileSystemError::WriteFailed { .. } => 404,
            },
            Self::Muxer(e) => match e {
                MuxerError::MuxerNotFound { .. } => 501,
                MuxerError::MuxingFailed { .. } => 502,
            },
            Self::Orchestrator(e) => match e {
                OrchestratorError::MaxConcurrentTasksReached { .. } => 601,
                OrchestratorError::JobNotFound { .. } => 602,
                OrchestratorError::Cancelled => 603,
            },
            Self::Configuration { .. } => 900,
        }
    }

    /// A short recovery hint suitable for end-user display.
    pub fn suggestion(&self) -> &'static str {
        match self {
            Self::Parse(_) => "verify the playlist URL points at a valid M3U8 media playlist",
            Self::Network(NetworkError::ClientError { .. }) => {
                "check the URL and any required request headers"
            }
            Self::Network(_) => "check network connectivity and retry",
            Self::Crypto(CryptoError::InvalidKey { .. }) => {
                "supply a 32-character hex key (16 bytes for AES-128)"
            }
            Self::Crypto(CryptoError::InvalidIv { .. }) => "supply a 32-character hex IV",
            Self::Crypto(_) => "verify the key and IV match this stream",
            Self::FileSystem(_) => "check the output directory exists and is writable",
            Self::Muxer(MuxerError::MuxerNotFound { .. }) => {
                "install the muxer binary or point muxer_path at it"
            }
            Self::Muxer(_) => "inspect the muxer stderr output for details",
            Self::Orchestrator(OrchestratorError::MaxConcurrentTasksReached { .. }) => {
                "wait for a running job to finish before submitting another"
            }
            Self::Orchestrator(_) => "check the job id",
            Self::Configuration { .. } => "review the engine configuration values",
        }
    }
}

/// A stage failure bound to the job it happened in. Retained on `Failed`
/// jobs so `status` callers can surface the cause.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("job {job_id} failed: {source}")]
pub struct ProcessingError {
    pub job_id: String,
    pub source: EngineError,
}

impl ProcessingError {
    pub fn new(job_id: impl Into<String>, source: EngineError) -> Self {
        Self {
            job_id: job_id.into(),
            source,
        }
    }

    pub fn code(&self) -> u16 {
        self.source.code()
    }

    pub fn suggestion(&self) -> &'static str {
        self.source.suggestion()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryability_splits_on_status_class() {
        assert!(NetworkError::ServerError { status: 503 }.is_retryable());
        assert!(NetworkError::Timeout.is_retryable());
        assert!(!NetworkError::ClientError { status: 404 }.is_retryable());
        assert!(
            !NetworkError::InvalidResponse {
                reason: "weird".into()
            }
            .is_retryable()
        );
    }

    #[test]
    fn codes_are_banded_per_component() {
        let net: EngineError = NetworkError::Timeout.into();
        let muxer: EngineError = MuxerError::MuxerNotFound {
            path: "ffmpeg".into(),
        }
        .into();
        assert_eq!(net.code() / 100, 2);
        assert_eq!(muxer.code() / 100, 5);
        assert!(!net.suggestion().is_empty());
    }

    #[test]
    fn cancellation_is_its_own_kind() {
        let err: EngineError = OrchestratorError::Cancelled.into();
        assert!(err.is_cancelled());
        assert_eq!(err.code(), 603);
    }
}
