// vodl-engine: HLS VOD acquisition.
//
// Pipeline for one job: fetch playlist text -> parse -> resolve keys ->
// download segments concurrently -> decrypt where needed -> concatenate
// through the external muxer -> move the result into place. The
// orchestrator caps simultaneous jobs, exposes status, and supports
// cooperative cancellation; temp state is removed on every exit path.

pub mod config;
pub mod crypto;
pub mod error;
pub mod fetch;
pub mod fs;
pub mod job;
pub mod mux;
pub mod net;
pub mod orchestrator;
pub mod retry;

use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;

pub use config::EngineConfig;
pub use error::{
    CryptoError, EngineError, FileSystemError, MuxerError, NetworkError, OrchestratorError,
    ParseError, ProcessingError,
};
pub use fetch::{SegmentDescriptor, SegmentFetcher};
pub use job::{DownloadRequest, JobId, JobState, Source};
pub use net::Monitor;
pub use orchestrator::Engine;
pub use retry::{Backoff, ExponentialBackoff, FixedDelay, LinearBackoff, NoRetry};

// Re-exported so callers of `parse` don't need a direct m3u8 dependency.
pub use m3u8::{MasterPlaylist, MediaPlaylist, Playlist, PlaylistHint};

// Process-wide engine, lazily constructed, replaced wholesale by
// `initialize`. All mutation goes through the one mutex.
static ENGINE: OnceLock<Mutex<Option<Arc<Engine>>>> = OnceLock::new();

fn engine_slot() -> &'static Mutex<Option<Arc<Engine>>> {
    ENGINE.get_or_init(|| Mutex::new(None))
}

fn current_engine() -> Result<Arc<Engine>, EngineError> {
    let mut slot = engine_slot().lock();
    if let Some(engine) = slot.as_ref() {
        return Ok(Arc::clone(engine));
    }
    let engine = Arc::new(Engine::new(EngineConfig::default())?);
    *slot = Some(Arc::clone(&engine));
    Ok(engine)
}

/// (Re)configure the process-wide engine. Idempotent; jobs already running
/// on the previous engine instance finish undisturbed.
pub fn initialize(config: EngineConfig) -> Result<(), EngineError> {
    let engine = Arc::new(Engine::new(config)?);
    *engine_slot().lock() = Some(engine);
    Ok(())
}

/// Submit a download to the process-wide engine.
pub fn submit(request: DownloadRequest) -> Result<JobId, EngineError> {
    current_engine()?.submit(request)
}

/// State of a job, `None` for unknown ids.
pub fn status(id: &JobId) -> Option<JobState> {
    current_engine().ok()?.status(id)
}

/// Cancel a job; `JobNotFound` for unknown ids.
pub fn cancel(id: &JobId) -> Result<(), EngineError> {
    current_engine()?.cancel(id)
}

/// Fetch and parse a playlist without downloading anything.
pub async fn parse(source: &Source, hint: PlaylistHint) -> Result<Playlist, EngineError> {
    current_engine()?.parse(source, hint).await
}
