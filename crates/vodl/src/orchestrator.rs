// Task orchestrator: global job table, admission control, and the per-job
// worker that composes parse -> fetch -> (decrypt) -> mux -> move. Temp
// state is torn down on every exit path.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use m3u8::{Playlist, PlaylistHint};

use crate::config::EngineConfig;
use crate::crypto;
use crate::error::{
    EngineError, FileSystemError, NetworkError, OrchestratorError, ProcessingError,
};
use crate::fetch::{SegmentDescriptor, SegmentFetcher};
use crate::fs::FsService;
use crate::job::{DownloadRequest, JobEntry, JobId, JobState, Source};
use crate::mux::MuxerAdapter;
use crate::net::{HttpClient, Monitor};

/// Job table plus the admission counter, guarded by one mutex that is only
/// ever held for O(1) work.
#[derive(Default)]
struct JobTable {
    entries: HashMap<JobId, JobEntry>,
    running: usize,
}

impl JobTable {
    /// Admission and counter increment in a single critical section. A
    /// rejected admission leaves the counter untouched.
    fn admit(
        &mut self,
        id: JobId,
        token: CancellationToken,
        limit: usize,
    ) -> Result<(), OrchestratorError> {
        if self.running >= limit {
            return Err(OrchestratorError::MaxConcurrentTasksReached { limit });
        }
        self.running += 1;
        self.entries.insert(id, JobEntry::new(token));
        Ok(())
    }

    fn set_running(&mut self, id: &JobId) {
        if let Some(entry) = self.entries.get_mut(id)
            && !entry.state.is_terminal()
        {
            entry.state = JobState::Running;
        }
    }

    fn set_temp_dir(&mut self, id: &JobId, temp_dir: PathBuf) {
        if let Some(entry) = self.entries.get_mut(id) {
            entry.temp_dir = Some(temp_dir);
        }
    }

    /// Commit a terminal transition and release the admission slot.
    /// Terminal states are sticky; a second finish is a no-op.
    fn finish(&mut self, id: &JobId, state: JobState, error: Option<ProcessingError>) {
        debug_assert!(state.is_terminal());
        if let Some(entry) = self.entries.get_mut(id)
            && !entry.state.is_terminal()
        {
            entry.state = state;
            entry.error = error;
            self.running = self.running.saturating_sub(1);
        }
    }
}

/// The service bundle a worker needs; cheap to clone into spawned tasks.
#[derive(Clone)]
struct Services {
    config: Arc<EngineConfig>,
    client: Arc<HttpClient>,
    fs: FsService,
    muxer: Arc<MuxerAdapter>,
    jobs: Arc<Mutex<JobTable>>,
}

pub struct Engine {
    services: Services,
    next_job: AtomicU64,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Result<Self, EngineError> {
        let config = config.validated()?;
        let client = Arc::new(HttpClient::new(&config)?);
        Ok(Self::assemble(config, client))
    }

    /// Like [`Engine::new`], with a metrics monitor attached to the
    /// network client.
    pub fn with_monitor(
        config: EngineConfig,
        monitor: Arc<dyn Monitor>,
    ) -> Result<Self, EngineError> {
        let config = config.validated()?;
        let client = Arc::new(HttpClient::new(&config)?.with_monitor(monitor));
        Ok(Self::assemble(config, client))
    }

    fn assemble(config: EngineConfig, client: Arc<HttpClient>) -> Self {
        let muxer = Arc::new(MuxerAdapter::new(config.muxer_path.clone()));
        Self {
            services: Services {
                config: Arc::new(config),
                client,
                fs: FsService::new(),
                muxer,
                jobs: Arc::new(Mutex::new(JobTable::default())),
            },
            next_job: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.services.config
    }

    /// Submit a download. Fails synchronously when the running-job limit
    /// is reached or the request is invalid; otherwise the job proceeds on
    /// a worker task and its progress is visible through [`Engine::status`].
    pub fn submit(&self, request: DownloadRequest) -> Result<JobId, EngineError> {
        // Validation errors surface here, not in the worker.
        if let Some(key) = &request.key_hex {
            crypto::parse_key_hex(key)?;
        }
        if let Some(iv) = &request.iv_hex {
            crypto::parse_iv_hex(iv)?;
        }
        if request.output_dir.as_os_str().is_empty() {
            return Err(EngineError::configuration("output_dir is empty"));
        }

        let id = JobId::from_counter(self.next_job.fetch_add(1, Ordering::Relaxed) + 1);
        let token = CancellationToken::new();
        self.services.jobs.lock().admit(
            id.clone(),
            token.clone(),
            self.services.config.max_concurrent_tasks,
        )?;

        info!(job = %id, source = %request.source, "Job admitted");
        let services = self.services.clone();
        let worker_id = id.clone();
        tokio::spawn(async move {
            services.run_job(worker_id, request, token).await;
        });

        Ok(id)
    }

    /// Current state of a job; `None` for unknown ids.
    pub fn status(&self, id: &JobId) -> Option<JobState> {
        self.services
            .jobs
            .lock()
            .entries
            .get(id)
            .map(|entry| entry.state)
    }

    /// The failure recorded on a `Failed` job.
    pub fn job_error(&self, id: &JobId) -> Option<ProcessingError> {
        self.services
            .jobs
            .lock()
            .entries
            .get(id)
            .and_then(|entry| entry.error.clone())
    }

    /// The job's temp directory, once one has been recorded.
    pub fn temp_dir(&self, id: &JobId) -> Option<PathBuf> {
        self.services
            .jobs
            .lock()
            .entries
            .get(id)
            .and_then(|entry| entry.temp_dir.clone())
    }

    /// Request cancellation. Idempotent; returns immediately, the worker
    /// performs the actual teardown.
    pub fn cancel(&self, id: &JobId) -> Result<(), EngineError> {
        let jobs = self.services.jobs.lock();
        let entry = jobs
            .entries
            .get(id)
            .ok_or_else(|| OrchestratorError::JobNotFound { id: id.to_string() })?;
        entry.token.cancel();
        Ok(())
    }

    /// Fetch and parse a playlist without starting a download.
    pub async fn parse(
        &self,
        source: &Source,
        hint: PlaylistHint,
    ) -> Result<Playlist, EngineError> {
        let token = CancellationToken::new();
        let (text, base_url) = self.services.load_playlist_text(source, &token).await?;
        Ok(m3u8::parse(&text, base_url.as_str(), hint)?)
    }
}

impl Services {
    async fn run_job(self, id: JobId, request: DownloadRequest, token: CancellationToken) {
        self.jobs.lock().set_running(&id);
        debug!(job = %id, "Job running");

        let result = self.run_pipeline(&id, &request, &token).await;

        // Temp teardown happens on every exit path; "not found" is fine.
        let temp_dir = self
            .jobs
            .lock()
            .entries
            .get(&id)
            .and_then(|e| e.temp_dir.clone());
        if let Some(temp_dir) = temp_dir
            && let Err(e) = self.fs.remove_dir_recursively(&temp_dir).await
        {
            warn!(job = %id, error = %e, "Failed to remove temp directory");
        }

        match result {
            Ok(output) => {
                info!(job = %id, output = %output.display(), "Job succeeded");
                self.jobs.lock().finish(&id, JobState::Succeeded, None);
            }
            Err(err) if err.is_cancelled() || token.is_cancelled() => {
                info!(job = %id, "Job cancelled");
                self.jobs.lock().finish(&id, JobState::Cancelled, None);
            }
            Err(err) => {
                let wrapped = ProcessingError::new(id.as_str(), err);
                warn!(
                    job = %id,
                    code = wrapped.code(),
                    error = %wrapped,
                    suggestion = wrapped.suggestion(),
                    "Job failed"
                );
                self.jobs.lock().finish(&id, JobState::Failed, Some(wrapped));
            }
        }
    }

    async fn run_pipeline(
        &self,
        id: &JobId,
        request: &DownloadRequest,
        token: &CancellationToken,
    ) -> Result<PathBuf, EngineError> {
        // The muxer must be present before any work is sunk into the job.
        self.muxer.ensure_available()?;

        self.fs.create_dir_all(&request.output_dir).await?;
        let temp_dir = self.fs.create_temp_dir(Some(id.as_str())).await?;
        self.jobs.lock().set_temp_dir(id, temp_dir.clone());

        ensure_live(token)?;
        let (text, base_url) = self.load_playlist_text(&request.source, token).await?;
        let Playlist::Media(playlist) = m3u8::parse(&text, base_url.as_str(), PlaylistHint::Media)?
        else {
            // parse() with a media hint either errors or yields media.
            return Err(EngineError::configuration("expected a media playlist"));
        };
        if request.verbose {
            info!(
                job = %id,
                segments = playlist.segments.len(),
                duration = playlist.total_duration(),
                encrypted = playlist.has_encrypted_segments(),
                "Playlist parsed"
            );
        }

        ensure_live(token)?;
        let key_override = request
            .key_hex
            .as_deref()
            .or(self.config.default_key_hex.as_deref());
        let iv_override = request
            .iv_hex
            .as_deref()
            .or(self.config.default_iv_hex.as_deref());
        let keys = crypto::resolve_segment_keys(
            &playlist,
            &base_url,
            key_override,
            iv_override,
            &self.client,
            token,
        )
        .await?;

        let segments = build_descriptors(
            &playlist,
            &base_url,
            keys,
            matches!(request.source, Source::Local(_)),
        )?;

        ensure_live(token)?;
        let fetcher = SegmentFetcher::new(
            Arc::clone(&self.client),
            self.config.max_concurrent_downloads,
            token.clone(),
        );
        fetcher.fetch_all(&segments, &temp_dir).await?;

        ensure_live(token)?;
        let output_name = derive_output_name(request);
        let staged_output = temp_dir.join(&output_name);
        self.muxer
            .mux(&temp_dir, &segments, &staged_output, token)
            .await?;

        ensure_live(token)?;
        let final_output = request.output_dir.join(&output_name);
        self.fs.move_file(&staged_output, &final_output).await?;
        Ok(final_output)
    }

    async fn load_playlist_text(
        &self,
        source: &Source,
        token: &CancellationToken,
    ) -> Result<(String, Url), EngineError> {
        match source {
            Source::Remote(url) => {
                let bytes = self.client.get_bytes(url, None, token).await?;
                let text = String::from_utf8(bytes.to_vec()).map_err(|_| {
                    EngineError::from(NetworkError::InvalidResponse {
                        reason: "playlist is not valid UTF-8".to_owned(),
                    })
                })?;
                // Base URL: the playlist URL with its last path segment
                // dropped.
                let base_url = url.join(".").map_err(|e| {
                    EngineError::configuration(format!("cannot derive base URL from {url}: {e}"))
                })?;
                Ok((text, base_url))
            }
            Source::Local(path) => {
                let text = tokio::fs::read_to_string(path)
                    .await
                    .map_err(|e| FileSystemError::from_io(path, &e, false))?;
                let dir = path.parent().unwrap_or_else(|| Path::new("."));
                let dir = tokio::fs::canonicalize(dir)
                    .await
                    .map_err(|e| FileSystemError::from_io(dir, &e, false))?;
                let base_url = Url::from_directory_path(&dir).map_err(|_| {
                    EngineError::configuration(format!(
                        "cannot derive base URL from {}",
                        dir.display()
                    ))
                })?;
                Ok((text, base_url))
            }
        }
    }
}

fn ensure_live(token: &CancellationToken) -> Result<(), EngineError> {
    if token.is_cancelled() {
        Err(OrchestratorError::Cancelled.into())
    } else {
        Ok(())
    }
}

/// `allow_file` is true only for jobs whose playlist came from a local
/// path. An absolute URI in a segment line replaces the base URL entirely
/// on `Url::join`, so a remote playlist could otherwise name `file://`
/// "segments" and walk the local file system.
fn build_descriptors(
    playlist: &m3u8::MediaPlaylist,
    base_url: &Url,
    keys: Vec<Option<crypto::SegmentKey>>,
    allow_file: bool,
) -> Result<Vec<SegmentDescriptor>, EngineError> {
    playlist
        .segments
        .iter()
        .zip(keys)
        .enumerate()
        .map(|(index, (segment, key))| {
            let url = base_url.join(&segment.uri).map_err(|e| {
                EngineError::configuration(format!(
                    "cannot resolve segment URI `{}`: {e}",
                    segment.uri
                ))
            })?;
            match url.scheme() {
                "http" | "https" => {}
                "file" if allow_file => {}
                scheme => {
                    return Err(EngineError::configuration(format!(
                        "segment {index} resolved to unsupported scheme `{scheme}`"
                    )));
                }
            }
            Ok(SegmentDescriptor {
                index,
                url,
                duration: segment.duration,
                key,
            })
        })
        .collect()
}

fn derive_output_name(request: &DownloadRequest) -> String {
    let name = request.output_name.clone().unwrap_or_else(|| {
        let stem = match &request.source {
            Source::Remote(url) => url
                .path_segments()
                .and_then(|mut segments| segments.next_back())
                .map(|last| last.split('.').next().unwrap_or(last).to_owned()),
            Source::Local(path) => path
                .file_stem()
                .map(|stem| stem.to_string_lossy().into_owned()),
        };
        stem.filter(|s| !s.is_empty())
            .unwrap_or_else(|| "output".to_owned())
    });
    if Path::new(&name).extension().is_some() {
        name
    } else {
        format!("{name}.mp4")
    }
}
