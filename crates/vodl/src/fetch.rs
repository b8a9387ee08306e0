// Segment fetcher: bounded-concurrency downloads of segment URLs into a
// job's temp directory. Ordering is carried by the zero-padded index in
// the on-disk name, never by completion order.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::StreamExt;
use futures::stream::FuturesUnordered;
use reqwest::header::HeaderMap;
use tokio::io::AsyncWriteExt;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};
use url::Url;

use crate::config::MAX_DOWNLOAD_CONCURRENCY;
use crate::crypto::SegmentKey;
use crate::error::{EngineError, FileSystemError, NetworkError, OrchestratorError};
use crate::net::HttpClient;
use crate::retry::{Backoff, retry_with_backoff};

/// One segment's worth of download work, derived from the parsed playlist.
#[derive(Debug, Clone)]
pub struct SegmentDescriptor {
    /// 0-based position in playlist order; dictates concatenation order.
    pub index: usize,
    pub url: Url,
    pub duration: f64,
    /// Resolved key material; `None` for plaintext segments.
    pub key: Option<SegmentKey>,
}

impl SegmentDescriptor {
    pub fn file_name(&self) -> String {
        format!("seg_{:06}.{}", self.index, self.extension())
    }

    /// Name of the decrypted twin written by the muxer adapter.
    pub fn decrypted_file_name(&self) -> String {
        format!("dec_{:06}.{}", self.index, self.extension())
    }

    /// Extension taken from the segment URI, `.ts` when absent.
    pub fn extension(&self) -> &str {
        self.url
            .path_segments()
            .and_then(|mut segments| segments.next_back())
            .and_then(|name| name.rsplit_once('.'))
            .map(|(_, ext)| ext)
            .filter(|ext| !ext.is_empty())
            .unwrap_or("ts")
    }
}

pub struct SegmentFetcher {
    client: Arc<HttpClient>,
    strategy: Arc<dyn Backoff>,
    headers: Option<HeaderMap>,
    concurrency: usize,
    token: CancellationToken,
}

impl SegmentFetcher {
    pub fn new(client: Arc<HttpClient>, concurrency: usize, token: CancellationToken) -> Self {
        let strategy = client.strategy();
        Self {
            client,
            strategy,
            headers: None,
            concurrency: concurrency.clamp(1, MAX_DOWNLOAD_CONCURRENCY),
            token,
        }
    }

    /// Attach extra per-request headers for this job's segment downloads.
    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = Some(headers);
        self
    }

    /// Download every segment into `dest`.
    ///
    /// Downloads run in parallel up to the configured concurrency, in
    /// batches of the same size (a logging boundary, not a correctness
    /// one). The first segment to exhaust its retries cancels the rest
    /// cooperatively and becomes the returned error; there is no partial
    /// success. Files already written stay behind for the orchestrator's
    /// temp cleanup.
    pub async fn fetch_all(
        &self,
        segments: &[SegmentDescriptor],
        dest: &Path,
    ) -> Result<(), EngineError> {
        if segments.is_empty() {
            debug!("No segments to fetch");
            return Ok(());
        }

        let batch_token = self.token.child_token();
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut first_error: Option<EngineError> = None;

        for (batch_index, batch) in segments.chunks(self.concurrency).enumerate() {
            if batch_token.is_cancelled() {
                break;
            }
            debug!(
                batch = batch_index,
                size = batch.len(),
                total = segments.len(),
                "Fetching segment batch"
            );

            let mut in_flight = FuturesUnordered::new();
            for segment in batch {
                let semaphore = Arc::clone(&semaphore);
                let path = dest.join(segment.file_name());
                let token = batch_token.clone();
                in_flight.push(async move {
                    let result = self
                        .download_one(segment, path, semaphore, &token)
                        .await;
                    (segment.index, result)
                });
            }

            while let Some((index, result)) = in_flight.next().await {
                match result {
                    Ok(()) => trace!(index, "Segment complete"),
                    Err(err) if err.is_cancelled() => {}
                    Err(err) => {
                        warn!(index, error = %err, "Segment failed; cancelling batch");
                        if first_error.is_none() {
                            first_error = Some(err);
                            batch_token.cancel();
                        }
                    }
                }
            }

            if first_error.is_some() {
                break;
            }
        }

        if let Some(err) = first_error {
            return Err(err);
        }
        if self.token.is_cancelled() {
            return Err(OrchestratorError::Cancelled.into());
        }
        Ok(())
    }

    async fn download_one(
        &self,
        segment: &SegmentDescriptor,
        path: PathBuf,
        semaphore: Arc<Semaphore>,
        token: &CancellationToken,
    ) -> Result<(), EngineError> {
        let permit = tokio::select! {
            _ = token.cancelled() => return Err(OrchestratorError::Cancelled.into()),
            permit = semaphore.acquire_owned() => {
                permit.map_err(|_| EngineError::from(OrchestratorError::Cancelled))?
            }
        };

        let result = retry_with_backoff(self.strategy.as_ref(), token, |_attempt| {
            // File::create truncates whatever an earlier attempt left.
            self.stream_to_file(segment, &path, token)
        })
        .await;

        drop(permit);
        result
    }

    async fn stream_to_file(
        &self,
        segment: &SegmentDescriptor,
        path: &Path,
        token: &CancellationToken,
    ) -> Result<(), EngineError> {
        // Local playlists may reference local segments.
        if segment.url.scheme() == "file" {
            let source = segment.url.to_file_path().map_err(|_| {
                EngineError::from(NetworkError::InvalidResponse {
                    reason: format!("unusable file URL {}", segment.url),
                })
            })?;
            tokio::fs::copy(&source, path)
                .await
                .map_err(|e| FileSystemError::from_io(path, &e, true))?;
            return Ok(());
        }

        let response = self
            .client
            .send(&segment.url, self.headers.as_ref(), token)
            .await?;

        let mut file = tokio::fs::File::create(path)
            .await
            .map_err(|e| FileSystemError::from_io(path, &e, false))?;
        let mut stream = response.bytes_stream();
        let mut written: u64 = 0;

        loop {
            let chunk = tokio::select! {
                _ = token.cancelled() => {
                    drop(file);
                    remove_partial(path).await;
                    return Err(OrchestratorError::Cancelled.into());
                }
                chunk = stream.next() => chunk,
            };
            match chunk {
                Some(Ok(chunk)) => {
                    if let Err(e) = file.write_all(&chunk).await {
                        let err = FileSystemError::from_io(path, &e, true);
                        drop(file);
                        remove_partial(path).await;
                        return Err(err.into());
                    }
                    written += chunk.len() as u64;
                }
                Some(Err(e)) => {
                    let err = NetworkError::from_reqwest(&e);
                    drop(file);
                    remove_partial(path).await;
                    return Err(err.into());
                }
                None => break,
            }
        }

        if let Err(e) = file.flush().await {
            let err = FileSystemError::from_io(path, &e, true);
            drop(file);
            remove_partial(path).await;
            return Err(err.into());
        }
        trace!(index = segment.index, bytes = written, "Segment written");
        Ok(())
    }
}

/// Best-effort removal of a partial file before its error propagates.
async fn remove_partial(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await
        && e.kind() != std::io::ErrorKind::NotFound
    {
        warn!(path = %path.display(), error = %e, "Failed to remove partial segment");
    }
}
