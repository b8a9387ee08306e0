// HTTP client: reqwest wrapper with status classification, retry, and an
// optional metrics monitor hook. The connection pool is the only resource
// shared across jobs; reqwest keeps it internally synchronized.

use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT_ENCODING};
use tokio_util::sync::CancellationToken;
use tracing::trace;
use url::Url;

use crate::config::{DEFAULT_ACCEPT_ENCODING, EngineConfig};
use crate::error::{EngineError, NetworkError, OrchestratorError};
use crate::retry::{Backoff, ExponentialBackoff, retry_with_backoff};

/// Receives engine metrics as `(metric_name, value, unit)` tuples.
pub trait Monitor: Send + Sync {
    fn record(&self, metric: &str, value: f64, unit: &str);
}

pub struct HttpClient {
    client: reqwest::Client,
    strategy: Arc<dyn Backoff>,
    monitor: Option<Arc<dyn Monitor>>,
}

impl HttpClient {
    pub fn new(config: &EngineConfig) -> Result<Self, EngineError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            ACCEPT_ENCODING,
            HeaderValue::from_static(DEFAULT_ACCEPT_ENCODING),
        );
        for (name, value) in &config.default_headers {
            let name = HeaderName::from_bytes(name.as_bytes()).map_err(|_| {
                EngineError::configuration(format!("invalid default header name `{name}`"))
            })?;
            let value = HeaderValue::from_str(value).map_err(|_| {
                EngineError::configuration(format!("invalid value for default header `{name:?}`"))
            })?;
            headers.insert(name, value);
        }

        // Pool sized to the segment download parallelism; cookies stay
        // disabled (no cookie store is configured).
        let client = reqwest::Client::builder()
            .default_headers(headers)
            .connect_timeout(config.download_timeout)
            .timeout(config.resource_timeout)
            .pool_max_idle_per_host(config.max_concurrent_downloads)
            .build()
            .map_err(|e| EngineError::configuration(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            strategy: Arc::new(ExponentialBackoff::default()),
            monitor: None,
        })
    }

    /// Replace the retry strategy (the default is exponential backoff).
    pub fn with_strategy(mut self, strategy: Arc<dyn Backoff>) -> Self {
        self.strategy = strategy;
        self
    }

    /// Attach a metrics monitor.
    pub fn with_monitor(mut self, monitor: Arc<dyn Monitor>) -> Self {
        self.monitor = Some(monitor);
        self
    }

    pub fn strategy(&self) -> Arc<dyn Backoff> {
        Arc::clone(&self.strategy)
    }

    fn record(&self, metric: &str, value: f64, unit: &str) {
        if let Some(monitor) = &self.monitor {
            monitor.record(metric, value, unit);
        }
    }

    /// Issue a single request and classify the outcome. The response body
    /// has not been consumed yet; callers stream or buffer it themselves.
    pub async fn send(
        &self,
        url: &Url,
        headers: Option<&HeaderMap>,
        token: &CancellationToken,
    ) -> Result<reqwest::Response, EngineError> {
        let mut request = self.client.get(url.clone());
        if let Some(headers) = headers {
            request = request.headers(headers.clone());
        }

        let response = tokio::select! {
            _ = token.cancelled() => return Err(OrchestratorError::Cancelled.into()),
            response = request.send() => {
                response.map_err(|e| NetworkError::from_reqwest(&e))?
            }
        };

        if let Some(err) = NetworkError::from_status(response.status()) {
            return Err(err.into());
        }
        trace!(url = %url, status = %response.status(), "Request succeeded");
        Ok(response)
    }

    /// Fetch a small resource (playlist, key) fully into memory, with
    /// retries under the configured strategy.
    pub async fn get_bytes(
        &self,
        url: &Url,
        headers: Option<&HeaderMap>,
        token: &CancellationToken,
    ) -> Result<Bytes, EngineError> {
        let started = Instant::now();
        let attempts = std::sync::atomic::AtomicU32::new(0);

        let result = retry_with_backoff(self.strategy.as_ref(), token, |attempt| {
            attempts.store(attempt + 1, std::sync::atomic::Ordering::Relaxed);
            async move {
                let response = self.send(url, headers, token).await?;
                let bytes = tokio::select! {
                    _ = token.cancelled() => return Err(OrchestratorError::Cancelled.into()),
                    bytes = response.bytes() => {
                        bytes.map_err(|e| NetworkError::from_reqwest(&e))?
                    }
                };
                Ok(bytes)
            }
        })
        .await;

        let attempts = attempts.load(std::sync::atomic::Ordering::Relaxed);
        self.record(
            "request.duration",
            started.elapsed().as_secs_f64() * 1000.0,
            "ms",
        );
        self.record("request.attempts", f64::from(attempts), "count");
        match &result {
            Ok(bytes) => {
                self.record("request.bytes", bytes.len() as f64, "bytes");
                self.record("request.success", 1.0, "flag");
            }
            Err(_) => self.record("request.success", 0.0, "flag"),
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use parking_lot::Mutex;

    struct RecordingMonitor {
        metrics: Mutex<Vec<(String, f64, String)>>,
    }

    impl Monitor for RecordingMonitor {
        fn record(&self, metric: &str, value: f64, unit: &str) {
            self.metrics
                .lock()
                .push((metric.to_owned(), value, unit.to_owned()));
        }
    }

    #[test]
    fn rejects_unencodable_default_headers() {
        let mut config = EngineConfig::default();
        config
            .default_headers
            .insert("bad header name".into(), "v".into());
        assert!(HttpClient::new(&config).is_err());
    }

    #[tokio::test]
    async fn monitor_sees_failure_flag() {
        let config = EngineConfig {
            download_timeout: std::time::Duration::from_secs(1),
            resource_timeout: std::time::Duration::from_secs(2),
            ..Default::default()
        };
        let monitor = Arc::new(RecordingMonitor {
            metrics: Mutex::new(Vec::new()),
        });
        let client = HttpClient::new(&config)
            .unwrap()
            .with_monitor(Arc::clone(&monitor) as Arc<dyn Monitor>);

        // Unroutable per RFC 5737; connection fails fast enough for a test
        // with a single attempt.
        let client = client.with_strategy(Arc::new(crate::retry::NoRetry));
        let url = Url::parse("http://192.0.2.1:9/x.m3u8").unwrap();
        let token = CancellationToken::new();
        let result = client.get_bytes(&url, None, &token).await;
        assert!(result.is_err());

        let metrics = monitor.metrics.lock();
        assert!(
            metrics
                .iter()
                .any(|(name, value, _)| name == "request.success" && *value == 0.0)
        );
    }
}
