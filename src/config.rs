//! Options accepted by the download entry points.

use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use reqwest::Client;
use url::Url;

use crate::error::{DownloadError, Result};
use crate::limiter::SpeedLimiter;
use crate::planner::DEFAULT_CHUNK_SIZE;
use crate::progress::ProgressCallback;
use crate::retry::RetryPolicy;
use crate::writer::DEFAULT_BUFFER_SIZE;

pub const DEFAULT_MAX_CONCURRENCY: usize = 4;
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Settings for the shared HTTP client.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub user_agent: String,
    pub connect_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            user_agent: format!("rangedl/{}", env!("CARGO_PKG_VERSION")),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

impl ClientConfig {
    pub fn build_client(&self) -> Result<Client> {
        Ok(Client::builder()
            .user_agent(self.user_agent.as_str())
            .connect_timeout(self.connect_timeout)
            .build()?)
    }
}

/// Per-download knobs. Everything except the callback and limiter is plain
/// data and cheap to clone.
#[derive(Clone)]
pub struct DownloadOptions {
    /// Discard any existing output and metadata first.
    pub overwrite: bool,
    pub max_concurrency: usize,
    pub chunk_size: u64,
    pub buffer_size: usize,
    pub retry: RetryPolicy,
    /// Remote length known up front. Skips the length probe.
    pub expected_size: Option<u64>,
    pub speed_limiter: Option<Arc<SpeedLimiter>>,
    pub progress: Option<ProgressCallback>,
}

impl Default for DownloadOptions {
    fn default() -> Self {
        Self {
            overwrite: false,
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            chunk_size: DEFAULT_CHUNK_SIZE,
            buffer_size: DEFAULT_BUFFER_SIZE,
            retry: RetryPolicy::default(),
            expected_size: None,
            speed_limiter: None,
            progress: None,
        }
    }
}

impl fmt::Debug for DownloadOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DownloadOptions")
            .field("overwrite", &self.overwrite)
            .field("max_concurrency", &self.max_concurrency)
            .field("chunk_size", &self.chunk_size)
            .field("buffer_size", &self.buffer_size)
            .field("retry", &self.retry)
            .field("expected_size", &self.expected_size)
            .field("speed_limit", &self.speed_limiter.as_ref().and_then(|l| l.rate()))
            .finish_non_exhaustive()
    }
}

impl DownloadOptions {
    pub fn overwrite(mut self, overwrite: bool) -> Self {
        self.overwrite = overwrite;
        self
    }

    pub fn max_concurrency(mut self, n: usize) -> Self {
        self.max_concurrency = n;
        self
    }

    pub fn chunk_size(mut self, bytes: u64) -> Self {
        self.chunk_size = bytes;
        self
    }

    pub fn buffer_size(mut self, bytes: usize) -> Self {
        self.buffer_size = bytes;
        self
    }

    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn expected_size(mut self, bytes: u64) -> Self {
        self.expected_size = Some(bytes);
        self
    }

    pub fn speed_limiter(mut self, limiter: Arc<SpeedLimiter>) -> Self {
        self.speed_limiter = Some(limiter);
        self
    }

    pub fn progress(mut self, callback: ProgressCallback) -> Self {
        self.progress = Some(callback);
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_concurrency == 0 {
            return Err(DownloadError::config("max_concurrency must be at least 1"));
        }
        if self.buffer_size == 0 {
            return Err(DownloadError::config("buffer_size must be at least 1"));
        }
        if self.chunk_size < self.buffer_size as u64 {
            return Err(DownloadError::config(format!(
                "chunk_size ({}) must not be smaller than buffer_size ({})",
                self.chunk_size, self.buffer_size
            )));
        }
        Ok(())
    }
}

/// Which part of the resource a stream download covers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamRange {
    /// Resume after the bytes the writer already holds. Only honoured by
    /// seekable writers and only without an explicit `offset_start`.
    pub allow_continue: bool,
    pub offset_start: Option<u64>,
    /// Inclusive.
    pub offset_end: Option<u64>,
}

impl StreamRange {
    pub fn full() -> Self {
        Self::default()
    }

    pub fn continuing() -> Self {
        Self {
            allow_continue: true,
            ..Self::default()
        }
    }

    pub fn between(start: u64, end: Option<u64>) -> Self {
        Self {
            allow_continue: false,
            offset_start: Some(start),
            offset_end: end,
        }
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if let (Some(start), Some(end)) = (self.offset_start, self.offset_end) {
            if start > end {
                return Err(DownloadError::config(format!(
                    "offset_start ({}) is past offset_end ({})",
                    start, end
                )));
            }
        }
        Ok(())
    }
}

/// Parse and check a download URL.
pub fn parse_url(url: &str) -> Result<Url> {
    let parsed = Url::parse(url).map_err(|e| DownloadError::config(format!("invalid URL {:?}: {}", url, e)))?;
    match parsed.scheme() {
        "http" | "https" => Ok(parsed),
        other => Err(DownloadError::config(format!("unsupported URL scheme {:?}", other))),
    }
}

pub fn validate_output_path(path: &Path) -> Result<()> {
    if path.file_name().is_none() {
        return Err(DownloadError::config(format!(
            "output path {} does not name a file",
            path.display()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let opts = DownloadOptions::default();
        assert_eq!(opts.max_concurrency, 4);
        assert_eq!(opts.chunk_size, 4 * 1024 * 1024);
        assert_eq!(opts.buffer_size, 64 * 1024);
        assert_eq!(opts.retry.count, 5);
        opts.validate().unwrap();
        assert!(ClientConfig::default().user_agent.starts_with("rangedl/"));
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        assert!(DownloadOptions::default().max_concurrency(0).validate().is_err());
        assert!(DownloadOptions::default().buffer_size(0).validate().is_err());
        assert!(DownloadOptions::default()
            .chunk_size(1024)
            .buffer_size(4096)
            .validate()
            .is_err());
        assert!(StreamRange::between(10, Some(5)).validate().is_err());
        assert!(StreamRange::between(10, Some(10)).validate().is_ok());
    }

    #[test]
    fn test_url_and_path_checks() {
        assert!(parse_url("https://example.com/a.bin").is_ok());
        assert!(matches!(
            parse_url("ftp://example.com/a.bin"),
            Err(DownloadError::Configuration(_))
        ));
        assert!(parse_url("not a url").is_err());
        assert!(validate_output_path(Path::new("out/a.bin")).is_ok());
        assert!(validate_output_path(Path::new("/")).is_err());
    }
}
