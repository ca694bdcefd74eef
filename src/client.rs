//! Public entry points tying planner, scheduler and writers together.

use std::io::SeekFrom;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::FutureExt;
use reqwest::Client;
use tokio::io::{AsyncSeek, AsyncSeekExt, AsyncWrite};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::{parse_url, validate_output_path, ClientConfig, DownloadOptions, StreamRange};
use crate::error::{DownloadError, Result};
use crate::metadata::{self, sanity_check, DiskSnapshot, MetadataStore};
use crate::planner::{probe_content_length, ChunkPlanner, ResumePlan};
use crate::progress::ProgressReporter;
use crate::range::{ChunkDescriptor, Range, RemoteTarget};
use crate::retry::{retry_with_backoff, RetryPolicy};
use crate::scheduler::Scheduler;
use crate::state::PersistedState;
use crate::stream::RangeRequest;
use crate::writer::{ChunkWriter, FileSink, StreamSink};

/// Lifecycle of one download attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadStatus {
    Idle,
    Planning,
    Downloading,
    Finished,
    FailedDownloading,
    CancelledDownloading,
}

impl DownloadStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DownloadStatus::Finished | DownloadStatus::FailedDownloading | DownloadStatus::CancelledDownloading
        )
    }
}

/// Answer of [`DownloadClient::get_remote_status`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteStatus {
    pub status: u16,
    pub success: bool,
}

/// Summary of a finished download.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DownloadReport {
    /// Bytes the output holds for the requested range.
    pub bytes_total: u64,
    /// Bytes fetched over the network by this call.
    pub bytes_transferred: u64,
    pub elapsed: Duration,
}

/// Resumable chunked downloader.
///
/// One client may run several downloads; the status channel follows whichever
/// attempt last changed state.
pub struct DownloadClient {
    client: Client,
    retry: RetryPolicy,
    status: watch::Sender<DownloadStatus>,
}

impl DownloadClient {
    pub fn new(config: &ClientConfig) -> Result<Self> {
        Ok(Self::with_client(config.build_client()?))
    }

    pub fn with_client(client: Client) -> Self {
        let (status, _) = watch::channel(DownloadStatus::Idle);
        Self {
            client,
            retry: RetryPolicy::default(),
            status,
        }
    }

    /// Retry policy for the standalone queries (`get_remote_status`,
    /// `get_downloaded_size`). Downloads use their own options.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn status(&self) -> DownloadStatus {
        *self.status.borrow()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<DownloadStatus> {
        self.status.subscribe()
    }

    /// Download `url` into `output_path`, resuming from whatever a previous
    /// attempt left behind. The metadata sibling is removed on success.
    ///
    /// Fails with the first fatal error of any chunk, or with
    /// [`DownloadError::Cancelled`]. Either way the output and its metadata
    /// remain valid for the next attempt.
    pub async fn download_to_file(
        &self,
        url: &str,
        output_path: &Path,
        options: &DownloadOptions,
        cancel: &CancellationToken,
    ) -> Result<DownloadReport> {
        self.tracked(self.file_attempt(url, output_path, options, cancel)).await
    }

    /// Single-range download into a caller-owned writer that cannot seek.
    /// `range.allow_continue` is ignored here.
    pub async fn download_to_stream<W>(
        &self,
        url: &str,
        writer: &mut W,
        range: StreamRange,
        options: &DownloadOptions,
        cancel: &CancellationToken,
    ) -> Result<DownloadReport>
    where
        W: AsyncWrite + Unpin + Send,
    {
        let start = range.offset_start.unwrap_or(0);
        self.tracked(self.stream_attempt(url, writer, range, start, 0, options, cancel))
            .await
    }

    /// Like [`download_to_stream`](Self::download_to_stream), but when
    /// `range.allow_continue` is set and no start offset is given, resumes
    /// after the bytes the writer already holds.
    pub async fn download_to_seekable_stream<W>(
        &self,
        url: &str,
        writer: &mut W,
        range: StreamRange,
        options: &DownloadOptions,
        cancel: &CancellationToken,
    ) -> Result<DownloadReport>
    where
        W: AsyncWrite + AsyncSeek + Unpin + Send,
    {
        self.tracked(async move {
            let (start, existing) = match range.offset_start {
                Some(start) => (start, 0),
                None if range.allow_continue => {
                    let len = writer.seek(SeekFrom::End(0)).await?;
                    if len > 0 {
                        info!(offset = len, "continuing stream download");
                    }
                    (len, len)
                }
                None => (0, 0),
            };
            self.stream_attempt(url, &mut *writer, range, start, existing, options, cancel)
                .await
        })
        .await
    }

    /// Status code of a plain ranged GET against `url`. The body is not read.
    pub async fn get_remote_status(&self, url: &str, cancel: &CancellationToken) -> Result<RemoteStatus> {
        let url = parse_url(url)?;
        let mut request = RangeRequest::new(self.client.clone(), url, 0, None, self.retry.timeout);
        let status = retry_with_backoff(&self.retry, cancel, "remote status", &mut request, |req| {
            req.status().boxed()
        })
        .await?;
        Ok(RemoteStatus {
            status: status.as_u16(),
            success: status.is_success(),
        })
    }

    /// Bytes [`download_to_file`](Self::download_to_file) would keep when
    /// called with the same `options`. Never writes. Probes the remote length
    /// unless `options.expected_size` is set.
    pub async fn get_downloaded_size(
        &self,
        url: &str,
        output_path: &Path,
        options: &DownloadOptions,
        cancel: &CancellationToken,
    ) -> Result<u64> {
        options.validate()?;
        let parsed = parse_url(url)?;
        validate_output_path(output_path)?;
        let target_size = match options.expected_size {
            Some(len) => len,
            None => probe_content_length(&self.client, &parsed, &self.retry, cancel).await?,
        };

        let disk = DiskSnapshot::inspect(output_path).await;
        let state = MetadataStore::load(url, output_path, target_size).await;
        if let Some(reason) = sanity_check(&state, &disk, url, target_size, options.overwrite) {
            debug!(%reason, "existing output would be discarded");
            return Ok(0);
        }
        Ok(ResumePlan::compute(&state, disk.output_len, options.chunk_size, target_size).already_downloaded())
    }

    fn set_status(&self, status: DownloadStatus) {
        self.status.send_replace(status);
    }

    async fn tracked<T>(&self, attempt: impl std::future::Future<Output = Result<T>>) -> Result<T> {
        self.set_status(DownloadStatus::Planning);
        let result = attempt.await;
        self.set_status(match &result {
            Ok(_) => DownloadStatus::Finished,
            Err(e) if e.is_cancelled() => DownloadStatus::CancelledDownloading,
            Err(_) => DownloadStatus::FailedDownloading,
        });
        result
    }

    async fn file_attempt(
        &self,
        url: &str,
        output_path: &Path,
        options: &DownloadOptions,
        cancel: &CancellationToken,
    ) -> Result<DownloadReport> {
        let started = Instant::now();
        options.validate()?;
        let parsed = parse_url(url)?;
        validate_output_path(output_path)?;

        let target_size = match options.expected_size {
            Some(size) => size,
            None => probe_content_length(&self.client, &parsed, &options.retry, cancel).await?,
        };
        info!(url, path = %output_path.display(), size = target_size, "planning download");

        let mut disk = DiskSnapshot::inspect(output_path).await;
        let mut state = MetadataStore::load(url, output_path, target_size).await;
        if let Some(reason) = sanity_check(&state, &disk, url, target_size, options.overwrite) {
            info!(%reason, path = %output_path.display(), "restarting from scratch");
            metadata::discard(output_path).await?;
            state = PersistedState::new(url, output_path, target_size);
            disk = DiskSnapshot::default();
        }
        let already_completed = state.is_completed;

        let store = Arc::new(MetadataStore::new(state));
        let progress = ProgressReporter::new(target_size, options.progress.clone());
        let target = Arc::new(RemoteTarget::new(parsed, Some(target_size)));
        let mut planner = ChunkPlanner::new(
            target,
            store.clone(),
            progress.clone(),
            disk.output_len,
            options.chunk_size,
            options.retry,
        )
        .await?;

        let sink = Arc::new(FileSink::open(output_path).await?);
        let writer = ChunkWriter::new(
            self.client.clone(),
            Some(store.clone()),
            progress.clone(),
            options.speed_limiter.clone(),
            options.buffer_size,
            cancel.clone(),
        );
        let transferred = Arc::new(AtomicU64::new(0));

        self.set_status(DownloadStatus::Downloading);
        let scheduler = Scheduler::new(options.max_concurrency, cancel.clone());
        let result = scheduler
            .run(&mut planner, |chunk| {
                let writer = writer.clone();
                let sink = sink.clone();
                let transferred = transferred.clone();
                async move {
                    let n = writer.run(chunk, &*sink).await?;
                    transferred.fetch_add(n, Ordering::Relaxed);
                    Ok(())
                }
            })
            .await;
        sink.sync().await?;
        if let Err(e) = result {
            if e.is_cancelled() {
                info!(path = %output_path.display(), "download cancelled, progress kept");
            }
            return Err(e);
        }

        let on_disk = tokio::fs::metadata(output_path).await?.len();
        if on_disk < target_size {
            warn!(expected = target_size, on_disk, "output shorter than remote size");
            return Err(DownloadError::PrematureEof {
                expected: target_size,
                received: on_disk,
            });
        }
        if !already_completed {
            store.mark_completed().await?;
        }
        MetadataStore::delete(output_path).await;

        let report = DownloadReport {
            bytes_total: target_size,
            bytes_transferred: transferred.load(Ordering::Relaxed),
            elapsed: started.elapsed(),
        };
        info!(
            path = %output_path.display(),
            transferred = report.bytes_transferred,
            elapsed_ms = report.elapsed.as_millis() as u64,
            "download finished"
        );
        Ok(report)
    }

    #[allow(clippy::too_many_arguments)]
    async fn stream_attempt<W>(
        &self,
        url: &str,
        writer: &mut W,
        range: StreamRange,
        start: u64,
        existing: u64,
        options: &DownloadOptions,
        cancel: &CancellationToken,
    ) -> Result<DownloadReport>
    where
        W: AsyncWrite + Unpin + Send,
    {
        let started = Instant::now();
        options.validate()?;
        range.validate()?;
        let parsed: Url = parse_url(url)?;

        let chunk_range = match range.offset_end {
            Some(end) if start > end => {
                debug!(start, end, "requested range already held");
                return Ok(DownloadReport {
                    bytes_total: existing,
                    bytes_transferred: 0,
                    elapsed: started.elapsed(),
                });
            }
            Some(end) => Range::new(start, end),
            None => Range::open(start),
        };
        let total = range.offset_end.map_or(0, |end| end.saturating_add(1));
        let progress = ProgressReporter::new(total, options.progress.clone());
        progress.report_existing(existing);

        let size = range.offset_end.map(|end| end.saturating_add(1));
        let target = Arc::new(RemoteTarget::new(parsed, size));
        let chunk_writer = ChunkWriter::new(
            self.client.clone(),
            None,
            progress.clone(),
            options.speed_limiter.clone(),
            options.buffer_size,
            cancel.clone(),
        );
        let sink = StreamSink::new(writer, start);

        self.set_status(DownloadStatus::Downloading);
        let transferred = chunk_writer
            .run(ChunkDescriptor::new(target, chunk_range, options.retry), &sink)
            .await?;
        sink.flush().await?;

        Ok(DownloadReport {
            bytes_total: existing + transferred,
            bytes_transferred: transferred,
            elapsed: started.elapsed(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_channel_starts_idle() {
        let client = DownloadClient::with_client(Client::new());
        let rx = client.subscribe_status();
        assert_eq!(*rx.borrow(), DownloadStatus::Idle);
        assert!(!client.status().is_terminal());
    }

    #[tokio::test]
    async fn test_invalid_arguments_fail_before_any_request() {
        let client = DownloadClient::with_client(Client::new());
        let cancel = CancellationToken::new();
        let dir = tempfile::tempdir().unwrap();

        let err = client
            .download_to_file("ftp://example.com/a", &dir.path().join("a"), &DownloadOptions::default(), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, DownloadError::Configuration(_)));
        assert_eq!(client.status(), DownloadStatus::FailedDownloading);

        let opts = DownloadOptions::default().max_concurrency(0);
        let err = client
            .download_to_file("http://example.com/a", &dir.path().join("a"), &opts, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, DownloadError::Configuration(_)));
    }

    #[tokio::test]
    async fn test_completed_output_needs_no_network() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("done.bin");
        tokio::fs::write(&out, vec![7u8; 1000]).await.unwrap();

        // Nothing listens on this port; any request would fail.
        let client = DownloadClient::with_client(Client::new());
        let opts = DownloadOptions::default().expected_size(1000);
        let report = client
            .download_to_file("http://127.0.0.1:9/done.bin", &out, &opts, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.bytes_transferred, 0);
        assert_eq!(report.bytes_total, 1000);
        assert!(!metadata::metadata_path(&out).exists());
        assert_eq!(client.status(), DownloadStatus::Finished);

        let size = client
            .get_downloaded_size("http://127.0.0.1:9/done.bin", &out, &opts, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(size, 1000);
    }

    #[tokio::test]
    async fn test_downloaded_size_follows_chunk_size_and_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("partial.bin");
        tokio::fs::write(&out, vec![7u8; 3000]).await.unwrap();
        let url = "http://127.0.0.1:9/partial.bin";
        let client = DownloadClient::with_client(Client::new());
        let cancel = CancellationToken::new();

        // No metadata: the file length only counts when it exceeds one chunk.
        let small_chunks = DownloadOptions::default()
            .expected_size(5000)
            .chunk_size(1024)
            .buffer_size(256);
        assert_eq!(client.get_downloaded_size(url, &out, &small_chunks, &cancel).await.unwrap(), 3000);
        let default_chunks = DownloadOptions::default().expected_size(5000);
        assert_eq!(client.get_downloaded_size(url, &out, &default_chunks, &cancel).await.unwrap(), 0);

        let overwrite = small_chunks.clone().overwrite(true);
        assert_eq!(client.get_downloaded_size(url, &out, &overwrite, &cancel).await.unwrap(), 0);
        assert!(out.exists());
    }
}
