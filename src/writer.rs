//! Drives one chunk from the network into its region of the output.

use std::io::{self, SeekFrom};
use std::path::Path;
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt};
use reqwest::Client;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{DownloadError, Result};
use crate::limiter::SpeedLimiter;
use crate::metadata::MetadataStore;
use crate::progress::ProgressReporter;
use crate::range::{ChunkDescriptor, Range, RemoteTarget};
use crate::retry::{retry_with_backoff, with_timeout, RetryPolicy};
use crate::stream::RangeStream;

pub const DEFAULT_BUFFER_SIZE: usize = 64 * 1024;

/// Destination that chunk writers write into.
pub trait ChunkSink: Send + Sync {
    /// Write `data` at absolute `offset` and make sure it reached the sink
    /// before returning.
    fn write_at<'a>(&'a self, offset: u64, data: &'a [u8]) -> BoxFuture<'a, io::Result<()>>;
}

/// Random-access output file shared by all workers. Each worker owns a
/// disjoint region, so the lock only serializes seek+write pairs.
pub struct FileSink {
    file: Mutex<File>,
}

impl FileSink {
    pub async fn open(path: &Path) -> io::Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .read(true)
            .truncate(false)
            .open(path)
            .await?;
        Ok(Self {
            file: Mutex::new(file),
        })
    }

    pub async fn sync(&self) -> io::Result<()> {
        let mut f = self.file.lock().await;
        f.flush().await?;
        f.sync_data().await
    }
}

impl ChunkSink for FileSink {
    fn write_at<'a>(&'a self, offset: u64, data: &'a [u8]) -> BoxFuture<'a, io::Result<()>> {
        async move {
            let mut f = self.file.lock().await;
            f.seek(SeekFrom::Start(offset)).await?;
            f.write_all(data).await?;
            f.flush().await
        }
        .boxed()
    }
}

/// Caller-owned, possibly non-seekable writer. Writes must arrive in order,
/// which a single sequential range guarantees.
pub struct StreamSink<W> {
    inner: Mutex<(W, u64)>,
}

impl<W: AsyncWrite + Unpin + Send> StreamSink<W> {
    /// `position` is the absolute offset of the next byte the writer expects.
    pub fn new(writer: W, position: u64) -> Self {
        Self {
            inner: Mutex::new((writer, position)),
        }
    }

    pub async fn flush(&self) -> io::Result<()> {
        self.inner.lock().await.0.flush().await
    }

    pub fn into_inner(self) -> W {
        self.inner.into_inner().0
    }
}

impl<W: AsyncWrite + Unpin + Send> ChunkSink for StreamSink<W> {
    fn write_at<'a>(&'a self, offset: u64, data: &'a [u8]) -> BoxFuture<'a, io::Result<()>> {
        async move {
            let mut guard = self.inner.lock().await;
            let (writer, position) = &mut *guard;
            if offset != *position {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("out-of-order write at {} (stream is at {})", offset, position),
                ));
            }
            writer.write_all(data).await?;
            *position += data.len() as u64;
            Ok(())
        }
        .boxed()
    }
}

/// Per-download collaborators shared by every chunk.
#[derive(Clone)]
pub struct ChunkWriter {
    client: Client,
    store: Option<Arc<MetadataStore>>,
    progress: ProgressReporter,
    limiter: Option<Arc<SpeedLimiter>>,
    buffer_size: usize,
    cancel: CancellationToken,
}

impl ChunkWriter {
    pub fn new(
        client: Client,
        store: Option<Arc<MetadataStore>>,
        progress: ProgressReporter,
        limiter: Option<Arc<SpeedLimiter>>,
        buffer_size: usize,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            client,
            store,
            progress,
            limiter,
            buffer_size: buffer_size.max(1),
            cancel,
        }
    }

    /// Fetch `chunk` into `sink`. Transient failures reopen the stream at the
    /// current offset, so bytes already written are never requested again.
    /// On success the range is retired from the metadata. Returns the number
    /// of bytes transferred.
    pub async fn run<S>(&self, chunk: ChunkDescriptor, sink: &S) -> Result<u64>
    where
        S: ChunkSink + ?Sized,
    {
        let retry = chunk.retry;
        let mut run = ChunkRun {
            writer: self,
            sink,
            target: chunk.target,
            range: chunk.range,
            retry,
            transferred: 0,
            buf: vec![0u8; self.buffer_size],
        };

        retry_with_backoff(&retry, &self.cancel, "chunk download", &mut run, |run| {
            run.pump().boxed()
        })
        .await?;

        if let Some(store) = &self.store {
            store.pop_range(run.range).await?;
        }
        debug!(range = %chunk.range, bytes = run.transferred, "chunk complete");
        Ok(run.transferred)
    }
}

struct ChunkRun<'w, S: ?Sized> {
    writer: &'w ChunkWriter,
    sink: &'w S,
    target: Arc<RemoteTarget>,
    /// Remaining work; `start` is the next byte to write.
    range: Range,
    retry: RetryPolicy,
    transferred: u64,
    buf: Vec<u8>,
}

impl<S: ChunkSink + ?Sized> ChunkRun<'_, S> {
    /// One connection's worth of work, starting at the current offset.
    async fn pump(&mut self) -> Result<()> {
        if self.range.is_satisfied() {
            return Ok(());
        }
        let writer = self.writer;
        if self.transferred > 0 {
            debug!(range = %self.range, "reconnecting at current offset");
        }

        let stream = RangeStream::open(
            &writer.client,
            &self.target.url,
            self.range.start,
            self.range.request_end(),
            &self.retry,
            &writer.cancel,
        )
        .await?;
        let Some(mut stream) = stream else {
            // 416: the resource already ends here.
            debug!(range = %self.range, "nothing left to fetch");
            self.range.start = self.range.end.saturating_add(1);
            return Ok(());
        };
        if self.range.is_open_ended() {
            if let Some(total) = stream.total_length().filter(|t| *t > 0) {
                self.range.end = total - 1;
                writer.progress.set_total(total);
            }
        }

        let expected = self.range.remaining();
        let mut received: u64 = 0;
        loop {
            let want = (self.range.remaining().min(self.buf.len() as u64)) as usize;
            if want == 0 {
                break;
            }
            let n = with_timeout(self.retry.timeout, async {
                Ok(stream.read(&mut self.buf[..want]).await?)
            })
            .await?;
            if n == 0 {
                break;
            }

            if let Some(limiter) = &writer.limiter {
                limiter.request_permission(n).await;
            }
            self.sink.write_at(self.range.start, &self.buf[..n]).await?;

            let n = n as u64;
            self.range.advance(n);
            self.transferred += n;
            received += n;
            writer.progress.report(n);
            if let Some(store) = &writer.store {
                store.advance_range(self.range).await?;
            }
        }

        if self.range.is_open_ended() || self.range.is_satisfied() {
            Ok(())
        } else {
            Err(DownloadError::PrematureEof { expected, received })
        }
    }
}
