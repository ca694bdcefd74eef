//! Decides which byte ranges still have to be fetched, and in what order.

use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt};
use reqwest::Client;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use url::Url;

use crate::error::{DownloadError, Result};
use crate::metadata::MetadataStore;
use crate::progress::ProgressReporter;
use crate::range::{ChunkDescriptor, Range, RemoteTarget};
use crate::retry::{retry_with_backoff, RetryPolicy};
use crate::scheduler::ChunkSource;
use crate::state::PersistedState;
use crate::stream::{RangeRequest, RangeResponse};

pub const DEFAULT_CHUNK_SIZE: u64 = 4 * 1024 * 1024;

/// Discover the remote length with an open-ended range GET, retrying
/// transient failures. A server that reports no length is a configuration
/// error: the resource cannot be chunked.
pub async fn probe_content_length(
    client: &Client,
    url: &Url,
    policy: &RetryPolicy,
    cancel: &CancellationToken,
) -> Result<u64> {
    let mut request = RangeRequest::new(client.clone(), url.clone(), 0, None, policy.timeout);
    let response = retry_with_backoff(policy, cancel, "probe content length", &mut request, |req| {
        req.send().boxed()
    })
    .await?;
    match response {
        RangeResponse::Stream(stream) => stream
            .total_length()
            .ok_or_else(|| DownloadError::config(format!("{} did not report a content length", url))),
        RangeResponse::NotSatisfiable { total } => Ok(total.unwrap_or(0)),
    }
}

/// What a resumed download still has to do, derived from reconciled
/// metadata and the output length without touching either.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResumePlan {
    /// Pending ranges to replay, ascending, starts adjusted to the file.
    pub replay: Vec<Range>,
    /// Pending ranges whose bytes are all on disk already.
    pub finished: Vec<Range>,
    /// Pending ranges whose start moved forward to the output length.
    pub advanced: Vec<Range>,
    /// Where fresh chunks start.
    pub next_offset: u64,
    pub target_size: u64,
    /// The existing file length was taken as downloaded.
    pub from_file_length: bool,
}

impl ResumePlan {
    pub fn compute(state: &PersistedState, output_len: Option<u64>, chunk_size: u64, target_size: u64) -> Self {
        let mut plan = Self {
            replay: Vec::new(),
            finished: Vec::new(),
            advanced: Vec::new(),
            next_offset: target_size,
            target_size,
            from_file_length: false,
        };
        if state.is_completed {
            return plan;
        }
        let output_len = output_len.unwrap_or(0);

        // Bytes of a pending range below the output length were written by
        // that range itself: no other range writes inside it.
        for range in &state.pending_ranges {
            let mut range = *range;
            if range.start < output_len && output_len <= range.end.saturating_add(1) {
                range.start = output_len;
                if range.is_consumed_sentinel() {
                    plan.finished.push(range);
                    continue;
                }
                plan.advanced.push(range);
            }
            plan.replay.push(range);
        }

        let metadata_end = state
            .pending_ranges
            .iter()
            .map(|r| r.end.saturating_add(1))
            .chain(state.last_end_offset.map(|e| e.saturating_add(1)))
            .max()
            .unwrap_or(0);
        // No range in flight and a file at least as long as anything recorded:
        // the whole file counts as downloaded.
        plan.from_file_length =
            state.pending_ranges.is_empty() && output_len > chunk_size && output_len >= metadata_end;
        let resume_at = if plan.from_file_length { output_len } else { metadata_end };
        plan.next_offset = resume_at.min(target_size);
        plan
    }

    /// Bytes already on disk according to this plan.
    pub fn already_downloaded(&self) -> u64 {
        let pending: u64 = self.replay.iter().map(|r| r.remaining()).sum();
        self.next_offset.saturating_sub(pending)
    }
}

/// Lazy, single-pass sequence of chunk descriptors.
///
/// Pending ranges from the metadata are replayed first, in ascending order;
/// fresh fixed-size chunks follow from the furthest known offset to the end
/// of the resource. Fresh chunks are persisted before they are returned.
pub struct ChunkPlanner {
    target: Arc<RemoteTarget>,
    store: Arc<MetadataStore>,
    progress: ProgressReporter,
    retry: RetryPolicy,
    chunk_size: u64,
    target_size: u64,
    replay: std::vec::IntoIter<Range>,
    /// One past the end of the last range handed out or skipped.
    cursor: u64,
    /// Where fresh chunks start.
    next_offset: u64,
    tail_reported: bool,
}

impl ChunkPlanner {
    /// Build the plan from the store's reconciled state and the current
    /// output length, persisting the adjustments the file length implies.
    pub async fn new(
        target: Arc<RemoteTarget>,
        store: Arc<MetadataStore>,
        progress: ProgressReporter,
        output_len: Option<u64>,
        chunk_size: u64,
        retry: RetryPolicy,
    ) -> Result<Self> {
        let target_size = target
            .size
            .ok_or_else(|| DownloadError::config(format!("unknown content length for {}", target.url)))?;
        if chunk_size == 0 {
            return Err(DownloadError::config("chunk size must be positive"));
        }
        let state = store.snapshot().await;
        let plan = ResumePlan::compute(&state, output_len, chunk_size, target_size);

        for range in &plan.finished {
            debug!(%range, "range already fully written");
            store.pop_range(*range).await?;
        }
        for range in &plan.advanced {
            store.advance_range(*range).await?;
        }
        if state.is_completed {
            info!(url = %target.url, "already complete");
        } else if plan.from_file_length {
            info!(offset = plan.next_offset, "resuming from existing file length");
        }

        info!(
            url = %target.url,
            replayed = plan.replay.len(),
            next_offset = plan.next_offset,
            target_size,
            "chunk plan ready"
        );

        Ok(Self {
            target,
            store,
            progress,
            retry,
            chunk_size,
            target_size,
            replay: plan.replay.into_iter(),
            cursor: 0,
            next_offset: plan.next_offset,
            tail_reported: false,
        })
    }

    pub fn target_size(&self) -> u64 {
        self.target_size
    }

    pub async fn next_chunk(&mut self) -> Result<Option<ChunkDescriptor>> {
        if let Some(range) = self.replay.next() {
            self.skip_to(range.start);
            self.cursor = range.end.saturating_add(1);
            debug!(%range, "replaying pending range");
            return Ok(Some(self.descriptor(range)));
        }

        if !self.tail_reported {
            self.tail_reported = true;
            self.skip_to(self.next_offset);
        }

        if self.next_offset >= self.target_size {
            return Ok(None);
        }

        let end = self
            .next_offset
            .saturating_add(self.chunk_size - 1)
            .min(self.target_size - 1);
        let range = Range::new(self.next_offset, end);
        self.store
            .update(|s| {
                s.push_range(range);
                s.update_last_end_offset(range);
            })
            .await?;
        self.next_offset = end + 1;
        self.cursor = self.next_offset;
        debug!(%range, "planned chunk");
        Ok(Some(self.descriptor(range)))
    }

    // Bytes between the cursor and `offset` are already on disk.
    fn skip_to(&mut self, offset: u64) {
        if offset > self.cursor {
            self.progress.report_existing(offset - self.cursor);
            self.cursor = offset;
        }
    }

    fn descriptor(&self, range: Range) -> ChunkDescriptor {
        ChunkDescriptor::new(self.target.clone(), range, self.retry)
    }
}

impl ChunkSource for ChunkPlanner {
    fn next_chunk(&mut self) -> BoxFuture<'_, Result<Option<ChunkDescriptor>>> {
        ChunkPlanner::next_chunk(self).boxed()
    }
}
