//! One HTTP range request exposed as a bounded, forward-only byte stream.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures::future::FutureExt;
use futures::stream::{BoxStream, StreamExt, TryStreamExt};
use reqwest::header::{CONTENT_RANGE, RANGE};
use reqwest::{Client, StatusCode};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, ReadBuf, Take};
use tokio_util::io::StreamReader;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use url::Url;

use crate::error::{DownloadError, Result};
use crate::retry::{retry_with_backoff, with_timeout, RetryPolicy};

/// Value of the `Range` header for `[start, end]`, open-ended when `end` is
/// `None`.
pub fn range_header(start: u64, end: Option<u64>) -> String {
    match end {
        Some(end) => format!("bytes={}-{}", start, end),
        None => format!("bytes={}-", start),
    }
}

/// Total resource length from a `Content-Range` value: `bytes a-b/N` or
/// `bytes */N`. `None` when the length is `*` or the value is malformed.
pub fn parse_content_range_total(value: &str) -> Option<u64> {
    let rest = value.trim().strip_prefix("bytes")?.trim_start();
    let (_, total) = rest.rsplit_once('/')?;
    total.trim().parse().ok()
}

/// Outcome of a single successful request.
pub enum RangeResponse {
    Stream(RangeStream),
    /// HTTP 416: nothing to fetch at this offset.
    NotSatisfiable { total: Option<u64> },
}

/// Parameters of one range GET, reusable across retry attempts.
#[derive(Debug, Clone)]
pub struct RangeRequest {
    client: Client,
    url: Url,
    start: u64,
    end: Option<u64>,
    timeout: Duration,
}

impl RangeRequest {
    pub fn new(client: Client, url: Url, start: u64, end: Option<u64>, timeout: Duration) -> Self {
        Self {
            client,
            url,
            start,
            end,
            timeout,
        }
    }

    pub fn header_value(&self) -> String {
        range_header(self.start, self.end)
    }

    async fn response(&self) -> Result<reqwest::Response> {
        let request = self
            .client
            .get(self.url.clone())
            .header(RANGE, self.header_value());
        with_timeout(self.timeout, async { Ok(request.send().await?) }).await
    }

    /// One attempt, no retry. Waits for headers only.
    pub async fn send(&self) -> Result<RangeResponse> {
        let resp = self.response().await?;
        let status = resp.status();
        let total_from_range = resp
            .headers()
            .get(CONTENT_RANGE)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_content_range_total);

        if status == StatusCode::RANGE_NOT_SATISFIABLE {
            debug!(url = %self.url, range = %self.header_value(), "range not satisfiable");
            return Ok(RangeResponse::NotSatisfiable {
                total: total_from_range,
            });
        }
        if !status.is_success() {
            return Err(DownloadError::RemoteRequest {
                status: status.as_u16(),
                url: self.url.to_string(),
            });
        }

        let content_length = resp.content_length();
        let total_length = if status == StatusCode::PARTIAL_CONTENT {
            total_from_range
        } else {
            if self.start > 0 {
                return Err(DownloadError::config(format!(
                    "{} ignored the range request (HTTP {})",
                    self.url, status
                )));
            }
            content_length
        };

        let limit = self
            .end
            .map(|end| end.saturating_add(1).saturating_sub(self.start))
            .unwrap_or(u64::MAX);
        let body: BoxStream<'static, io::Result<Bytes>> =
            resp.bytes_stream().map_err(io::Error::other).boxed();

        Ok(RangeResponse::Stream(RangeStream {
            status,
            content_length,
            total_length,
            reader: StreamReader::new(body).take(limit),
        }))
    }

    /// One attempt returning only the status code; the body is dropped.
    pub async fn status(&self) -> Result<StatusCode> {
        Ok(self.response().await?.status())
    }
}

/// Response body of a range request. Read-only, sequential, not seekable.
/// Dropping it releases the connection.
pub struct RangeStream {
    status: StatusCode,
    content_length: Option<u64>,
    total_length: Option<u64>,
    reader: Take<StreamReader<BoxStream<'static, io::Result<Bytes>>, Bytes>>,
}

impl RangeStream {
    /// Open `[start, end]` of `url`, retrying transient connection failures.
    /// Returns `None` on HTTP 416.
    pub async fn open(
        client: &Client,
        url: &Url,
        start: u64,
        end: Option<u64>,
        policy: &RetryPolicy,
        cancel: &CancellationToken,
    ) -> Result<Option<RangeStream>> {
        let mut request = RangeRequest::new(client.clone(), url.clone(), start, end, policy.timeout);
        let response = retry_with_backoff(policy, cancel, "open range", &mut request, |req| {
            req.send().boxed()
        })
        .await?;
        Ok(match response {
            RangeResponse::Stream(stream) => Some(stream),
            RangeResponse::NotSatisfiable { .. } => None,
        })
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// Length of this response body, as reported by the server.
    pub fn content_length(&self) -> Option<u64> {
        self.content_length
    }

    /// Length of the whole remote resource, when the server reported it.
    pub fn total_length(&self) -> Option<u64> {
        self.total_length
    }
}

impl AsyncRead for RangeStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.reader).poll_read(cx, buf)
    }
}
