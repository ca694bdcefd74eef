#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rangedl::{DownloadOptions, RetryPolicy};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

pub const FILE_PATH: &str = "/files/payload.bin";

pub fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

/// Serves byte ranges of a fixed body the way a range-capable server does.
#[derive(Clone)]
pub struct RangeServer {
    body: Arc<Vec<u8>>,
    hits: Arc<AtomicUsize>,
    ranges: Arc<Mutex<Vec<String>>>,
    truncate_remaining: Arc<AtomicUsize>,
    truncate_to: usize,
}

impl RangeServer {
    pub fn new(body: Vec<u8>) -> Self {
        Self {
            body: Arc::new(body),
            hits: Arc::new(AtomicUsize::new(0)),
            ranges: Arc::new(Mutex::new(Vec::new())),
            truncate_remaining: Arc::new(AtomicUsize::new(0)),
            truncate_to: 0,
        }
    }

    /// Cut the body of the first `count` bounded range responses after
    /// `keep` bytes, as a dropped connection would.
    pub fn truncating(mut self, count: usize, keep: usize) -> Self {
        self.truncate_remaining = Arc::new(AtomicUsize::new(count));
        self.truncate_to = keep;
        self
    }

    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }

    /// `Range` header values in arrival order.
    pub fn ranges(&self) -> Vec<String> {
        self.ranges.lock().clone()
    }

    pub async fn mount(&self, server: &MockServer) {
        Mock::given(method("GET"))
            .and(path(FILE_PATH))
            .respond_with(self.clone())
            .mount(server)
            .await;
    }

    fn take_truncation(&self) -> bool {
        self.truncate_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl Respond for RangeServer {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        self.hits.fetch_add(1, Ordering::SeqCst);
        let len = self.body.len();
        let Some(header) = request.headers.get("Range").and_then(|v| v.to_str().ok()) else {
            return ResponseTemplate::new(200).set_body_bytes(self.body.to_vec());
        };
        self.ranges.lock().push(header.to_string());

        let spec = header.trim_start_matches("bytes=");
        let (start, end) = spec.split_once('-').unwrap_or((spec, ""));
        let start: usize = start.parse().unwrap_or(0);
        let bounded = !end.is_empty();
        if start >= len {
            return ResponseTemplate::new(416).insert_header("Content-Range", format!("bytes */{}", len).as_str());
        }
        let end = end.parse::<usize>().map(|e| e.min(len - 1)).unwrap_or(len - 1);

        let mut slice = &self.body[start..=end];
        if bounded && self.take_truncation() {
            slice = &slice[..self.truncate_to.min(slice.len())];
        }
        ResponseTemplate::new(206)
            .insert_header("Content-Range", format!("bytes {}-{}/{}", start, end, len).as_str())
            .set_body_bytes(slice.to_vec())
    }
}

pub async fn start(body: Vec<u8>) -> (MockServer, RangeServer, String) {
    start_with(RangeServer::new(body)).await
}

pub async fn start_with(responder: RangeServer) -> (MockServer, RangeServer, String) {
    let server = MockServer::start().await;
    responder.mount(&server).await;
    let url = format!("{}{}", server.uri(), FILE_PATH);
    (server, responder, url)
}

pub fn fast_retry() -> RetryPolicy {
    RetryPolicy::new(3, Duration::from_millis(10), Duration::from_secs(5))
}

/// Small chunks and buffers so short payloads span several chunks.
pub fn options(chunk: u64) -> DownloadOptions {
    DownloadOptions::default()
        .chunk_size(chunk)
        .buffer_size(256)
        .retry(fast_retry())
}
