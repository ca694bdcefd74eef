mod common;

use std::io::Cursor;

use common::{options, payload, start, start_with, RangeServer};
use rangedl::{DownloadClient, DownloadError, DownloadStatus, StreamRange};
use tokio_util::sync::CancellationToken;

fn client() -> DownloadClient {
    DownloadClient::with_client(reqwest::Client::new())
}

#[tokio::test]
async fn test_stream_download_whole_resource() {
    let body = payload(5000);
    let (_server, responder, url) = start(body.clone()).await;

    let mut out: Vec<u8> = Vec::new();
    let report = client()
        .download_to_stream(&url, &mut out, StreamRange::full(), &options(1024), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(out, body);
    assert_eq!(report.bytes_transferred, 5000);
    assert_eq!(responder.ranges(), vec!["bytes=0-"]);
}

#[tokio::test]
async fn test_stream_download_explicit_window() {
    let body = payload(5000);
    let (_server, responder, url) = start(body.clone()).await;

    let mut out: Vec<u8> = Vec::new();
    let report = client()
        .download_to_stream(
            &url,
            &mut out,
            StreamRange::between(1000, Some(1999)),
            &options(1024),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(out, &body[1000..2000]);
    assert_eq!(report.bytes_transferred, 1000);
    assert_eq!(responder.ranges(), vec!["bytes=1000-1999"]);
}

#[tokio::test]
async fn test_stream_reconnects_after_truncated_body() {
    let body = payload(3000);
    let (_server, responder, url) = start_with(RangeServer::new(body.clone()).truncating(1, 700)).await;

    let mut out: Vec<u8> = Vec::new();
    client()
        .download_to_stream(
            &url,
            &mut out,
            StreamRange::between(0, Some(2999)),
            &options(1024),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(out, body);
    assert_eq!(responder.ranges(), vec!["bytes=0-2999", "bytes=700-2999"]);
}

#[tokio::test]
async fn test_seekable_stream_continues_after_existing_bytes() {
    let body = payload(6000);
    let (_server, responder, url) = start(body.clone()).await;

    let mut out = Cursor::new(body[..4000].to_vec());
    let client = client();
    let report = client
        .download_to_seekable_stream(
            &url,
            &mut out,
            StreamRange::continuing(),
            &options(1024),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(out.into_inner(), body);
    assert_eq!(report.bytes_transferred, 2000);
    assert_eq!(report.bytes_total, 6000);
    assert_eq!(responder.ranges(), vec!["bytes=4000-"]);
    assert_eq!(client.status(), DownloadStatus::Finished);
}

#[tokio::test]
async fn test_seekable_stream_already_complete() {
    let body = payload(2048);
    let (_server, responder, url) = start(body.clone()).await;

    let mut out = Cursor::new(body.clone());
    let report = client()
        .download_to_seekable_stream(
            &url,
            &mut out,
            StreamRange::continuing(),
            &options(1024),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    // The server answers 416 at the end of the resource.
    assert_eq!(report.bytes_transferred, 0);
    assert_eq!(report.bytes_total, 2048);
    assert_eq!(responder.ranges(), vec!["bytes=2048-"]);
    assert_eq!(out.into_inner(), body);
}

#[tokio::test]
async fn test_stream_rejects_inverted_window() {
    let (_server, responder, url) = start(payload(100)).await;
    let mut out: Vec<u8> = Vec::new();
    let err = client()
        .download_to_stream(
            &url,
            &mut out,
            StreamRange::between(50, Some(10)),
            &options(1024),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, DownloadError::Configuration(_)));
    assert_eq!(responder.hits(), 0);
}
