//! Resumable, chunked HTTP downloads.
//!
//! A download is split into fixed-size byte ranges fetched concurrently with
//! `Range` requests and written in place into the output file. A metadata
//! sibling (`<output>.part.json`) records the ranges still pending so an
//! interrupted download continues where it stopped.
//!
//! ```no_run
//! use rangedl::{ClientConfig, DownloadClient, DownloadOptions};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn run() -> rangedl::Result<()> {
//! let client = DownloadClient::new(&ClientConfig::default())?;
//! let report = client
//!     .download_to_file(
//!         "https://example.com/big.iso",
//!         std::path::Path::new("big.iso"),
//!         &DownloadOptions::default().max_concurrency(8),
//!         &CancellationToken::new(),
//!     )
//!     .await?;
//! println!("{} bytes", report.bytes_total);
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod config;
pub mod error;
pub mod limiter;
pub mod metadata;
pub mod planner;
pub mod progress;
pub mod range;
pub mod retry;
pub mod scheduler;
pub mod state;
pub mod stream;
pub mod utils;
pub mod writer;

pub use client::{DownloadClient, DownloadReport, DownloadStatus, RemoteStatus};
pub use config::{ClientConfig, DownloadOptions, StreamRange};
pub use error::{DownloadError, Result};
pub use limiter::SpeedLimiter;
pub use progress::{ProgressCallback, ProgressSnapshot};
pub use range::Range;
pub use retry::RetryPolicy;
