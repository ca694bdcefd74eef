mod cli;
mod commands;

use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::warn;
use tracing_subscriber::EnvFilter;

use crate::cli::Args;
use rangedl::config::parse_url;
use rangedl::utils::output_path_for;
use rangedl::{ClientConfig, DownloadClient, DownloadOptions, RetryPolicy, SpeedLimiter};

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("rangedl=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn options_from(args: &Args) -> DownloadOptions {
    let mut options = DownloadOptions::default()
        .overwrite(args.overwrite)
        .max_concurrency(args.concurrency)
        .chunk_size(args.chunk_size_mib.saturating_mul(1024 * 1024))
        .retry(RetryPolicy {
            count: args.retries,
            timeout: Duration::from_secs(args.timeout),
            ..RetryPolicy::default()
        });
    if let Some(rate) = args.rate_limit {
        options = options.speed_limiter(Arc::new(SpeedLimiter::new(Some(rate))));
    }
    options
}

fn main() -> Result<()> {
    let mut args = Args::parse();
    init_tracing();

    // Output dir might not exist yet, so we resolve it relative to current dir
    if args.download_dir.is_relative() {
        if let Ok(cwd) = std::env::current_dir() {
            args.download_dir = cwd.join(&args.download_dir);
        }
    }

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        if args.list {
            return crate::commands::list_downloads(args.download_dir.clone()).await;
        }

        let client = Arc::new(DownloadClient::new(&ClientConfig::default())?);
        let cancel = CancellationToken::new();
        {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("interrupted, stopping downloads");
                    cancel.cancel();
                }
            });
        }
        let options = options_from(&args);

        match args.url.as_deref() {
            Some(url) => {
                let output = match &args.output {
                    Some(path) => path.clone(),
                    None => output_path_for(&args.download_dir, &parse_url(url)?),
                };
                if args.status {
                    return crate::commands::show_remote_status(&client, url, &cancel).await;
                }
                if args.dry_run {
                    return crate::commands::show_downloaded_size(&client, url, &output, &options, &cancel).await;
                }
                crate::commands::run_single_download(&client, url, output, &options, &cancel).await
            }
            None => {
                let tasks_file = std::fs::canonicalize(&args.tasks_file)
                    .with_context(|| format!("Tasks file {:?} not found", args.tasks_file))?;
                crate::commands::run_downloads(
                    client,
                    tasks_file,
                    args.download_dir.clone(),
                    args.jobs,
                    options,
                    cancel,
                )
                .await
            }
        }
    })
}
