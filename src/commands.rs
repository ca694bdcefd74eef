use anyhow::{bail, Context, Result};
use indicatif::{HumanBytes, MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use rangedl::config::parse_url;
use rangedl::metadata::METADATA_SUFFIX;
use rangedl::progress::ProgressSnapshot;
use rangedl::state::PersistedState;
use rangedl::utils::output_path_for;
use rangedl::{DownloadClient, DownloadOptions};

const BAR_TEMPLATE: &str =
    "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes:>12}/{total_bytes:<12} {bytes_per_sec:>12} {eta:>4} {msg}";

fn file_bar(multi: &MultiProgress, name: &str) -> ProgressBar {
    let pb = multi.add(ProgressBar::new(0));
    if let Ok(style) = ProgressStyle::default_bar().template(BAR_TEMPLATE) {
        pb.set_style(style.progress_chars("=>-"));
    }
    pb.set_message(format!("Downloading {}", name));
    pb
}

/// Options for one file, with a progress callback feeding `pb` and the
/// batch-wide byte counter.
fn with_bar(options: &DownloadOptions, pb: &ProgressBar, batch_bytes: Option<Arc<AtomicU64>>) -> DownloadOptions {
    let pb = pb.clone();
    options.clone().progress(Arc::new(move |n: u64, snap: ProgressSnapshot| {
        pb.set_length(snap.bytes_total);
        pb.set_position(snap.bytes_downloaded);
        if let Some(total) = &batch_bytes {
            total.fetch_add(n, Ordering::Relaxed);
        }
    }))
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

pub async fn run_single_download(
    client: &DownloadClient,
    url: &str,
    output: PathBuf,
    options: &DownloadOptions,
    cancel: &CancellationToken,
) -> Result<()> {
    let name = display_name(&output);
    let multi = MultiProgress::with_draw_target(ProgressDrawTarget::stderr_with_hz(5));
    let pb = file_bar(&multi, &name);
    let options = with_bar(options, &pb, None);

    match client.download_to_file(url, &output, &options, cancel).await {
        Ok(report) => {
            pb.finish_with_message(format!("Completed   {}", name));
            info!(
                path = %output.display(),
                transferred = %HumanBytes(report.bytes_transferred),
                "done"
            );
            Ok(())
        }
        Err(e) if e.is_cancelled() => {
            pb.abandon_with_message(format!("Paused      {} (run again to resume)", name));
            Ok(())
        }
        Err(e) => {
            pb.abandon_with_message(format!("Failed      {}", name));
            Err(e).with_context(|| format!("Failed to download {}", url))
        }
    }
}

async fn read_tasks(input: &Path) -> Result<Vec<String>> {
    let file = fs::File::open(input)
        .await
        .with_context(|| format!("Failed to open input file: {:?}", input))?;
    let mut lines = BufReader::new(file).lines();
    let mut urls = vec![];
    while let Some(line) = lines.next_line().await? {
        let raw = line.trim();
        if raw.is_empty() || raw.starts_with('#') {
            continue;
        }
        urls.push(raw.to_string());
    }
    Ok(urls)
}

pub async fn run_downloads(
    client: Arc<DownloadClient>,
    input: PathBuf,
    output_dir: PathBuf,
    jobs: Option<usize>,
    options: DownloadOptions,
    cancel: CancellationToken,
) -> Result<()> {
    let urls = read_tasks(&input).await?;
    if urls.is_empty() {
        bail!("No URLs found in {:?}", input);
    }
    let total_files = urls.len();

    let multi = MultiProgress::with_draw_target(ProgressDrawTarget::stderr_with_hz(5));
    let header_pb = multi.add(ProgressBar::new(0));
    if let Ok(style) = ProgressStyle::default_bar().template("{msg}") {
        header_pb.set_style(style);
    }

    let finished_files = Arc::new(AtomicUsize::new(0));
    let failed_files = Arc::new(AtomicUsize::new(0));
    let batch_bytes = Arc::new(AtomicU64::new(0));
    let monitor_cancel = CancellationToken::new();
    {
        let done = finished_files.clone();
        let bytes = batch_bytes.clone();
        let hpb = header_pb.clone();
        let stop = monitor_cancel.clone();
        tokio::spawn(async move {
            loop {
                hpb.set_message(format!(
                    "Summary: Files: {}/{} | Transferred: {}",
                    done.load(Ordering::Relaxed),
                    total_files,
                    HumanBytes(bytes.load(Ordering::Relaxed))
                ));
                hpb.tick();
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = tokio::time::sleep(Duration::from_millis(100)) => {}
                }
            }
        });
    }

    let semaphore = Arc::new(Semaphore::new(jobs.unwrap_or_else(num_cpus::get).max(1)));
    let mut handles = vec![];

    for url in urls {
        let parsed = match parse_url(&url) {
            Ok(parsed) => parsed,
            Err(e) => {
                error!(url = %url, error = %e, "skipping task");
                failed_files.fetch_add(1, Ordering::Relaxed);
                continue;
            }
        };
        let path = output_path_for(&output_dir, &parsed);
        let name = display_name(&path);
        let pb = file_bar(&multi, &name);
        let options = with_bar(&options, &pb, Some(batch_bytes.clone()));
        let client = client.clone();
        let semaphore = semaphore.clone();
        let cancel = cancel.clone();
        let finished = finished_files.clone();
        let failed = failed_files.clone();

        handles.push(tokio::spawn(async move {
            let Ok(_permit) = semaphore.acquire_owned().await else {
                return;
            };
            match client.download_to_file(&url, &path, &options, &cancel).await {
                Ok(_) => {
                    pb.finish_with_message(format!("Completed   {}", name));
                    finished.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) if e.is_cancelled() => {
                    pb.abandon_with_message(format!("Paused      {}", name));
                }
                Err(e) => {
                    pb.abandon_with_message(format!("Failed      {}", name));
                    error!(url = %url, error = %e, "download failed");
                    failed.fetch_add(1, Ordering::Relaxed);
                }
            }
        }));
    }

    for handle in handles {
        handle.await?;
    }
    monitor_cancel.cancel();
    header_pb.finish();

    let failed = failed_files.load(Ordering::Relaxed);
    if failed > 0 {
        bail!("{} of {} downloads failed", failed, total_files);
    }
    Ok(())
}

pub async fn show_remote_status(client: &DownloadClient, url: &str, cancel: &CancellationToken) -> Result<()> {
    let status = client.get_remote_status(url, cancel).await?;
    println!("{} {}", status.status, if status.success { "OK" } else { "FAILED" });
    Ok(())
}

pub async fn show_downloaded_size(
    client: &DownloadClient,
    url: &str,
    output: &Path,
    options: &DownloadOptions,
    cancel: &CancellationToken,
) -> Result<()> {
    let bytes = client.get_downloaded_size(url, output, options, cancel).await?;
    println!("{}: {} already on disk", output.display(), HumanBytes(bytes));
    Ok(())
}

pub async fn list_downloads(output: PathBuf) -> Result<()> {
    if !output.exists() {
        println!("Download directory '{:?}' does not exist.", output);
        println!("Tip: If you used a custom download directory, please specify it with --download-dir");
        return Ok(());
    }

    let mut active = vec![];
    let mut completed = vec![];
    let mut entries = fs::read_dir(&output).await?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        let filename = entry.file_name().to_string_lossy().into_owned();
        if let Some(stem) = filename.strip_suffix(METADATA_SUFFIX) {
            let Ok(content) = fs::read(&path).await else {
                continue;
            };
            if let Ok(state) = serde_json::from_slice::<PersistedState>(&content) {
                active.push((stem.to_string(), state));
            }
        } else if !filename.ends_with(".tmp") && filename != ".DS_Store" {
            if let Ok(metadata) = entry.metadata().await {
                if metadata.is_file() {
                    completed.push((filename, metadata.len()));
                }
            }
        }
    }
    let active_names: Vec<&str> = active.iter().map(|(name, _)| name.as_str()).collect();
    completed.retain(|(name, _)| !active_names.contains(&name.as_str()));

    let downloaded: u64 = active.iter().map(|(_, s)| s.completed_bytes()).sum::<u64>()
        + completed.iter().map(|(_, len)| *len).sum::<u64>();
    let known: u64 = active.iter().map(|(_, s)| s.target_to_complete_size).sum::<u64>()
        + completed.iter().map(|(_, len)| *len).sum::<u64>();
    println!(
        "Summary: Completed: {} | Active: {} | Downloaded: {} / {}",
        completed.len(),
        active.len(),
        HumanBytes(downloaded),
        HumanBytes(known)
    );
    println!();

    println!("{:<50} {:<15} {:<15} {:<15}", "Filename", "Status", "Progress", "Size");
    println!("{:-<50} {:-<15} {:-<15} {:-<15}", "", "", "", "");

    for (name, state) in &active {
        let total = state.target_to_complete_size;
        let progress = if total > 0 {
            (state.completed_bytes() as f64 / total as f64) * 100.0
        } else {
            0.0
        };
        println!(
            "{:<50} {:<15} {:<15} {:<15}",
            name,
            "Downloading",
            format!("{:.2}%", progress),
            format!("{}", HumanBytes(total))
        );
    }
    for (name, len) in &completed {
        println!(
            "{:<50} {:<15} {:<15} {:<15}",
            name,
            "Completed",
            "100.00%",
            format!("{}", HumanBytes(*len))
        );
    }

    if active.is_empty() && completed.is_empty() {
        println!("No active or completed downloads found in '{:?}'.", output);
    }
    Ok(())
}
