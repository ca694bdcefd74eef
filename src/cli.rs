use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(author, version, about = "Resumable chunked HTTP downloader", long_about = None)]
pub struct Args {
    /// Single URL to download (if provided, tasks-file is ignored)
    #[arg(index = 1)]
    pub url: Option<String>,

    /// Output file for a single URL (defaults to the URL's file name inside --download-dir)
    #[arg(short = 'o', long)]
    pub output: Option<PathBuf>,

    /// Path to the file containing URLs (one per line)
    #[arg(short = 't', long = "tasks-file", default_value = "download.txt")]
    pub tasks_file: PathBuf,

    /// Directory to save downloaded files
    #[arg(short = 'd', long = "download-dir", default_value = "downloads")]
    pub download_dir: PathBuf,

    /// Concurrent chunk requests per file
    #[arg(short = 'c', long, default_value_t = 4)]
    pub concurrency: usize,

    /// Maximum number of files downloaded at once in batch mode (defaults to number of logical CPUs)
    #[arg(short = 'j', long)]
    pub jobs: Option<usize>,

    /// Chunk size in MiB
    #[arg(short = 's', long = "chunk-size", default_value_t = 4)]
    pub chunk_size_mib: u64,

    /// Global rate limit in bytes per second (e.g., 1048576 for 1MB/s)
    #[arg(short = 'r', long)]
    pub rate_limit: Option<u32>,

    /// Retries per request before giving up
    #[arg(long, default_value_t = 5)]
    pub retries: u32,

    /// Per-request timeout in seconds
    #[arg(long, default_value_t = 30)]
    pub timeout: u64,

    /// Discard existing output and metadata and start over
    #[arg(long)]
    pub overwrite: bool,

    /// List in-progress and completed downloads in --download-dir
    #[arg(short = 'l', long)]
    pub list: bool,

    /// Print the HTTP status of URL and exit
    #[arg(long, requires = "url")]
    pub status: bool,

    /// Print how many bytes of URL are already on disk and exit
    #[arg(long = "dry-run", requires = "url")]
    pub dry_run: bool,
}
