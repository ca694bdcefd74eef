//! Loading, saving and reconciling the persisted chunk state of one output
//! file.

use std::ffi::OsString;
use std::fmt;
use std::path::{Path, PathBuf};

use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::Result;
use crate::range::Range;
use crate::state::{PersistedState, STATE_VERSION};

/// Suffix appended to the output file name for its metadata sibling.
pub const METADATA_SUFFIX: &str = ".part.json";

/// No valid serialized state is shorter than this.
pub const MIN_METADATA_LEN: u64 = 32;

/// Sibling metadata path for `output`.
pub fn metadata_path(output: &Path) -> PathBuf {
    let mut name: OsString = output.as_os_str().to_os_string();
    name.push(METADATA_SUFFIX);
    PathBuf::from(name)
}

/// Sizes of the files involved, taken once before reconciling.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiskSnapshot {
    pub output_len: Option<u64>,
    pub metadata_len: Option<u64>,
}

impl DiskSnapshot {
    pub async fn inspect(output_path: &Path) -> Self {
        Self {
            output_len: file_len(output_path).await,
            metadata_len: file_len(&metadata_path(output_path)).await,
        }
    }
}

async fn file_len(path: &Path) -> Option<u64> {
    match fs::metadata(path).await {
        Ok(m) if m.is_file() => Some(m.len()),
        _ => None,
    }
}

/// Why existing output and metadata have to be thrown away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartReason {
    OverwriteRequested,
    OutputLargerThanTarget,
    MetadataTooSmall,
    OutputMissing,
    CompletedLengthMismatch,
    StaleUrl,
    TargetSizeChanged,
    OffsetsBeyondTarget,
    OutputTruncated,
}

impl fmt::Display for RestartReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            RestartReason::OverwriteRequested => "overwrite requested",
            RestartReason::OutputLargerThanTarget => "output file is larger than the remote size",
            RestartReason::MetadataTooSmall => "metadata file is implausibly small",
            RestartReason::OutputMissing => "metadata exists but the output file does not",
            RestartReason::CompletedLengthMismatch => "completed metadata disagrees with output length",
            RestartReason::StaleUrl => "metadata belongs to a different URL",
            RestartReason::TargetSizeChanged => "remote size changed since metadata was written",
            RestartReason::OffsetsBeyondTarget => "metadata records offsets past the end of the resource",
            RestartReason::OutputTruncated => "output file is shorter than recorded progress",
        };
        f.write_str(msg)
    }
}

/// Decide whether the loaded state can be resumed. `None` means keep it.
pub fn sanity_check(
    state: &PersistedState,
    disk: &DiskSnapshot,
    url: &str,
    target_size: u64,
    overwrite: bool,
) -> Option<RestartReason> {
    if overwrite && (disk.output_len.is_some() || disk.metadata_len.is_some()) {
        return Some(RestartReason::OverwriteRequested);
    }
    if disk.output_len.map_or(false, |len| len > target_size) {
        return Some(RestartReason::OutputLargerThanTarget);
    }
    let Some(metadata_len) = disk.metadata_len else {
        return None;
    };
    if disk.output_len.is_some() && metadata_len < MIN_METADATA_LEN {
        return Some(RestartReason::MetadataTooSmall);
    }
    let Some(output_len) = disk.output_len else {
        return Some(RestartReason::OutputMissing);
    };
    if state.url != url {
        return Some(RestartReason::StaleUrl);
    }
    if state.target_to_complete_size != target_size {
        return Some(RestartReason::TargetSizeChanged);
    }
    if state.exceeds(target_size) {
        return Some(RestartReason::OffsetsBeyondTarget);
    }
    if state.pending_ranges.is_empty() {
        if state.is_completed && output_len != target_size {
            return Some(RestartReason::CompletedLengthMismatch);
        }
        if !state.is_completed && state.last_end_offset.map_or(false, |e| output_len <= e) {
            return Some(RestartReason::OutputTruncated);
        }
    }
    None
}

/// Remove both the output file and its metadata. Missing files are fine.
pub async fn discard(output_path: &Path) -> Result<()> {
    for path in [output_path.to_path_buf(), metadata_path(output_path)] {
        match fs::remove_file(&path).await {
            Ok(()) => debug!(path = %path.display(), "discarded"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

/// Owns the persisted state of the single in-progress download for one
/// output path and serializes every load-modify-save against it.
pub struct MetadataStore {
    path: PathBuf,
    state: Mutex<PersistedState>,
}

impl MetadataStore {
    pub fn new(state: PersistedState) -> Self {
        Self {
            path: metadata_path(state.output_path()),
            state: Mutex::new(state),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the state for `output_path`, synthesizing one when the file is
    /// absent, unreadable, corrupt or from an incompatible version.
    pub async fn load(url: &str, output_path: &Path, target_size: u64) -> PersistedState {
        let path = metadata_path(output_path);
        match fs::read(&path).await {
            Ok(bytes) => match serde_json::from_slice::<PersistedState>(&bytes) {
                Ok(mut state) if state.version <= STATE_VERSION => {
                    state.normalize();
                    state.output_file_path = output_path.to_path_buf();
                    return state;
                }
                Ok(state) => {
                    warn!(path = %path.display(), version = state.version, "unsupported metadata version, ignoring");
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "corrupt metadata, ignoring");
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                warn!(path = %path.display(), error = %e, "unreadable metadata, ignoring");
            }
        }

        match file_len(output_path).await {
            Some(len) if len == target_size => PersistedState::completed(url, output_path, target_size),
            _ => PersistedState::new(url, output_path, target_size),
        }
    }

    pub async fn snapshot(&self) -> PersistedState {
        self.state.lock().await.clone()
    }

    /// Apply `f` and persist the result while holding the lock.
    pub async fn update<R>(&self, f: impl FnOnce(&mut PersistedState) -> R) -> Result<R> {
        let mut state = self.state.lock().await;
        let out = f(&mut state);
        self.write(&state).await?;
        Ok(out)
    }

    pub async fn save(&self) -> Result<()> {
        let state = self.state.lock().await;
        self.write(&state).await
    }

    pub async fn push_range(&self, range: Range) -> Result<bool> {
        self.update(|s| s.push_range(range)).await
    }

    pub async fn pop_range(&self, range: Range) -> Result<bool> {
        self.update(|s| s.pop_range(range)).await
    }

    pub async fn advance_range(&self, range: Range) -> Result<bool> {
        self.update(|s| s.advance_range(range)).await
    }

    pub async fn update_last_end_offset(&self, range: Range) -> Result<()> {
        self.update(|s| s.update_last_end_offset(range)).await
    }

    pub async fn mark_completed(&self) -> Result<()> {
        self.update(|s| {
            s.pending_ranges.clear();
            s.is_completed = true;
        })
        .await
    }

    /// Best-effort removal once the whole transfer is complete.
    pub async fn delete(output_path: &Path) {
        let path = metadata_path(output_path);
        match fs::remove_file(&path).await {
            Ok(()) => debug!(path = %path.display(), "metadata removed"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %path.display(), error = %e, "failed to remove metadata"),
        }
    }

    // Readers never observe a half-written file: write a temp sibling, then
    // rename over the real one.
    async fn write(&self, state: &PersistedState) -> Result<()> {
        let content = serde_json::to_vec(state).map_err(std::io::Error::other)?;
        let mut tmp: OsString = self.path.as_os_str().to_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        fs::write(&tmp, content).await?;
        fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}
