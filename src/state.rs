//! Durable record of a download's progress, serialized as JSON next to the
//! output file.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Deserializer, Serialize};

use crate::range::Range;

/// Schema version written by this build. Files with a newer major version
/// are treated as absent.
pub const STATE_VERSION: u32 = 1;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PersistedState {
    #[serde(default = "default_version")]
    pub version: u32,
    pub url: String,
    pub output_file_path: PathBuf,
    pub target_to_complete_size: u64,
    #[serde(default)]
    pub is_completed: bool,
    /// Largest range end ever registered, `None` until the first chunk.
    #[serde(default)]
    pub last_end_offset: Option<u64>,
    /// Pending work, sorted by `start`, pairwise disjoint.
    #[serde(default, rename = "ranges", deserialize_with = "deserialize_ranges")]
    pub pending_ranges: Vec<Range>,
}

fn default_version() -> u32 {
    STATE_VERSION
}

// `null` entries, or a `null` list, carry no work and are skipped.
fn deserialize_ranges<'de, D>(deserializer: D) -> Result<Vec<Range>, D::Error>
where
    D: Deserializer<'de>,
{
    let ranges: Option<Vec<Option<Range>>> = Option::deserialize(deserializer)?;
    Ok(ranges.unwrap_or_default().into_iter().flatten().collect())
}

impl PersistedState {
    pub fn new(url: impl Into<String>, output_file_path: impl Into<PathBuf>, target_size: u64) -> Self {
        Self {
            version: STATE_VERSION,
            url: url.into(),
            output_file_path: output_file_path.into(),
            target_to_complete_size: target_size,
            is_completed: false,
            last_end_offset: None,
            pending_ranges: Vec::new(),
        }
    }

    pub fn completed(url: impl Into<String>, output_file_path: impl Into<PathBuf>, target_size: u64) -> Self {
        let mut state = Self::new(url, output_file_path, target_size);
        state.is_completed = true;
        state.last_end_offset = target_size.checked_sub(1);
        state
    }

    pub fn output_path(&self) -> &Path {
        &self.output_file_path
    }

    /// Restore the ordering/disjointness invariants after deserializing.
    /// Degenerate entries are dropped. Overlapping ranges are merged into
    /// their union so no unfinished byte is lost.
    pub fn normalize(&mut self) {
        self.pending_ranges.retain(|r| !r.is_degenerate());
        self.pending_ranges.sort_by_key(|r| (r.start, r.end));
        let mut kept: Vec<Range> = Vec::with_capacity(self.pending_ranges.len());
        for range in self.pending_ranges.drain(..) {
            match kept.last_mut() {
                Some(prev) if prev.overlaps(&range) => prev.end = prev.end.max(range.end),
                _ => kept.push(range),
            }
        }
        self.pending_ranges = kept;
        if let Some(max_end) = self.pending_ranges.last().map(|r| r.end) {
            self.last_end_offset = Some(self.last_end_offset.map_or(max_end, |e| e.max(max_end)));
        }
    }

    /// Add an in-flight range. Returns `false` if it is already present,
    /// degenerate, or would overlap a pending range.
    pub fn push_range(&mut self, range: Range) -> bool {
        if range.is_degenerate() {
            return false;
        }
        let idx = self.pending_ranges.partition_point(|r| r.start < range.start);
        let clashes_prev = idx > 0 && self.pending_ranges[idx - 1].overlaps(&range);
        let clashes_next = self
            .pending_ranges
            .get(idx)
            .map_or(false, |r| r.overlaps(&range));
        if clashes_prev || clashes_next {
            return false;
        }
        self.pending_ranges.insert(idx, range);
        true
    }

    /// Retire a range. Matches on `end`, which identifies a chunk for its
    /// whole life since only `start` moves.
    pub fn pop_range(&mut self, range: Range) -> bool {
        match self.find_by_end(range.end) {
            Some(idx) => {
                self.pending_ranges.remove(idx);
                true
            }
            None => false,
        }
    }

    /// Move the start of the pending range ending at `range.end` forward to
    /// `range.start`. Never moves it backwards.
    pub fn advance_range(&mut self, range: Range) -> bool {
        match self.find_by_end(range.end) {
            Some(idx) => {
                let pending = &mut self.pending_ranges[idx];
                if range.start > pending.start {
                    pending.start = range.start;
                }
                true
            }
            None => false,
        }
    }

    pub fn update_last_end_offset(&mut self, range: Range) {
        self.last_end_offset = Some(self.last_end_offset.map_or(range.end, |e| e.max(range.end)));
    }

    /// Bytes not covered by pending ranges below the furthest registered
    /// offset, i.e. bytes already on disk.
    pub fn completed_bytes(&self) -> u64 {
        if self.is_completed {
            return self.target_to_complete_size;
        }
        let Some(last) = self.last_end_offset else {
            return 0;
        };
        let pending: u64 = self.pending_ranges.iter().map(|r| r.remaining()).sum();
        last.saturating_add(1).saturating_sub(pending)
    }

    /// Whether any recorded offset lies at or past `target_size`.
    pub fn exceeds(&self, target_size: u64) -> bool {
        self.last_end_offset.map_or(false, |e| e >= target_size)
            || self.pending_ranges.iter().any(|r| r.end >= target_size)
    }

    fn find_by_end(&self, end: u64) -> Option<usize> {
        let idx = self.pending_ranges.partition_point(|r| r.end < end);
        match self.pending_ranges.get(idx) {
            Some(r) if r.end == end => Some(idx),
            _ => None,
        }
    }
}
