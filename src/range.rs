//! Byte ranges and the units of work built from them.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::retry::RetryPolicy;

/// Inclusive `[start, end]` byte interval.
///
/// `start` advances toward `end` as bytes are written; the range is satisfied
/// once `start > end`.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Range {
    pub start: u64,
    pub end: u64,
}

/// `end` of a range whose length is not known up front.
pub const OPEN_END: u64 = u64::MAX;

impl Range {
    pub fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    /// Everything from `start` to the end of the resource.
    pub fn open(start: u64) -> Self {
        Self { start, end: OPEN_END }
    }

    pub fn is_open_ended(&self) -> bool {
        self.end == OPEN_END
    }

    /// `end` for the `Range` header; `None` when open-ended.
    pub fn request_end(&self) -> Option<u64> {
        (!self.is_open_ended()).then_some(self.end)
    }

    /// Bytes still left in the range.
    pub fn remaining(&self) -> u64 {
        if self.is_satisfied() {
            0
        } else {
            (self.end - self.start).saturating_add(1)
        }
    }

    pub fn is_satisfied(&self) -> bool {
        self.start > self.end
    }

    /// `end < start` by exactly one: everything was consumed.
    pub fn is_consumed_sentinel(&self) -> bool {
        self.end.checked_add(1) == Some(self.start)
    }

    /// Degenerate entries that must never be stored or dispatched.
    pub fn is_degenerate(&self) -> bool {
        self.start > self.end
    }

    pub fn overlaps(&self, other: &Range) -> bool {
        self.start <= other.end && other.start <= self.end
    }

    pub fn contains(&self, offset: u64) -> bool {
        self.start <= offset && offset <= self.end
    }

    pub fn advance(&mut self, n: u64) {
        self.start = self.start.saturating_add(n);
    }
}

impl fmt::Display for Range {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_open_ended() {
            write!(f, "[{}, ..]", self.start)
        } else {
            write!(f, "[{}, {}]", self.start, self.end)
        }
    }
}

/// The resource being downloaded. Immutable for one download attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTarget {
    pub url: Url,
    pub size: Option<u64>,
}

impl RemoteTarget {
    pub fn new(url: Url, size: Option<u64>) -> Self {
        Self { url, size }
    }
}

/// One unit of work handed from the planner to a chunk writer.
#[derive(Debug, Clone)]
pub struct ChunkDescriptor {
    pub target: Arc<RemoteTarget>,
    pub range: Range,
    pub retry: RetryPolicy,
}

impl ChunkDescriptor {
    pub fn new(target: Arc<RemoteTarget>, range: Range, retry: RetryPolicy) -> Self {
        Self { target, range, retry }
    }
}
