use std::fmt;

use chrono::{DateTime, SecondsFormat, Utc};
use thiserror::Error;

/// Why a merge was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeRejection {
    NonAdjacent,
    NotOk,
}

impl fmt::Display for MergeRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MergeRejection::NonAdjacent => f.write_str("segments are not adjacent"),
            MergeRejection::NotOk => f.write_str("both segments must be Ok"),
        }
    }
}

/// Partition invariant violations. These are programming errors, not runtime conditions:
/// seeing one means the segment sequence was already broken before the call.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PlanError {
    #[error("illegal merge of {left} into {right}: {reason}")]
    IllegalMerge {
        left: TimeWindow,
        right: TimeWindow,
        reason: MergeRejection,
    },
    #[error("segment {0} is too narrow to split")]
    Unsplittable(TimeWindow),
}

/// Verification state of a segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SegmentStatus {
    /// Unknown, needs (re)verification.
    Dirty,
    /// Verified mismatch, needs reload and forces a neighbour re-check.
    Invalid,
    /// Verified match.
    Ok,
}

impl SegmentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SegmentStatus::Dirty => "dirty",
            SegmentStatus::Invalid => "invalid",
            SegmentStatus::Ok => "ok",
        }
    }
}

/// Half-open `[from_ms, to_ms)` interval in epoch milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimeWindow {
    pub from_ms: i64,
    pub to_ms: i64,
}

impl TimeWindow {
    pub fn new(from_ms: i64, to_ms: i64) -> Self {
        Self { from_ms, to_ms }
    }

    pub fn span_ms(&self) -> i64 {
        self.to_ms - self.from_ms
    }
}

impl fmt::Display for TimeWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{} .. {})",
            format_epoch_millis(self.from_ms),
            format_epoch_millis(self.to_ms)
        )
    }
}

/// Renders epoch milliseconds as RFC 3339, falling back to the raw number when out of range.
pub fn format_epoch_millis(epoch_ms: i64) -> String {
    DateTime::<Utc>::from_timestamp_millis(epoch_ms)
        .map(|ts| ts.to_rfc3339_opts(SecondsFormat::Millis, true))
        .unwrap_or_else(|| epoch_ms.to_string())
}

/// One time window of the reconciliation plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    from_ms: i64,
    to_ms: i64,
    status: SegmentStatus,
    index_count: u64,
    source_count: u64,
}

impl Segment {
    /// Creates a `Dirty` segment with zero counts.
    pub fn new(from_ms: i64, to_ms: i64) -> Self {
        Self {
            from_ms,
            to_ms,
            status: SegmentStatus::Dirty,
            index_count: 0,
            source_count: 0,
        }
    }

    pub fn from_ms(&self) -> i64 {
        self.from_ms
    }

    pub fn to_ms(&self) -> i64 {
        self.to_ms
    }

    pub fn window(&self) -> TimeWindow {
        TimeWindow::new(self.from_ms, self.to_ms)
    }

    pub fn status(&self) -> SegmentStatus {
        self.status
    }

    pub fn index_count(&self) -> u64 {
        self.index_count
    }

    pub fn source_count(&self) -> u64 {
        self.source_count
    }

    /// Records both observed counts. The index may hold more records than the source
    /// reports for the window, never fewer.
    pub fn set_check_result(&mut self, index_count: u64, source_count: u64) {
        self.index_count = index_count;
        self.source_count = source_count;
        self.status = if source_count <= index_count {
            SegmentStatus::Ok
        } else {
            SegmentStatus::Invalid
        };
    }

    /// Forgets everything known about the window.
    pub fn reset_status(&mut self) {
        self.status = SegmentStatus::Dirty;
        self.index_count = 0;
        self.source_count = 0;
    }

    /// Absorbs a time-adjacent `Ok` neighbour on either side, summing both counts.
    pub fn merge(&mut self, other: &Segment) -> Result<(), PlanError> {
        if self.status != SegmentStatus::Ok || other.status != SegmentStatus::Ok {
            return Err(self.merge_error(other, MergeRejection::NotOk));
        }

        if self.to_ms == other.from_ms {
            self.to_ms = other.to_ms;
        } else if self.from_ms == other.to_ms {
            self.from_ms = other.from_ms;
        } else {
            return Err(self.merge_error(other, MergeRejection::NonAdjacent));
        }

        self.index_count = self.index_count.saturating_add(other.index_count);
        self.source_count = self.source_count.saturating_add(other.source_count);
        Ok(())
    }

    fn merge_error(&self, other: &Segment, reason: MergeRejection) -> PlanError {
        PlanError::IllegalMerge {
            left: self.window(),
            right: other.window(),
            reason,
        }
    }

    /// Whether the interval is wide enough to yield two non-empty halves.
    pub fn can_split(&self) -> bool {
        self.to_ms - self.from_ms >= 2
    }

    /// Splits at the temporal midpoint. `self` keeps the earlier half and the later half is
    /// returned; both start over as `Dirty` since the old counts described the whole window.
    pub fn split(&mut self) -> Result<Segment, PlanError> {
        if !self.can_split() {
            return Err(PlanError::Unsplittable(self.window()));
        }

        let midpoint = self.from_ms + (self.to_ms - self.from_ms) / 2;
        let latter = Segment::new(midpoint, self.to_ms);
        self.to_ms = midpoint;
        self.reset_status();
        Ok(latter)
    }

    /// Trims the start forward to `new_from` when it falls strictly inside the window.
    ///
    /// Segments lying entirely before `new_from` are left alone; the plan removes those.
    pub fn clip_by(&mut self, new_from: i64) {
        if self.from_ms < new_from && new_from < self.to_ms {
            self.from_ms = new_from;
            self.reset_status();
        }
    }

    /// True when `next` directly follows this segment, both are `Ok`, and the merged index
    /// count stays below `max_segment_records`.
    pub fn could_merge(&self, next: &Segment, max_segment_records: u64) -> bool {
        self.to_ms == next.from_ms
            && self.status == SegmentStatus::Ok
            && next.status == SegmentStatus::Ok
            && self.index_count.saturating_add(next.index_count) < max_segment_records
    }
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[status: {}, {}, index count: {}, source count: {}]",
            self.status.as_str(),
            self.window(),
            self.index_count,
            self.source_count
        )
    }
}
