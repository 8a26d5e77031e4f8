use std::fmt;

use rand::Rng;
use tracing::{debug, warn};

use super::sampler::PrioritySampler;
use super::segment::{PlanError, Segment, SegmentStatus, TimeWindow};

pub const DAY_MS: i64 = 86_400_000;

/// How far back the plan reaches and where the window start is aligned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionWindow {
    pub length_ms: i64,
    /// Window starts are floored to a multiple of this.
    pub granularity_ms: i64,
}

impl RetentionWindow {
    /// `days` of history, starting at a UTC day boundary.
    pub fn days(days: u32) -> Self {
        Self {
            length_ms: i64::from(days) * DAY_MS,
            granularity_ms: DAY_MS,
        }
    }

    pub fn start_for(&self, now_ms: i64) -> i64 {
        let granularity = self.granularity_ms.max(1);
        (now_ms - self.length_ms).div_euclid(granularity) * granularity
    }
}

/// Per-status segment counts, refreshed by `repartition` only.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct StatusCounts {
    pub dirty: usize,
    pub invalid: usize,
    pub ok: usize,
}

impl StatusCounts {
    fn tally(segments: &[Segment]) -> Self {
        segments
            .iter()
            .fold(Self::default(), |mut counts, segment| {
                match segment.status() {
                    SegmentStatus::Dirty => counts.dirty += 1,
                    SegmentStatus::Invalid => counts.invalid += 1,
                    SegmentStatus::Ok => counts.ok += 1,
                }
                counts
            })
    }
}

/// Neighbour indices of one segment as of the last repartition.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SegmentLinks {
    pub previous: Option<usize>,
    pub next: Option<usize>,
}

/// Ordered, contiguous segments covering the retention window.
///
/// Single-writer: callers that share a plan across tasks must serialize access.
#[derive(Debug, Clone)]
pub struct ReconciliationPlan {
    segments: Vec<Segment>,
    links: Vec<SegmentLinks>,
    window: RetentionWindow,
    max_segment_records: u64,
    counts: StatusCounts,
}

impl ReconciliationPlan {
    /// Starts with a single `Dirty` segment spanning the whole window ending at `now_ms`.
    pub fn new(window: RetentionWindow, max_segment_records: u64, now_ms: i64) -> Self {
        let mut plan = Self {
            segments: Vec::new(),
            links: Vec::new(),
            window,
            max_segment_records: max_segment_records.max(1),
            counts: StatusCounts::default(),
        };
        plan.shift_to_now(now_ms);
        plan.counts = StatusCounts::tally(&plan.segments);
        plan
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn segment(&self, index: usize) -> Option<&Segment> {
        self.segments.get(index)
    }

    pub fn segment_mut(&mut self, index: usize) -> Option<&mut Segment> {
        self.segments.get_mut(index)
    }

    pub fn retention(&self) -> RetentionWindow {
        self.window
    }

    pub fn max_segment_records(&self) -> u64 {
        self.max_segment_records
    }

    /// Cached counts; stale between repartitions.
    pub fn status_counts(&self) -> StatusCounts {
        self.counts
    }

    pub fn links(&self, index: usize) -> Option<SegmentLinks> {
        self.links.get(index).copied()
    }

    /// Window actually covered by the sequence, if any.
    pub fn covered_window(&self) -> Option<TimeWindow> {
        let first = self.segments.first()?;
        let last = self.segments.last()?;
        Some(TimeWindow::new(first.from_ms(), last.to_ms()))
    }

    /// Moves the plan onto the retention window ending at `now_ms`.
    ///
    /// Leading segments that fell out of the window are dropped, a straddling first
    /// segment is clipped, and a new `Dirty` segment covers any gap up to `now_ms`.
    /// Returns a detached segment spanning the whole window.
    pub fn shift_to_now(&mut self, now_ms: i64) -> Segment {
        let window_start = self.window.start_for(now_ms);

        let expired = self
            .segments
            .iter()
            .take_while(|segment| segment.to_ms() <= window_start)
            .count();
        if expired > 0 {
            self.segments.drain(..expired);
            self.links.clear();
            debug!(
                event = "plan_segments_expired",
                expired,
                window_start,
                "dropped segments older than the retention window"
            );
        }

        if let Some(first) = self.segments.first_mut() {
            first.clip_by(window_start);
        }

        match self.segments.last().map(Segment::to_ms) {
            Some(last_to) if last_to < now_ms => {
                self.segments.push(Segment::new(last_to, now_ms));
            }
            None if window_start < now_ms => {
                self.segments.push(Segment::new(window_start, now_ms));
            }
            _ => {}
        }

        Segment::new(window_start, now_ms)
    }

    /// Restores the size bounds of the partition.
    ///
    /// Runs of adjacent `Ok` segments are merged while their combined index count stays
    /// below `max_segment_records`; any segment at or above it is split in half regardless
    /// of status. Neighbour links and status counts are rebuilt afterwards. On error the
    /// sequence is left exactly as it was.
    pub fn repartition(&mut self) -> Result<(), PlanError> {
        let max = self.max_segment_records;
        let mut rebuilt: Vec<Segment> = Vec::with_capacity(self.segments.len() + 1);
        let mut cursor = 0;

        while cursor < self.segments.len() {
            let mut current = self.segments[cursor].clone();
            cursor += 1;

            while let Some(next) = self.segments.get(cursor) {
                if !current.could_merge(next, max) {
                    break;
                }
                current.merge(next)?;
                cursor += 1;
            }

            if current.index_count() >= max {
                if current.can_split() {
                    let latter = current.split()?;
                    debug!(
                        event = "plan_segment_split",
                        earlier = %current.window(),
                        later = %latter.window(),
                        "split oversized segment"
                    );
                    rebuilt.push(current);
                    rebuilt.push(latter);
                    continue;
                }
                warn!(
                    event = "plan_segment_unsplittable",
                    window = %current.window(),
                    index_count = current.index_count(),
                    max_segment_records = max,
                    "segment reached the record limit but is too narrow to split"
                );
            }

            rebuilt.push(current);
        }

        self.segments = rebuilt;
        self.rebuild_links();
        self.counts = StatusCounts::tally(&self.segments);
        Ok(())
    }

    fn rebuild_links(&mut self) {
        let len = self.segments.len();
        self.links = (0..len)
            .map(|index| SegmentLinks {
                previous: index.checked_sub(1),
                next: (index + 1 < len).then_some(index + 1),
            })
            .collect();
    }

    /// Resets both neighbours of `index` (per the last repartition) to `Dirty`.
    ///
    /// Called when a segment turns `Invalid`: a boundary mis-count may have made a
    /// neighbour's `Ok` stale. Returns how many neighbours were reset.
    pub fn flood_neighbours(&mut self, index: usize) -> usize {
        let Some(links) = self.links(index) else {
            return 0;
        };

        let mut reset = 0;
        for neighbour in [links.previous, links.next].into_iter().flatten() {
            if let Some(segment) = self.segments.get_mut(neighbour) {
                segment.reset_status();
                reset += 1;
            }
        }
        reset
    }

    /// Schedules up to `count` `Ok` segments for re-verification, newest first.
    ///
    /// Selection is sampled so recent windows, where late data is still arriving, are
    /// re-checked more often than old ones. Returns the number of segments reset.
    pub fn mark_dirty<R: Rng + ?Sized>(&mut self, count: u64, rng: &mut R) -> u64 {
        let mut budget = count;
        let mut sampler = PrioritySampler::new(self.counts.ok as u64, count);

        for segment in self.segments.iter_mut().rev() {
            if budget == 0 {
                break;
            }
            if segment.status() == SegmentStatus::Ok && sampler.pick(rng) {
                segment.reset_status();
                budget -= 1;
            }
        }

        count - budget
    }
}

impl fmt::Display for ReconciliationPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[total: {}, dirty: {}, invalid: {}, ok: {}]",
            self.segments.len(),
            self.counts.dirty,
            self.counts.invalid,
            self.counts.ok
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn unit_window(length: i64) -> RetentionWindow {
        RetentionWindow {
            length_ms: length,
            granularity_ms: length,
        }
    }

    fn assert_partition(plan: &ReconciliationPlan, expected: TimeWindow) {
        let segments = plan.segments();
        assert!(!segments.is_empty());
        for segment in segments {
            assert!(segment.from_ms() < segment.to_ms(), "empty segment {segment}");
        }
        for pair in segments.windows(2) {
            assert_eq!(pair[0].to_ms(), pair[1].from_ms(), "gap or overlap");
        }
        assert_eq!(plan.covered_window(), Some(expected));
    }

    fn windows(plan: &ReconciliationPlan) -> Vec<(i64, i64)> {
        plan.segments()
            .iter()
            .map(|segment| (segment.from_ms(), segment.to_ms()))
            .collect()
    }

    fn check_all(plan: &mut ReconciliationPlan, count: u64) {
        for index in 0..plan.len() {
            plan.segment_mut(index)
                .expect("index in range")
                .set_check_result(count, count);
        }
    }

    #[test]
    fn retention_window_floors_to_granularity() {
        let window = RetentionWindow::days(2);
        let now = 10 * DAY_MS + 1234;
        assert_eq!(window.start_for(now), 8 * DAY_MS);
        assert_eq!(unit_window(5).start_for(6), 0);
        assert_eq!(unit_window(5).start_for(11), 5);
        assert_eq!(unit_window(5).start_for(3), -5);
    }

    #[test]
    fn new_plan_is_single_dirty_segment() {
        let plan = ReconciliationPlan::new(unit_window(5), 100, 5);
        assert_eq!(windows(&plan), vec![(0, 5)]);
        assert_eq!(plan.segments()[0].status(), SegmentStatus::Dirty);
        assert_eq!(plan.status_counts().dirty, 1);
    }

    #[test]
    fn verified_segment_does_not_merge_with_new_dirty_tail() {
        let mut plan = ReconciliationPlan::new(unit_window(5), 100, 5);
        plan.repartition().expect("repartition");
        check_all(&mut plan, 40);

        plan.shift_to_now(6);
        plan.repartition().expect("repartition");

        assert_eq!(windows(&plan), vec![(0, 5), (5, 6)]);
        let first = &plan.segments()[0];
        assert_eq!(first.status(), SegmentStatus::Ok);
        assert_eq!(first.index_count(), 40);
        let second = &plan.segments()[1];
        assert_eq!(second.status(), SegmentStatus::Dirty);
        assert_eq!(second.index_count(), 0);
        assert_eq!(
            plan.status_counts(),
            StatusCounts {
                dirty: 1,
                invalid: 0,
                ok: 1
            }
        );
    }

    #[test]
    fn small_ok_runs_merge_and_oversized_segments_split() {
        let mut plan = ReconciliationPlan::new(unit_window(100), 100, 100);
        for now in [10, 20, 30, 40] {
            plan.shift_to_now(100 + now);
        }
        plan.repartition().expect("repartition");
        assert_eq!(plan.len(), 5);

        for (index, count) in [30, 30, 30, 30, 150].into_iter().enumerate() {
            plan.segment_mut(index)
                .expect("segment")
                .set_check_result(count, count);
        }
        plan.repartition().expect("repartition");

        // 30 + 30 + 30 merges, the fourth would reach 120, the last splits.
        assert_eq!(
            windows(&plan),
            vec![(0, 120), (120, 130), (130, 135), (135, 140)]
        );
        assert_eq!(plan.segments()[0].index_count(), 90);
        assert_eq!(plan.segments()[2].status(), SegmentStatus::Dirty);
        assert_eq!(plan.segments()[3].status(), SegmentStatus::Dirty);
    }

    #[test]
    fn invalid_segment_at_limit_also_splits() {
        let mut plan = ReconciliationPlan::new(unit_window(10), 100, 10);
        plan.segment_mut(0)
            .expect("segment")
            .set_check_result(100, u64::MAX);
        plan.repartition().expect("repartition");
        assert_eq!(windows(&plan), vec![(0, 5), (5, 10)]);
    }

    #[test]
    fn shift_drops_expired_clips_and_extends() {
        let mut plan = ReconciliationPlan::new(unit_window(10), 1_000, 10);
        plan.shift_to_now(14);
        plan.shift_to_now(17);
        plan.repartition().expect("repartition");
        check_all(&mut plan, 1);
        assert_eq!(windows(&plan), vec![(0, 10), (10, 14), (14, 17)]);

        let boundary = plan.shift_to_now(25);
        assert_eq!(boundary.window(), TimeWindow::new(10, 25));
        plan.repartition().expect("repartition");

        // The surviving Ok segments coalesce; the new tail stays separate.
        assert_eq!(windows(&plan), vec![(10, 17), (17, 25)]);
        assert_eq!(plan.segments()[0].status(), SegmentStatus::Ok);
        assert_eq!(plan.segments()[0].index_count(), 2);
        assert_partition(&plan, TimeWindow::new(10, 25));

        plan.shift_to_now(32);
        plan.repartition().expect("repartition");
        assert_eq!(windows(&plan), vec![(20, 25), (25, 32)]);
        assert_eq!(plan.segments()[0].status(), SegmentStatus::Dirty);
        assert_partition(&plan, TimeWindow::new(20, 32));
    }

    #[test]
    fn straddling_first_segment_is_clipped_to_dirty() {
        let window = RetentionWindow {
            length_ms: 10,
            granularity_ms: 1,
        };
        let mut plan = ReconciliationPlan::new(window, 1_000, 10);
        check_all(&mut plan, 5);
        plan.shift_to_now(13);
        plan.repartition().expect("repartition");

        assert_eq!(windows(&plan), vec![(3, 10), (10, 13)]);
        assert_eq!(plan.segments()[0].status(), SegmentStatus::Dirty);
        assert_eq!(plan.segments()[0].index_count(), 0);
    }

    #[test]
    fn long_pause_rebuilds_whole_window() {
        let mut plan = ReconciliationPlan::new(unit_window(10), 1_000, 10);
        plan.shift_to_now(500);
        plan.repartition().expect("repartition");
        assert_partition(&plan, TimeWindow::new(490, 500));
        assert_eq!(plan.len(), 1);
    }

    #[test]
    fn flooding_resets_both_neighbours() {
        let mut plan = ReconciliationPlan::new(unit_window(10), 1_000, 10);
        plan.shift_to_now(12);
        plan.shift_to_now(14);
        plan.repartition().expect("repartition");
        for index in 0..plan.len() {
            plan.segment_mut(index)
                .expect("segment")
                .set_check_result(10, 10);
        }
        plan.segment_mut(1).expect("segment").set_check_result(1, 2);

        assert_eq!(plan.flood_neighbours(1), 2);
        let statuses: Vec<_> = plan.segments().iter().map(Segment::status).collect();
        assert_eq!(
            statuses,
            vec![
                SegmentStatus::Dirty,
                SegmentStatus::Invalid,
                SegmentStatus::Dirty
            ]
        );

        assert_eq!(plan.flood_neighbours(0), 1);
        assert_eq!(plan.flood_neighbours(99), 0);
    }

    #[test]
    fn links_are_cleared_when_leading_segments_expire() {
        let mut plan = ReconciliationPlan::new(unit_window(10), 1_000, 10);
        plan.shift_to_now(14);
        plan.repartition().expect("repartition");
        assert_eq!(
            plan.links(1),
            Some(SegmentLinks {
                previous: Some(0),
                next: None
            })
        );

        plan.shift_to_now(25);
        assert_eq!(plan.links(0), None);
        plan.repartition().expect("repartition");
        assert!(plan.links(0).is_some());
    }

    #[test]
    fn mark_dirty_respects_budget_and_prefers_recent_segments() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut newest_hits = 0;
        let mut oldest_hits = 0;

        for _ in 0..200 {
            // Limit of 20 keeps the 10-record segments from merging.
            let mut plan = ReconciliationPlan::new(unit_window(100), 20, 100);
            for step in 1..=99 {
                plan.shift_to_now(100 + step);
            }
            plan.repartition().expect("repartition");
            check_all(&mut plan, 10);
            plan.repartition().expect("repartition");
            assert_eq!(plan.status_counts().ok, 100);

            let marked = plan.mark_dirty(5, &mut rng);
            assert_eq!(marked, 5);
            let dirty: Vec<usize> = plan
                .segments()
                .iter()
                .enumerate()
                .filter(|(_, segment)| segment.status() == SegmentStatus::Dirty)
                .map(|(index, _)| index)
                .collect();
            assert_eq!(dirty.len(), 5);
            assert!(dirty.contains(&99), "newest segment is always picked first");
            newest_hits += dirty.iter().filter(|index| **index >= 75).count();
            oldest_hits += dirty.iter().filter(|index| **index < 25).count();
        }

        assert!(newest_hits > oldest_hits);
    }

    #[test]
    fn mark_dirty_with_zero_budget_changes_nothing() {
        let mut rng = StdRng::seed_from_u64(3);
        let mut plan = ReconciliationPlan::new(unit_window(10), 1_000, 10);
        check_all(&mut plan, 2);
        plan.repartition().expect("repartition");

        assert_eq!(plan.mark_dirty(0, &mut rng), 0);
        assert_eq!(plan.segments()[0].status(), SegmentStatus::Ok);
    }

    #[test]
    fn mark_dirty_selects_all_when_budget_covers_every_ok_segment() {
        let mut rng = StdRng::seed_from_u64(11);
        let mut plan = ReconciliationPlan::new(unit_window(10), 1_000, 10);
        plan.shift_to_now(12);
        plan.repartition().expect("repartition");
        plan.segment_mut(0).expect("segment").set_check_result(1, 1);
        plan.repartition().expect("repartition");

        assert_eq!(plan.mark_dirty(10, &mut rng), 1);
        assert!(plan
            .segments()
            .iter()
            .all(|segment| segment.status() == SegmentStatus::Dirty));
    }

    #[test]
    fn repartition_preserves_partition_under_random_churn() {
        let mut rng = StdRng::seed_from_u64(0xfeed);
        let window = RetentionWindow {
            length_ms: 1_000,
            granularity_ms: 10,
        };
        let mut now = 1_000;
        let mut plan = ReconciliationPlan::new(window, 50, now);

        for _ in 0..300 {
            now += rng.gen_range(0..40);
            plan.shift_to_now(now);
            let before = plan.covered_window().expect("covered");
            plan.repartition().expect("repartition");
            assert_partition(&plan, before);
            assert_eq!(before, TimeWindow::new(window.start_for(now), now));

            for index in 0..plan.len() {
                let roll = rng.gen_range(0..10);
                let segment = plan.segment_mut(index).expect("segment");
                match roll {
                    0..=5 => {
                        let count = rng.gen_range(0..40);
                        segment.set_check_result(count, count);
                    }
                    6 => segment.set_check_result(rng.gen_range(40..80), u64::MAX),
                    7 => segment.reset_status(),
                    _ => {}
                }
            }
            plan.mark_dirty(rng.gen_range(0..4), &mut rng);
        }
    }

    #[test]
    fn display_reports_cached_counts() {
        let plan = ReconciliationPlan::new(unit_window(5), 100, 5);
        assert_eq!(plan.to_string(), "[total: 1, dirty: 1, invalid: 0, ok: 0]");
    }
}
