mod clock;
mod error;
#[cfg(test)]
mod test_support;

use std::collections::HashSet;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub use clock::{Clock, SystemClock};
pub use error::SyncError;

use crate::config::Config;
use crate::logging::format_error_report;
use crate::plan::{
    plan_next_cycle, PacingDecision, PacingInputs, ReconciliationPlan, RetentionWindow,
    SegmentStatus, TimeWindow,
};
use crate::server::monitoring::SYNC_METRICS;
use crate::stores::{Connections, Connector, SourceRecord};
use crate::tag_filter::{TagInclusionFilter, TagScope};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncSettings {
    pub retention: RetentionWindow,
    pub max_segment_records: u64,
    /// Per-cycle budget; the loop sleeps out whatever a cycle leaves unused.
    pub sync_period: Duration,
    pub tag_refresh: Duration,
    pub error_backoff: Duration,
}

impl SyncSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            retention: config.retention(),
            max_segment_records: config.max_segment_records,
            sync_period: config.sync_period,
            tag_refresh: config.tag_refresh,
            error_backoff: config.error_backoff,
        }
    }
}

/// What one cycle did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CycleReport {
    pub segments_processed: u64,
    pub checked: u64,
    pub mismatches: u64,
    pub reloads: u64,
    pub records_pushed: u64,
    pub duplicates: u64,
    pub expired: u64,
    /// The segment walk stopped early on budget or cancellation.
    pub interrupted: bool,
    pub elapsed: Duration,
    pub pacing: PacingDecision,
}

impl Default for CycleReport {
    fn default() -> Self {
        Self {
            segments_processed: 0,
            checked: 0,
            mismatches: 0,
            reloads: 0,
            records_pushed: 0,
            duplicates: 0,
            expired: 0,
            interrupted: false,
            elapsed: Duration::ZERO,
            pacing: PacingDecision {
                mark_dirty: 0,
                sleep_for: Duration::ZERO,
            },
        }
    }
}

/// Keeps one plan in step with the stores.
///
/// Owns the plan exclusively. Connections are built lazily and dropped after any failed
/// cycle; the plan itself survives failures and is never persisted.
pub struct SyncService<C, K = SystemClock> {
    connector: C,
    clock: K,
    settings: SyncSettings,
    plan: ReconciliationPlan,
    scope: TagScope,
    connections: Option<Connections>,
    rng: StdRng,
}

impl<C: Connector> SyncService<C, SystemClock> {
    pub fn new(connector: C, settings: SyncSettings, filter: TagInclusionFilter) -> Self {
        Self::with_parts(connector, SystemClock, settings, filter, StdRng::from_entropy())
    }
}

impl<C, K> SyncService<C, K>
where
    C: Connector,
    K: Clock,
{
    pub fn with_parts(
        connector: C,
        clock: K,
        settings: SyncSettings,
        filter: TagInclusionFilter,
        rng: StdRng,
    ) -> Self {
        let plan = ReconciliationPlan::new(
            settings.retention,
            settings.max_segment_records,
            clock.now_ms(),
        );
        Self {
            connector,
            clock,
            settings,
            plan,
            scope: TagScope::new(filter),
            connections: None,
            rng,
        }
    }

    pub fn plan(&self) -> &ReconciliationPlan {
        &self.plan
    }

    pub fn scope(&self) -> &TagScope {
        &self.scope
    }

    pub fn is_connected(&self) -> bool {
        self.connections.is_some()
    }

    /// Runs cycles until `cancel` fires, sleeping out each period and backing off after
    /// failures.
    pub async fn run(&mut self, cancel: CancellationToken) {
        info!(
            event = "sync_loop_started",
            sync_period_ms = self.settings.sync_period.as_millis() as u64,
            max_segment_records = self.settings.max_segment_records,
            "starting reconciliation loop"
        );

        while !cancel.is_cancelled() {
            match self.run_once(&cancel).await {
                Ok(report) => {
                    if !sleep_unless_cancelled(report.pacing.sleep_for, &cancel).await {
                        break;
                    }
                    self.schedule_rechecks(report.pacing.mark_dirty);
                }
                Err(err) => {
                    error!(
                        event = "sync_cycle_failed",
                        error = %err,
                        report = %format_error_report(&err),
                        backoff_ms = self.settings.error_backoff.as_millis() as u64,
                        "reconciliation cycle failed; reconnecting after backoff"
                    );
                    if !sleep_unless_cancelled(self.settings.error_backoff, &cancel).await {
                        break;
                    }
                }
            }
        }

        info!(event = "sync_loop_stopped", plan = %self.plan, "reconciliation loop stopped");
    }

    /// Executes exactly one cycle. On failure the connections are dropped so the next
    /// cycle reconnects; the plan is kept.
    pub async fn run_once(
        &mut self,
        cancel: &CancellationToken,
    ) -> Result<CycleReport, SyncError> {
        let result = self.cycle(cancel).await;

        match &result {
            Ok(report) => record_cycle_metrics(&self.plan, report),
            Err(_) => {
                self.connections = None;
                if let Some(metrics) = SYNC_METRICS.get() {
                    metrics.cycle_failures_total.inc();
                }
            }
        }

        result
    }

    /// Resets up to `count` Ok segments to Dirty, favouring recent windows.
    pub fn schedule_rechecks(&mut self, count: u64) -> u64 {
        let marked = self.plan.mark_dirty(count, &mut self.rng);
        if marked > 0 {
            debug!(
                event = "segments_marked_dirty",
                requested = count,
                marked,
                "scheduled re-checks"
            );
        }
        if let Some(metrics) = SYNC_METRICS.get() {
            metrics.segments_marked_dirty_total.inc_by(marked);
        }
        marked
    }

    async fn ensure_connections(&mut self) -> Result<Connections, SyncError> {
        if let Some(connections) = &self.connections {
            return Ok(connections.clone());
        }

        let connections = self.connector.connect().await?;
        info!(event = "stores_connected", "connected to source store and index");
        self.connections = Some(connections.clone());
        Ok(connections)
    }

    async fn refresh_scope(&mut self, connections: &Connections) -> Result<(), SyncError> {
        let now = self.clock.instant();
        if !self.scope.needs_refresh(now, self.settings.tag_refresh) {
            return Ok(());
        }

        let catalogue = connections.source.list_tag_combinations().await?;
        let included = self.scope.refresh(catalogue, now)?;
        if let Some(metrics) = SYNC_METRICS.get() {
            metrics
                .tag_combinations_in_scope
                .set(i64::try_from(included).unwrap_or(i64::MAX));
        }
        Ok(())
    }

    async fn cycle(&mut self, cancel: &CancellationToken) -> Result<CycleReport, SyncError> {
        let started = self.clock.instant();
        let connections = self.ensure_connections().await?;
        self.refresh_scope(&connections).await?;

        let whole_window = self.plan.shift_to_now(self.clock.now_ms());
        self.plan.repartition()?;

        let mut report = CycleReport {
            expired: connections
                .index
                .delete_older_than(whole_window.from_ms())
                .await?,
            ..CycleReport::default()
        };
        if report.expired > 0 {
            info!(
                event = "index_records_expired",
                deleted = report.expired,
                cutoff = %crate::plan::format_epoch_millis(whole_window.from_ms()),
                "deleted index records older than the retention window"
            );
        }

        let max = self.settings.max_segment_records;
        for position in 0..self.plan.len() {
            if cancel.is_cancelled() || self.elapsed_since(started) > self.settings.sync_period {
                report.interrupted = true;
                break;
            }

            let Some(segment) = self.plan.segment(position) else {
                break;
            };
            let window = segment.window();

            let status = segment.status();
            if status == SegmentStatus::Ok {
                continue;
            }

            if status == SegmentStatus::Invalid {
                self.reload(&connections, window, &mut report).await?;
                self.reset_segment(position);
                report.segments_processed += 1;
            }

            // A reloaded segment is Dirty again and gets verified in the same pass.
            let index_count = connections.index.count(window).await?;
            report.checked += 1;

            if index_count >= max {
                // Leaves the segment Invalid so the next repartition splits it.
                self.record_check(position, index_count, u64::MAX);
                debug!(
                    event = "segment_over_limit",
                    window = %window,
                    index_count,
                    max_segment_records = max,
                    "segment holds too many records to verify"
                );
            } else {
                let source_count = connections
                    .source
                    .count(window, self.scope.combinations())
                    .await?;
                let status = self.record_check(position, index_count, source_count);

                if status == SegmentStatus::Invalid {
                    warn!(
                        event = "segment_mismatch",
                        window = %window,
                        index_count,
                        source_count,
                        "index is missing records for segment"
                    );
                    report.mismatches += 1;
                    // Flood first: the reload below may fail.
                    self.plan.flood_neighbours(position);
                    self.reload(&connections, window, &mut report).await?;
                    self.reset_segment(position);
                }
            }
            report.segments_processed += 1;
        }

        self.plan.shift_to_now(self.clock.now_ms());
        self.plan.repartition()?;

        report.elapsed = self.elapsed_since(started);
        report.pacing = plan_next_cycle(PacingInputs {
            elapsed: report.elapsed,
            segments_processed: report.segments_processed,
            sync_period: self.settings.sync_period,
        });

        info!(
            event = "sync_cycle_completed",
            plan = %self.plan,
            processed = report.segments_processed,
            checked = report.checked,
            mismatches = report.mismatches,
            reloads = report.reloads,
            records_pushed = report.records_pushed,
            interrupted = report.interrupted,
            elapsed_ms = report.elapsed.as_millis() as u64,
            mark_dirty = report.pacing.mark_dirty,
            "reconciliation cycle completed"
        );

        Ok(report)
    }

    async fn reload(
        &self,
        connections: &Connections,
        window: TimeWindow,
        report: &mut CycleReport,
    ) -> Result<(), SyncError> {
        let loaded = connections
            .source
            .load(window, self.scope.combinations())
            .await?;
        let (records, duplicates) = dedup_by_uid(loaded);
        if duplicates > 0 {
            warn!(
                event = "duplicate_records_dropped",
                duplicates,
                window = %window,
                "source returned duplicate uids"
            );
            report.duplicates += duplicates as u64;
        }

        let pushed = connections.sink.push(&records).await?;
        info!(
            event = "segment_reloaded",
            window = %window,
            records = pushed,
            "reloaded segment into sink"
        );
        report.reloads += 1;
        report.records_pushed += pushed as u64;
        Ok(())
    }

    fn record_check(
        &mut self,
        position: usize,
        index_count: u64,
        source_count: u64,
    ) -> SegmentStatus {
        match self.plan.segment_mut(position) {
            Some(segment) => {
                segment.set_check_result(index_count, source_count);
                segment.status()
            }
            None => SegmentStatus::Dirty,
        }
    }

    fn reset_segment(&mut self, position: usize) {
        if let Some(segment) = self.plan.segment_mut(position) {
            segment.reset_status();
        }
    }

    fn elapsed_since(&self, started: std::time::Instant) -> Duration {
        self.clock.instant().saturating_duration_since(started)
    }
}

/// Keeps the first record per uid; returns the survivors and how many were dropped.
fn dedup_by_uid(records: Vec<SourceRecord>) -> (Vec<SourceRecord>, usize) {
    let total = records.len();
    let mut seen = HashSet::with_capacity(total);
    let unique: Vec<SourceRecord> = records
        .into_iter()
        .filter(|record| seen.insert(record.uid.clone()))
        .collect();
    let dropped = total - unique.len();
    (unique, dropped)
}

/// Returns false if cancelled before `duration` elapsed.
async fn sleep_unless_cancelled(duration: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}

fn record_cycle_metrics(plan: &ReconciliationPlan, report: &CycleReport) {
    let Some(metrics) = SYNC_METRICS.get() else {
        return;
    };
    metrics.cycles_total.inc();
    metrics.segments_checked_total.inc_by(report.checked);
    metrics.mismatches_total.inc_by(report.mismatches);
    metrics.reloads_total.inc_by(report.reloads);
    metrics.records_pushed_total.inc_by(report.records_pushed);
    metrics.duplicate_records_total.inc_by(report.duplicates);
    metrics.records_expired_total.inc_by(report.expired);
    metrics
        .last_cycle_millis
        .set(i64::try_from(report.elapsed.as_millis()).unwrap_or(i64::MAX));
    metrics.record_status_counts(plan.status_counts());
}
