use crate::build_info;
use crate::plan::StatusCounts;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::{counter::Counter, gauge::Gauge};
use prometheus_client::registry::Registry;
use tokio::sync::OnceCell;

/// Registers build identity as a labeled gauge fixed at `1`.
pub fn register_build_info_metric(registry: &mut Registry, prefix: &str) {
    let build_info_metric = Family::<BuildInfoLabels, Gauge>::default();
    build_info_metric
        .get_or_create(&BuildInfoLabels {
            service: "index_reconciler",
            version: build_info::VERSION,
            commit: build_info::short_commit_hash(),
        })
        .set(1);
    let sub_registry = registry.sub_registry_with_prefix(prefix);
    sub_registry.register(
        "build_info",
        "Build identity labels for this process",
        build_info_metric,
    );
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct BuildInfoLabels {
    service: &'static str,
    version: &'static str,
    commit: &'static str,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct SegmentStatusLabels {
    pub status: &'static str,
}

#[derive(Clone)]
pub struct SyncMetrics {
    /// Segments per status as of the last repartition.
    pub segments: Family<SegmentStatusLabels, Gauge>,
    pub cycles_total: Counter,
    pub cycle_failures_total: Counter,
    /// Dirty segments whose counts were compared.
    pub segments_checked_total: Counter,
    /// Checks that found the source ahead of the index.
    pub mismatches_total: Counter,
    pub reloads_total: Counter,
    pub records_pushed_total: Counter,
    pub duplicate_records_total: Counter,
    /// Index documents removed for falling out of the retention window.
    pub records_expired_total: Counter,
    pub segments_marked_dirty_total: Counter,
    pub tag_combinations_in_scope: Gauge,
    pub last_cycle_millis: Gauge,
}

impl SyncMetrics {
    fn init() -> Self {
        Self {
            segments: Family::default(),
            cycles_total: Counter::default(),
            cycle_failures_total: Counter::default(),
            segments_checked_total: Counter::default(),
            mismatches_total: Counter::default(),
            reloads_total: Counter::default(),
            records_pushed_total: Counter::default(),
            duplicate_records_total: Counter::default(),
            records_expired_total: Counter::default(),
            segments_marked_dirty_total: Counter::default(),
            tag_combinations_in_scope: Gauge::default(),
            last_cycle_millis: Gauge::default(),
        }
    }

    pub fn register(registry: &mut Registry, prefix: &str) -> Self {
        let metrics = Self::init();
        let sub_registry = registry.sub_registry_with_prefix(prefix);
        sub_registry.register(
            "segments",
            "Plan segments by verification status",
            metrics.segments.clone(),
        );
        sub_registry.register(
            "cycles",
            "Completed reconciliation cycles",
            metrics.cycles_total.clone(),
        );
        sub_registry.register(
            "cycle_failures",
            "Reconciliation cycles aborted by an error",
            metrics.cycle_failures_total.clone(),
        );
        sub_registry.register(
            "segments_checked",
            "Segments whose source and index counts were compared",
            metrics.segments_checked_total.clone(),
        );
        sub_registry.register(
            "mismatches",
            "Segment checks where the index held fewer records than the source",
            metrics.mismatches_total.clone(),
        );
        sub_registry.register(
            "reloads",
            "Segment windows reloaded from the source store",
            metrics.reloads_total.clone(),
        );
        sub_registry.register(
            "records_pushed",
            "Records delivered to the sink",
            metrics.records_pushed_total.clone(),
        );
        sub_registry.register(
            "duplicate_records",
            "Duplicate uids dropped while reloading",
            metrics.duplicate_records_total.clone(),
        );
        sub_registry.register(
            "records_expired",
            "Index documents deleted for falling out of the retention window",
            metrics.records_expired_total.clone(),
        );
        sub_registry.register(
            "segments_marked_dirty",
            "Ok segments scheduled for re-verification",
            metrics.segments_marked_dirty_total.clone(),
        );
        sub_registry.register(
            "tag_combinations_in_scope",
            "Tag combinations selected by the inclusion expression",
            metrics.tag_combinations_in_scope.clone(),
        );
        sub_registry.register(
            "last_cycle_millis",
            "Wall-clock duration of the last reconciliation cycle",
            metrics.last_cycle_millis.clone(),
        );
        metrics
    }

    pub fn record_status_counts(&self, counts: StatusCounts) {
        for (status, count) in [
            ("dirty", counts.dirty),
            ("invalid", counts.invalid),
            ("ok", counts.ok),
        ] {
            self.segments
                .get_or_create(&SegmentStatusLabels { status })
                .set(i64::try_from(count).unwrap_or(i64::MAX));
        }
    }
}

pub static SYNC_METRICS: OnceCell<SyncMetrics> = OnceCell::const_new();
