use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use rand::rngs::StdRng;
use rand::SeedableRng;

use super::{Clock, SyncService, SyncSettings};
use crate::plan::{RetentionWindow, TimeWindow};
use crate::stores::{
    Connections, Connector, RecordSink, SearchIndex, SourceRecord, SourceStore, StoreError,
};
use crate::tag_filter::{tag_set, TagInclusionFilter, TagSet};

pub(super) fn unavailable(resource: &str) -> StoreError {
    StoreError::UnexpectedStatus {
        resource: resource.to_string(),
        status: 503,
    }
}

pub(super) fn record(uid: &str, created_ms: i64, tags: &[&str]) -> SourceRecord {
    SourceRecord {
        uid: uid.to_string(),
        created_ms,
        tags: tag_set(tags),
        data: Some(format!("payload-{uid}")),
        embed: None,
    }
}

/// Retention of 100ms aligned to 100ms; at `now = 1000` the plan covers `[900, 1000)`.
pub(super) fn test_settings(max_segment_records: u64) -> SyncSettings {
    SyncSettings {
        retention: RetentionWindow {
            length_ms: 100,
            granularity_ms: 100,
        },
        max_segment_records,
        sync_period: Duration::from_millis(20),
        tag_refresh: Duration::from_secs(60),
        error_backoff: Duration::from_millis(5),
    }
}

pub(super) type TestService = SyncService<Arc<MockConnector>, Arc<ManualClock>>;

pub(super) fn test_service(
    connector: &Arc<MockConnector>,
    clock: &Arc<ManualClock>,
    expression: &str,
    max_segment_records: u64,
) -> TestService {
    SyncService::with_parts(
        connector.clone(),
        clock.clone(),
        test_settings(max_segment_records),
        TagInclusionFilter::new(expression).expect("valid expression"),
        StdRng::seed_from_u64(7),
    )
}

pub(super) struct ManualClock {
    now_ms: Mutex<i64>,
    started: Instant,
}

impl ManualClock {
    pub(super) fn at(now_ms: i64) -> Arc<Self> {
        Arc::new(Self {
            now_ms: Mutex::new(now_ms),
            started: Instant::now(),
        })
    }

    pub(super) fn set_ms(&self, now_ms: i64) {
        *self.now_ms.lock().expect("clock mutex poisoned") = now_ms;
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> i64 {
        *self.now_ms.lock().expect("clock mutex poisoned")
    }

    /// Frozen, so cycles never run out of budget.
    fn instant(&self) -> Instant {
        self.started
    }
}

#[derive(Default)]
pub(super) struct MemorySource {
    records: Mutex<Vec<SourceRecord>>,
    count_calls: Mutex<u32>,
    load_calls: Mutex<Vec<TimeWindow>>,
    fail_next_load: Mutex<bool>,
}

impl MemorySource {
    pub(super) fn with_records(records: Vec<SourceRecord>) -> Arc<Self> {
        Arc::new(Self {
            records: Mutex::new(records),
            ..Self::default()
        })
    }

    pub(super) fn append(&self, record: SourceRecord) {
        self.records
            .lock()
            .expect("records mutex poisoned")
            .push(record);
    }

    /// Makes the next `load` fail once.
    pub(super) fn fail_next_load(&self) {
        *self.fail_next_load.lock().expect("failure mutex poisoned") = true;
    }

    pub(super) fn count_calls(&self) -> u32 {
        *self.count_calls.lock().expect("count mutex poisoned")
    }

    pub(super) fn load_calls(&self) -> Vec<TimeWindow> {
        self.load_calls.lock().expect("load mutex poisoned").clone()
    }

    fn matching(&self, window: TimeWindow, scope: &[TagSet]) -> Vec<SourceRecord> {
        self.records
            .lock()
            .expect("records mutex poisoned")
            .iter()
            .filter(|record| {
                record.created_ms >= window.from_ms && record.created_ms < window.to_ms
            })
            .filter(|record| scope.contains(&record.tags))
            .cloned()
            .collect()
    }
}

impl SourceStore for MemorySource {
    fn count<'a>(
        &'a self,
        window: TimeWindow,
        scope: &'a [TagSet],
    ) -> BoxFuture<'a, Result<u64, StoreError>> {
        Box::pin(async move {
            *self.count_calls.lock().expect("count mutex poisoned") += 1;
            let distinct: HashSet<String> = self
                .matching(window, scope)
                .into_iter()
                .map(|record| record.uid)
                .collect();
            Ok(distinct.len() as u64)
        })
    }

    fn load<'a>(
        &'a self,
        window: TimeWindow,
        scope: &'a [TagSet],
    ) -> BoxFuture<'a, Result<Vec<SourceRecord>, StoreError>> {
        Box::pin(async move {
            self.load_calls
                .lock()
                .expect("load mutex poisoned")
                .push(window);
            let mut fail_next_load = self.fail_next_load.lock().expect("failure mutex poisoned");
            if std::mem::take(&mut *fail_next_load) {
                return Err(unavailable("memory source"));
            }
            Ok(self.matching(window, scope))
        })
    }

    fn list_tag_combinations(&self) -> BoxFuture<'_, Result<Vec<TagSet>, StoreError>> {
        Box::pin(async move {
            let distinct: std::collections::BTreeSet<TagSet> = self
                .records
                .lock()
                .expect("records mutex poisoned")
                .iter()
                .map(|record| record.tags.clone())
                .collect();
            Ok(distinct.into_iter().collect())
        })
    }
}

/// Index keyed by uid, doubling as the sink so reloads land where counts are taken.
#[derive(Default)]
pub(super) struct MemoryIndex {
    documents: Mutex<BTreeMap<String, i64>>,
}

impl MemoryIndex {
    pub(super) fn with_documents(documents: &[(&str, i64)]) -> Arc<Self> {
        Arc::new(Self {
            documents: Mutex::new(
                documents
                    .iter()
                    .map(|(uid, created_ms)| (uid.to_string(), *created_ms))
                    .collect(),
            ),
        })
    }

    pub(super) fn uids(&self) -> Vec<String> {
        self.documents
            .lock()
            .expect("documents mutex poisoned")
            .keys()
            .cloned()
            .collect()
    }
}

impl SearchIndex for MemoryIndex {
    fn count(&self, window: TimeWindow) -> BoxFuture<'_, Result<u64, StoreError>> {
        Box::pin(async move {
            let documents = self.documents.lock().expect("documents mutex poisoned");
            Ok(documents
                .values()
                .filter(|created_ms| **created_ms >= window.from_ms && **created_ms < window.to_ms)
                .count() as u64)
        })
    }

    fn delete_older_than(&self, cutoff_ms: i64) -> BoxFuture<'_, Result<u64, StoreError>> {
        Box::pin(async move {
            let mut documents = self.documents.lock().expect("documents mutex poisoned");
            let before = documents.len();
            documents.retain(|_, created_ms| *created_ms >= cutoff_ms);
            Ok((before - documents.len()) as u64)
        })
    }
}

impl RecordSink for MemoryIndex {
    fn push<'a>(&'a self, records: &'a [SourceRecord]) -> BoxFuture<'a, Result<usize, StoreError>> {
        Box::pin(async move {
            let mut documents = self.documents.lock().expect("documents mutex poisoned");
            for record in records {
                documents.insert(record.uid.clone(), record.created_ms);
            }
            Ok(records.len())
        })
    }
}

pub(super) struct MockConnector {
    source: Arc<MemorySource>,
    index: Arc<MemoryIndex>,
    failures_left: Mutex<u32>,
    connect_calls: Mutex<u32>,
}

impl MockConnector {
    pub(super) fn new(source: Arc<MemorySource>, index: Arc<MemoryIndex>) -> Arc<Self> {
        Self::failing(source, index, 0)
    }

    /// Fails the first `failures` connection attempts.
    pub(super) fn failing(
        source: Arc<MemorySource>,
        index: Arc<MemoryIndex>,
        failures: u32,
    ) -> Arc<Self> {
        Arc::new(Self {
            source,
            index,
            failures_left: Mutex::new(failures),
            connect_calls: Mutex::new(0),
        })
    }

    pub(super) fn connect_calls(&self) -> u32 {
        *self.connect_calls.lock().expect("connect mutex poisoned")
    }
}

impl Connector for MockConnector {
    fn connect(&self) -> BoxFuture<'_, Result<Connections, StoreError>> {
        Box::pin(async move {
            *self.connect_calls.lock().expect("connect mutex poisoned") += 1;
            {
                let mut failures_left = self.failures_left.lock().expect("failure mutex poisoned");
                if *failures_left > 0 {
                    *failures_left -= 1;
                    return Err(unavailable("memory connector"));
                }
            }

            Ok(Connections {
                source: self.source.clone(),
                index: self.index.clone(),
                sink: self.index.clone(),
            })
        })
    }
}
