//! Collaborators the sync loop talks to: the append-only source store, the search index,
//! and the sink that receives reloaded records.

pub mod elastic;
pub mod postgres;
pub mod sink;

use std::sync::Arc;

use diesel_async::pooled_connection::deadpool::{BuildError, PoolError};
use futures::future::BoxFuture;
use serde::{Serialize, Serializer};
use thiserror::Error;

use crate::config::{Config, SinkKind};
use crate::plan::{format_epoch_millis, TimeWindow};
use crate::tag_filter::TagSet;

pub use elastic::{ElasticIndex, ElasticSettings};
pub use postgres::{canonical_tag_key, PgSourceStore};
pub use sink::NdjsonSink;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Diesel(#[from] diesel::result::Error),

    #[error(transparent)]
    DbPool(#[from] PoolError),

    #[error("failed to build database pool: {0}")]
    DbPoolBuild(#[from] BuildError),

    #[error("invalid source table name '{0}'")]
    InvalidTable(String),

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error("unexpected HTTP status from {resource}: {status}")]
    UnexpectedStatus { resource: String, status: u16 },

    #[error("bulk write to {resource} rejected {failed} of {total} records")]
    BulkRejected {
        resource: String,
        failed: usize,
        total: usize,
    },

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// One row of the source store as shipped to the index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceRecord {
    pub uid: String,
    #[serde(rename = "@timestamp", serialize_with = "serialize_epoch_millis")]
    pub created_ms: i64,
    pub tags: TagSet,
    pub data: Option<String>,
    pub embed: Option<String>,
}

fn serialize_epoch_millis<S: Serializer>(epoch_ms: &i64, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&format_epoch_millis(*epoch_ms))
}

/// Append-only store that holds the records of truth.
pub trait SourceStore: Send + Sync {
    /// Distinct records created in `window` whose tag set is one of `scope`.
    fn count<'a>(
        &'a self,
        window: TimeWindow,
        scope: &'a [TagSet],
    ) -> BoxFuture<'a, Result<u64, StoreError>>;

    fn load<'a>(
        &'a self,
        window: TimeWindow,
        scope: &'a [TagSet],
    ) -> BoxFuture<'a, Result<Vec<SourceRecord>, StoreError>>;

    /// Every distinct tag set present in the store.
    fn list_tag_combinations(&self) -> BoxFuture<'_, Result<Vec<TagSet>, StoreError>>;
}

impl<T> SourceStore for Arc<T>
where
    T: SourceStore + ?Sized,
{
    fn count<'a>(
        &'a self,
        window: TimeWindow,
        scope: &'a [TagSet],
    ) -> BoxFuture<'a, Result<u64, StoreError>> {
        (**self).count(window, scope)
    }

    fn load<'a>(
        &'a self,
        window: TimeWindow,
        scope: &'a [TagSet],
    ) -> BoxFuture<'a, Result<Vec<SourceRecord>, StoreError>> {
        (**self).load(window, scope)
    }

    fn list_tag_combinations(&self) -> BoxFuture<'_, Result<Vec<TagSet>, StoreError>> {
        (**self).list_tag_combinations()
    }
}

/// Search index being kept consistent with the source store.
pub trait SearchIndex: Send + Sync {
    fn count(&self, window: TimeWindow) -> BoxFuture<'_, Result<u64, StoreError>>;

    /// Removes documents stamped before `cutoff_ms` and returns how many went.
    fn delete_older_than(&self, cutoff_ms: i64) -> BoxFuture<'_, Result<u64, StoreError>>;
}

impl<T> SearchIndex for Arc<T>
where
    T: SearchIndex + ?Sized,
{
    fn count(&self, window: TimeWindow) -> BoxFuture<'_, Result<u64, StoreError>> {
        (**self).count(window)
    }

    fn delete_older_than(&self, cutoff_ms: i64) -> BoxFuture<'_, Result<u64, StoreError>> {
        (**self).delete_older_than(cutoff_ms)
    }
}

/// Downstream consumer of reloaded records.
pub trait RecordSink: Send + Sync {
    fn push<'a>(&'a self, records: &'a [SourceRecord]) -> BoxFuture<'a, Result<usize, StoreError>>;
}

impl<T> RecordSink for Arc<T>
where
    T: RecordSink + ?Sized,
{
    fn push<'a>(&'a self, records: &'a [SourceRecord]) -> BoxFuture<'a, Result<usize, StoreError>> {
        (**self).push(records)
    }
}

/// A live set of collaborators. Dropped and rebuilt after any failed cycle.
#[derive(Clone)]
pub struct Connections {
    pub source: Arc<dyn SourceStore>,
    pub index: Arc<dyn SearchIndex>,
    pub sink: Arc<dyn RecordSink>,
}

pub trait Connector: Send + Sync {
    fn connect(&self) -> BoxFuture<'_, Result<Connections, StoreError>>;
}

impl<T> Connector for Arc<T>
where
    T: Connector + ?Sized,
{
    fn connect(&self) -> BoxFuture<'_, Result<Connections, StoreError>> {
        (**self).connect()
    }
}

/// Builds Postgres and Elasticsearch clients from process configuration.
pub struct ServiceConnector {
    database_url: String,
    source_table: String,
    max_segment_records: u64,
    index: ElasticSettings,
    sink: SinkKind,
}

impl ServiceConnector {
    pub fn from_config(config: &Config) -> Self {
        Self {
            database_url: config.database_url.clone(),
            source_table: config.source_table.clone(),
            max_segment_records: config.max_segment_records,
            index: ElasticSettings {
                base_url: config.index_url.clone(),
                index_name: config.index_name.clone(),
                username: config.index_user.clone(),
                password: config.index_pass.clone(),
            },
            sink: config.sink,
        }
    }
}

impl Connector for ServiceConnector {
    fn connect(&self) -> BoxFuture<'_, Result<Connections, StoreError>> {
        Box::pin(async move {
            let pool = crate::db::build_db_pool(&self.database_url).await?;
            let source = PgSourceStore::new(pool, &self.source_table, self.max_segment_records)?;
            let index = Arc::new(ElasticIndex::new(self.index.clone())?);

            let sink: Arc<dyn RecordSink> = match self.sink {
                SinkKind::Index => index.clone(),
                SinkKind::Stdout => Arc::new(NdjsonSink::stdout()),
            };

            Ok(Connections {
                source: Arc::new(source),
                index,
                sink,
            })
        })
    }
}
