use std::collections::BTreeSet;
use std::sync::OnceLock;

use diesel::sql_query;
use diesel::sql_types::{Array, BigInt, Nullable, Text};
use diesel::QueryableByName;
use diesel_async::pooled_connection::deadpool::Pool;
use diesel_async::{AsyncPgConnection, RunQueryDsl};
use futures::future::BoxFuture;
use regex::Regex;
use tracing::debug;

use super::{SourceRecord, SourceStore, StoreError};
use crate::plan::TimeWindow;
use crate::tag_filter::TagSet;

const TAG_KEY_SEPARATOR: char = '\u{1f}';

/// SQL rendering of [`canonical_tag_key`] over the row's `tags` column.
const TAG_KEY_SQL: &str = "array_to_string(ARRAY(\
    SELECT DISTINCT u.t COLLATE \"C\" FROM unnest(COALESCE(tags, '{}'::text[])) AS u(t) ORDER BY 1\
    ), chr(31))";

/// Rows created in `[$1, $2)`, both bound as epoch millis.
const WINDOW_PREDICATE_SQL: &str = "created >= to_timestamp($1::double precision / 1000) \
     AND created < to_timestamp($2::double precision / 1000)";

/// Sorted, deduplicated tags joined by the unit separator. Matches `TAG_KEY_SQL`
/// byte for byte, so scope membership can be tested with `= ANY($3)`.
pub fn canonical_tag_key(tags: &TagSet) -> String {
    let mut key = String::new();
    for (position, tag) in tags.iter().enumerate() {
        if position > 0 {
            key.push(TAG_KEY_SEPARATOR);
        }
        key.push_str(tag);
    }
    key
}

fn scope_keys(scope: &[TagSet]) -> Vec<String> {
    scope.iter().map(canonical_tag_key).collect()
}

fn table_name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*(\.[A-Za-z_][A-Za-z0-9_]*)?$")
            .expect("table name pattern is valid")
    })
}

/// Identifiers cannot be bound, so the table name is restricted to plain
/// (optionally schema-qualified) identifiers.
fn validate_table_name(table: &str) -> Result<(), StoreError> {
    if table_name_pattern().is_match(table) {
        Ok(())
    } else {
        Err(StoreError::InvalidTable(table.to_string()))
    }
}

#[derive(Debug, QueryableByName)]
struct CountRow {
    #[diesel(sql_type = BigInt)]
    count: i64,
}

#[derive(Debug, QueryableByName)]
struct TagsRow {
    #[diesel(sql_type = Array<Text>)]
    tags: Vec<String>,
}

#[derive(Debug, QueryableByName)]
struct RecordRow {
    #[diesel(sql_type = Text)]
    uid: String,
    #[diesel(sql_type = BigInt)]
    created_ms: i64,
    #[diesel(sql_type = Array<Text>)]
    tags: Vec<String>,
    #[diesel(sql_type = Nullable<Text>)]
    data: Option<String>,
    #[diesel(sql_type = Nullable<Text>)]
    embed: Option<String>,
}

impl From<RecordRow> for SourceRecord {
    fn from(row: RecordRow) -> Self {
        Self {
            uid: row.uid,
            created_ms: row.created_ms,
            tags: row.tags.into_iter().collect(),
            data: row.data,
            embed: row.embed,
        }
    }
}

/// Source store backed by one Postgres table:
/// `uid uuid, created timestamptz, tags text[], data text, embed text`.
pub struct PgSourceStore {
    pool: Pool<AsyncPgConnection>,
    table: String,
    max_rows: u64,
}

impl PgSourceStore {
    /// `max_rows` caps both counts and loads per window.
    pub fn new(
        pool: Pool<AsyncPgConnection>,
        table: &str,
        max_rows: u64,
    ) -> Result<Self, StoreError> {
        validate_table_name(table)?;
        Ok(Self {
            pool,
            table: table.to_string(),
            max_rows: max_rows.max(1),
        })
    }

    fn row_limit(&self) -> i64 {
        i64::try_from(self.max_rows).unwrap_or(i64::MAX)
    }

    /// Binds: `$1` from ms, `$2` to ms, `$3` tag keys, `$4` row limit.
    fn count_sql(&self) -> String {
        format!(
            "SELECT COUNT(DISTINCT uid) AS count FROM (\
             SELECT uid FROM {} WHERE {WINDOW_PREDICATE_SQL} AND {TAG_KEY_SQL} = ANY($3) \
             LIMIT $4) AS windowed",
            self.table
        )
    }

    /// Same binds as [`Self::count_sql`].
    fn load_sql(&self) -> String {
        format!(
            "SELECT uid::text AS uid, \
             floor(EXTRACT(EPOCH FROM created) * 1000)::bigint AS created_ms, \
             COALESCE(array_remove(tags, NULL), '{{}}'::text[]) AS tags, \
             data::text AS data, embed::text AS embed \
             FROM {} WHERE {WINDOW_PREDICATE_SQL} AND {TAG_KEY_SQL} = ANY($3) \
             ORDER BY created LIMIT $4",
            self.table
        )
    }

    fn tag_combinations_sql(&self) -> String {
        format!(
            "SELECT DISTINCT COALESCE(array_remove(tags, NULL), '{{}}'::text[]) AS tags FROM {}",
            self.table
        )
    }
}

impl SourceStore for PgSourceStore {
    fn count<'a>(
        &'a self,
        window: TimeWindow,
        scope: &'a [TagSet],
    ) -> BoxFuture<'a, Result<u64, StoreError>> {
        Box::pin(async move {
            if scope.is_empty() {
                return Ok(0);
            }
            let mut conn = self.pool.get().await?;
            let rows = sql_query(self.count_sql())
                .bind::<BigInt, _>(window.from_ms)
                .bind::<BigInt, _>(window.to_ms)
                .bind::<Array<Text>, _>(scope_keys(scope))
                .bind::<BigInt, _>(self.row_limit())
                .load::<CountRow>(&mut conn)
                .await?;
            let count = rows.into_iter().next().map_or(0, |row| row.count);
            Ok(u64::try_from(count).unwrap_or(0))
        })
    }

    fn load<'a>(
        &'a self,
        window: TimeWindow,
        scope: &'a [TagSet],
    ) -> BoxFuture<'a, Result<Vec<SourceRecord>, StoreError>> {
        Box::pin(async move {
            if scope.is_empty() {
                return Ok(Vec::new());
            }
            let mut conn = self.pool.get().await?;
            let rows = sql_query(self.load_sql())
                .bind::<BigInt, _>(window.from_ms)
                .bind::<BigInt, _>(window.to_ms)
                .bind::<Array<Text>, _>(scope_keys(scope))
                .bind::<BigInt, _>(self.row_limit())
                .load::<RecordRow>(&mut conn)
                .await?;
            debug!(
                event = "source_window_loaded",
                window = %window,
                rows = rows.len(),
                "loaded source rows"
            );
            Ok(rows.into_iter().map(SourceRecord::from).collect())
        })
    }

    fn list_tag_combinations(&self) -> BoxFuture<'_, Result<Vec<TagSet>, StoreError>> {
        Box::pin(async move {
            let mut conn = self.pool.get().await?;
            let rows = sql_query(self.tag_combinations_sql())
                .load::<TagsRow>(&mut conn)
                .await?;
            let distinct: BTreeSet<TagSet> = rows
                .into_iter()
                .map(|row| row.tags.into_iter().collect::<TagSet>())
                .collect();
            Ok(distinct.into_iter().collect())
        })
    }
}
