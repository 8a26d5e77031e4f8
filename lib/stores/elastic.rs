use futures::future::BoxFuture;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

use super::{RecordSink, SearchIndex, SourceRecord, StoreError};
use crate::plan::TimeWindow;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElasticSettings {
    pub base_url: String,
    pub index_name: String,
    pub username: Option<String>,
    pub password: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CountResponse {
    count: u64,
}

#[derive(Debug, Deserialize)]
struct DeleteByQueryResponse {
    #[serde(default)]
    deleted: u64,
}

#[derive(Debug, Deserialize)]
struct BulkResponse {
    #[serde(default)]
    errors: bool,
    #[serde(default)]
    items: Vec<Value>,
}

impl BulkResponse {
    fn failed_items(&self) -> usize {
        if !self.errors {
            return 0;
        }
        self.items
            .iter()
            .filter(|item| {
                item.as_object()
                    .and_then(|actions| actions.values().next())
                    .and_then(|action| action.get("status"))
                    .and_then(Value::as_u64)
                    .map_or(true, |status| status >= 300)
            })
            .count()
    }
}

fn range_query(gte_ms: Option<i64>, lt_ms: i64) -> Value {
    let mut range = json!({ "lt": lt_ms, "format": "epoch_millis" });
    if let Some(gte) = gte_ms {
        range["gte"] = json!(gte);
    }
    json!({ "query": { "range": { "@timestamp": range } } })
}

fn bulk_body(index_name: &str, records: &[SourceRecord]) -> Result<String, StoreError> {
    let mut body = String::new();
    for record in records {
        let action = json!({ "index": { "_index": index_name, "_id": record.uid } });
        body.push_str(&serde_json::to_string(&action)?);
        body.push('\n');
        body.push_str(&serde_json::to_string(record)?);
        body.push('\n');
    }
    Ok(body)
}

/// Elasticsearch index holding one document per source record, keyed by `uid`.
pub struct ElasticIndex {
    client: reqwest::Client,
    settings: ElasticSettings,
}

impl ElasticIndex {
    pub fn new(settings: ElasticSettings) -> Result<Self, StoreError> {
        let client = reqwest::Client::builder().build()?;
        Ok(Self { client, settings })
    }

    fn url(&self, endpoint: &str) -> String {
        format!(
            "{}/{}/{endpoint}",
            self.settings.base_url.trim_end_matches('/'),
            self.settings.index_name
        )
    }

    fn post(&self, url: &str) -> reqwest::RequestBuilder {
        let request = self.client.post(url);
        match &self.settings.username {
            Some(user) => request.basic_auth(user, self.settings.password.as_deref()),
            None => request,
        }
    }

    /// Sends a JSON query. A missing index yields `None`.
    async fn post_query(
        &self,
        endpoint: &str,
        body: &Value,
    ) -> Result<Option<reqwest::Response>, StoreError> {
        let url = self.url(endpoint);
        let response = self.post(&url).json(body).send().await?;

        match response.status() {
            StatusCode::NOT_FOUND => {
                debug!(event = "index_missing", url = %url, "index does not exist yet");
                Ok(None)
            }
            status if status.is_success() => Ok(Some(response)),
            status => Err(StoreError::UnexpectedStatus {
                resource: url,
                status: status.as_u16(),
            }),
        }
    }
}

impl SearchIndex for ElasticIndex {
    fn count(&self, window: TimeWindow) -> BoxFuture<'_, Result<u64, StoreError>> {
        Box::pin(async move {
            let query = range_query(Some(window.from_ms), window.to_ms);
            match self.post_query("_count", &query).await? {
                Some(response) => Ok(response.json::<CountResponse>().await?.count),
                None => Ok(0),
            }
        })
    }

    fn delete_older_than(&self, cutoff_ms: i64) -> BoxFuture<'_, Result<u64, StoreError>> {
        Box::pin(async move {
            let query = range_query(None, cutoff_ms);
            match self.post_query("_delete_by_query", &query).await? {
                Some(response) => Ok(response.json::<DeleteByQueryResponse>().await?.deleted),
                None => Ok(0),
            }
        })
    }
}

impl RecordSink for ElasticIndex {
    fn push<'a>(&'a self, records: &'a [SourceRecord]) -> BoxFuture<'a, Result<usize, StoreError>> {
        Box::pin(async move {
            if records.is_empty() {
                return Ok(0);
            }

            let url = self.url("_bulk?refresh=wait_for");
            let body = bulk_body(&self.settings.index_name, records)?;
            let response = self
                .post(&url)
                .header(reqwest::header::CONTENT_TYPE, "application/x-ndjson")
                .body(body)
                .send()
                .await?;

            let status = response.status();
            if !status.is_success() {
                return Err(StoreError::UnexpectedStatus {
                    resource: url,
                    status: status.as_u16(),
                });
            }

            let failed = response.json::<BulkResponse>().await?.failed_items();
            if failed > 0 {
                warn!(
                    event = "index_bulk_partial_failure",
                    failed,
                    total = records.len(),
                    "bulk write rejected some records"
                );
                return Err(StoreError::BulkRejected {
                    resource: url,
                    failed,
                    total: records.len(),
                });
            }

            Ok(records.len())
        })
    }
}
