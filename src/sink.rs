//! Sink connectors: the terminal store for vectors, and the search surface.
//!
//! The production sink talks to a vector-capable search index over its JSON
//! REST API. Documents are stored as `{ "vector": [...], "metadata": {...} }`
//! under the chunk id, which makes re-ingestion an idempotent upsert.
//! `store` lazily creates the index on first use, sizing the dense-vector
//! mapping from the first vector it sees, and refreshes the index after each
//! bulk of writes.
//!
//! # Filter language
//!
//! `{field, operator, value}` conditions combined with AND:
//!
//! | Operator | Query primitive |
//! |----------|-----------------|
//! | `=` | `term` |
//! | `<` `<=` `>` `>=` | `range` |
//! | `match` | full-text `match` |

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, info};

use crate::errors::SinkError;
use crate::models::{RagSearchResult, RagVector, SinkInfo, METADATA_FILE_ENTRY_ID};

/// One boolean filter condition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterCondition {
    pub field: String,
    pub operator: FilterOperator,
    pub value: Value,
}

/// Comparison operators supported by the filter language.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FilterOperator {
    #[serde(rename = "=")]
    Eq,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = "<=")]
    Lte,
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = ">=")]
    Gte,
    #[serde(rename = "match")]
    Match,
}

/// Compile filter conditions into bool-query `must` clauses.
pub fn filters_to_must(filters: &[FilterCondition]) -> Vec<Value> {
    filters
        .iter()
        .map(|condition| match condition.operator {
            FilterOperator::Eq => json!({ "term": { (condition.field.clone()): condition.value } }),
            FilterOperator::Lt => {
                json!({ "range": { (condition.field.clone()): { "lt": condition.value } } })
            }
            FilterOperator::Lte => {
                json!({ "range": { (condition.field.clone()): { "lte": condition.value } } })
            }
            FilterOperator::Gt => {
                json!({ "range": { (condition.field.clone()): { "gt": condition.value } } })
            }
            FilterOperator::Gte => {
                json!({ "range": { (condition.field.clone()): { "gte": condition.value } } })
            }
            FilterOperator::Match => {
                json!({ "match": { (condition.field.clone()): condition.value } })
            }
        })
        .collect()
}

/// Upserts vectors into an index and serves queries over them.
#[async_trait]
pub trait SinkConnector: Send + Sync {
    /// Ping the index host. Failure refuses the connector.
    async fn validate(&self) -> Result<(), SinkError>;

    /// Upsert vectors under their ids; returns the number stored.
    async fn store(&self, vectors: &[RagVector]) -> Result<usize, SinkError>;

    /// k-nearest search with an AND filter conjunction.
    async fn search(
        &self,
        vector: &[f32],
        k: usize,
        filters: &[FilterCondition],
    ) -> Result<Vec<RagSearchResult>, SinkError>;

    /// Match-all scan capped at `size`.
    async fn get_documents(&self, size: usize) -> Result<Vec<RagSearchResult>, SinkError>;

    /// Delete documents whose `metadata._file_entry_id` equals `file_id`.
    async fn delete_by_file_id(&self, file_id: &str) -> Result<bool, SinkError>;

    /// Aggregate index information.
    async fn info(&self) -> Result<SinkInfo, SinkError>;
}

// ═══════════════════════════════════════════════════════════════════════
// Search-index sink
// ═══════════════════════════════════════════════════════════════════════

/// REST sink against an Elasticsearch-compatible index.
pub struct SearchIndexSink {
    host: String,
    index: String,
    http: reqwest::Client,
}

impl SearchIndexSink {
    /// Build the sink. `hosts` and `index` are mandatory; only the first
    /// host is used (the client owns one connection for the worker's life).
    pub fn new(hosts: &[String], index: &str, timeout_secs: u64) -> Result<Self, SinkError> {
        let host = hosts
            .first()
            .ok_or_else(|| SinkError::Connection("no index hosts configured".into()))?
            .trim_end_matches('/')
            .to_string();
        if index.is_empty() {
            return Err(SinkError::Connection("no index name configured".into()));
        }
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| SinkError::Connection(e.to_string()))?;
        Ok(Self {
            host,
            index: index.to_string(),
            http,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}{}", self.host, self.index, path)
    }

    /// Create the index if it does not exist yet. The dense-vector mapping
    /// is sized from the first stored vector.
    async fn ensure_index(&self, dims: usize) -> Result<(), SinkError> {
        let exists = self
            .http
            .head(self.url(""))
            .send()
            .await
            .map_err(|e| SinkError::Connection(e.to_string()))?;
        if exists.status().is_success() {
            return Ok(());
        }

        info!(index = %self.index, dims, "index not found, creating");
        let mapping = json!({
            "mappings": {
                "properties": {
                    "vector": {
                        "type": "dense_vector",
                        "dims": dims,
                        "index": true,
                        "similarity": "cosine"
                    },
                    "metadata": { "type": "object", "dynamic": true }
                }
            }
        });
        let response = self
            .http
            .put(self.url(""))
            .json(&mapping)
            .send()
            .await
            .map_err(|e| SinkError::Connection(e.to_string()))?;
        if !response.status().is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SinkError::Insertion(format!(
                "index creation failed: {}",
                body.chars().take(500).collect::<String>()
            )));
        }
        Ok(())
    }

    async fn refresh(&self) -> Result<(), SinkError> {
        self.http
            .post(self.url("/_refresh"))
            .send()
            .await
            .map_err(|e| SinkError::Insertion(e.to_string()))?;
        Ok(())
    }

    async fn run_search(&self, body: &Value) -> Result<Vec<RagSearchResult>, SinkError> {
        let response = self
            .http
            .post(self.url("/_search"))
            .json(body)
            .send()
            .await
            .map_err(|e| SinkError::Query(e.to_string()))?;
        if !response.status().is_success() {
            return Err(SinkError::Query(format!(
                "search returned status {}",
                response.status()
            )));
        }
        let payload: Value = response
            .json()
            .await
            .map_err(|e| SinkError::Query(e.to_string()))?;
        Ok(hits_to_results(&payload))
    }
}

/// Body for a k-NN search with optional boolean filters.
fn build_knn_body(vector: &[f32], k: usize, filters: &[FilterCondition]) -> Value {
    let mut knn = json!({
        "field": "vector",
        "query_vector": vector,
        "k": k,
        "num_candidates": (k * 10).max(100),
    });
    let must = filters_to_must(filters);
    if !must.is_empty() {
        knn["filter"] = json!({ "bool": { "must": must } });
    }
    json!({ "size": k, "knn": knn })
}

/// Shape `hits.hits` into search results, tolerating missing fields.
fn hits_to_results(payload: &Value) -> Vec<RagSearchResult> {
    payload["hits"]["hits"]
        .as_array()
        .map(|hits| {
            hits.iter()
                .filter_map(|hit| {
                    let id = hit["_id"].as_str()?.to_string();
                    let metadata = hit["_source"]["metadata"]
                        .as_object()
                        .cloned()
                        .unwrap_or_default();
                    let vector = hit["_source"]["vector"].as_array().map(|values| {
                        values
                            .iter()
                            .filter_map(|v| v.as_f64())
                            .map(|v| v as f32)
                            .collect()
                    });
                    Some(RagSearchResult {
                        id,
                        metadata,
                        score: hit["_score"].as_f64(),
                        vector,
                    })
                })
                .collect()
        })
        .unwrap_or_default()
}

#[async_trait]
impl SinkConnector for SearchIndexSink {
    async fn validate(&self) -> Result<(), SinkError> {
        let response = self
            .http
            .get(&self.host)
            .send()
            .await
            .map_err(|e| SinkError::Connection(e.to_string()))?;
        if !response.status().is_success() {
            return Err(SinkError::Connection(format!(
                "index host returned status {}",
                response.status()
            )));
        }
        Ok(())
    }

    async fn store(&self, vectors: &[RagVector]) -> Result<usize, SinkError> {
        let Some(first) = vectors.first() else {
            return Ok(0);
        };
        self.ensure_index(first.vector.len()).await?;

        let mut stored = 0;
        for vector in vectors {
            let doc = json!({ "vector": vector.vector, "metadata": vector.metadata });
            let response = self
                .http
                .put(self.url(&format!("/_doc/{}", vector.id)))
                .json(&doc)
                .send()
                .await
                .map_err(|e| SinkError::Insertion(e.to_string()))?;
            if !response.status().is_success() {
                return Err(SinkError::Insertion(format!(
                    "upsert of `{}` returned status {}",
                    vector.id,
                    response.status()
                )));
            }
            let body: Value = response
                .json()
                .await
                .map_err(|e| SinkError::Insertion(e.to_string()))?;
            if matches!(body["result"].as_str(), Some("created") | Some("updated")) {
                stored += 1;
            }
        }

        self.refresh().await?;
        debug!(index = %self.index, stored, "vectors stored");
        Ok(stored)
    }

    async fn search(
        &self,
        vector: &[f32],
        k: usize,
        filters: &[FilterCondition],
    ) -> Result<Vec<RagSearchResult>, SinkError> {
        self.run_search(&build_knn_body(vector, k, filters)).await
    }

    async fn get_documents(&self, size: usize) -> Result<Vec<RagSearchResult>, SinkError> {
        self.run_search(&json!({ "size": size, "query": { "match_all": {} } }))
            .await
    }

    async fn delete_by_file_id(&self, file_id: &str) -> Result<bool, SinkError> {
        let query = json!({
            "query": {
                "term": { (format!("metadata.{}", METADATA_FILE_ENTRY_ID)): file_id }
            }
        });
        let response = self
            .http
            .post(self.url("/_delete_by_query"))
            .json(&query)
            .send()
            .await
            .map_err(|e| SinkError::Query(e.to_string()))?;
        if !response.status().is_success() {
            return Err(SinkError::Query(format!(
                "delete_by_query returned status {}",
                response.status()
            )));
        }
        let body: Value = response
            .json()
            .await
            .map_err(|e| SinkError::Query(e.to_string()))?;
        Ok(body["deleted"].as_u64().unwrap_or(0) > 0)
    }

    async fn info(&self) -> Result<SinkInfo, SinkError> {
        let response = self
            .http
            .get(self.url("/_count"))
            .send()
            .await
            .map_err(|e| SinkError::IndexInfo(e.to_string()))?;
        if !response.status().is_success() {
            return Err(SinkError::IndexInfo(format!(
                "count returned status {}",
                response.status()
            )));
        }
        let body: Value = response
            .json()
            .await
            .map_err(|e| SinkError::IndexInfo(e.to_string()))?;
        Ok(SinkInfo {
            number_vectors_stored: body["count"].as_u64().unwrap_or(0),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn condition(field: &str, operator: FilterOperator, value: Value) -> FilterCondition {
        FilterCondition {
            field: field.to_string(),
            operator,
            value,
        }
    }

    #[test]
    fn test_equality_maps_to_term() {
        let must = filters_to_must(&[condition(
            "metadata.author",
            FilterOperator::Eq,
            json!("ada"),
        )]);
        assert_eq!(must, vec![json!({ "term": { "metadata.author": "ada" } })]);
    }

    #[test]
    fn test_ranges_map_to_range() {
        let must = filters_to_must(&[
            condition("metadata.size", FilterOperator::Gt, json!(10)),
            condition("metadata.size", FilterOperator::Lte, json!(100)),
        ]);
        assert_eq!(must[0], json!({ "range": { "metadata.size": { "gt": 10 } } }));
        assert_eq!(must[1], json!({ "range": { "metadata.size": { "lte": 100 } } }));
    }

    #[test]
    fn test_match_maps_to_match() {
        let must = filters_to_must(&[condition(
            "metadata.text",
            FilterOperator::Match,
            json!("hello"),
        )]);
        assert_eq!(must, vec![json!({ "match": { "metadata.text": "hello" } })]);
    }

    #[test]
    fn test_operator_serde_uses_symbols() {
        let encoded = serde_json::to_string(&FilterOperator::Lte).unwrap();
        assert_eq!(encoded, "\"<=\"");
        let decoded: FilterOperator = serde_json::from_str("\">=\"").unwrap();
        assert_eq!(decoded, FilterOperator::Gte);
    }

    #[test]
    fn test_knn_body_without_filters_has_no_filter_key() {
        let body = build_knn_body(&[0.1, 0.2], 3, &[]);
        assert_eq!(body["size"], json!(3));
        assert_eq!(body["knn"]["k"], json!(3));
        assert!(body["knn"].get("filter").is_none());
    }

    #[test]
    fn test_knn_body_with_filters() {
        let filters = vec![condition("metadata.kind", FilterOperator::Eq, json!("txt"))];
        let body = build_knn_body(&[0.5], 5, &filters);
        assert_eq!(
            body["knn"]["filter"]["bool"]["must"][0],
            json!({ "term": { "metadata.kind": "txt" } })
        );
    }

    #[test]
    fn test_hits_parsing() {
        let payload = json!({
            "hits": {
                "hits": [
                    {
                        "_id": "doc_0",
                        "_score": 0.97,
                        "_source": {
                            "vector": [0.1, 0.2],
                            "metadata": { "text": "hello" }
                        }
                    },
                    { "_id": "doc_1", "_source": {} }
                ]
            }
        });
        let results = hits_to_results(&payload);
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].id, "doc_0");
        assert_eq!(results[0].score, Some(0.97));
        assert_eq!(results[0].vector.as_deref(), Some(&[0.1f32, 0.2][..]));
        assert_eq!(results[0].metadata["text"], json!("hello"));
        assert!(results[1].score.is_none());
    }

    #[test]
    fn test_hits_parsing_tolerates_bad_payload() {
        assert!(hits_to_results(&json!({})).is_empty());
        assert!(hits_to_results(&json!({"hits": {"hits": "nope"}})).is_empty());
    }

    #[test]
    fn test_sink_requires_host_and_index() {
        assert!(SearchIndexSink::new(&[], "idx", 30).is_err());
        assert!(SearchIndexSink::new(&["http://localhost:9200".to_string()], "", 30).is_err());
        assert!(SearchIndexSink::new(&["http://localhost:9200/".to_string()], "idx", 30).is_ok());
    }
}
