use crate::config::SearchConfig;
use crate::error::IndexSyncError;
use crate::storage::repository::PublicationBundle;
use async_trait::async_trait;
use chrono::NaiveDate;
#[cfg(any(test, feature = "test-export-mocks"))]
use mockall::automock;
use reqwest::{Method, RequestBuilder, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Facet buckets fetched per dimension from the index.
pub const MAX_FACET_BUCKETS: u64 = 1000;

const MULTI_VALUED: &[&str] = &[
    "creator",
    "contributor",
    "subject",
    "identifier",
    "source",
    "language",
    "relation",
    "coverage",
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexedEntry {
    pub schema: String,
    pub element: String,
    pub qualifier: String,
    pub value: String,
    pub language: String,
}

/// The denormalised publication as stored in the external index.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexDocument {
    pub id: i32,
    pub slug: String,
    pub title: String,
    pub description: String,
    pub publisher: String,
    pub resource_type: String,
    pub resource_format: String,
    pub rights: String,
    pub issued: Option<NaiveDate>,
    pub issued_year: Option<i32>,
    pub journal_slug: Option<String>,
    pub journal_name: Option<String>,
    pub creator: Vec<String>,
    pub contributor: Vec<String>,
    pub subject: Vec<String>,
    pub identifier: Vec<String>,
    pub source: Vec<String>,
    pub language: Vec<String>,
    pub relation: Vec<String>,
    pub coverage: Vec<String>,
    pub metadata_text: Vec<String>,
    pub metadata: Vec<IndexedEntry>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl IndexDocument {
    pub fn from_bundle(bundle: &PublicationBundle) -> Self {
        let p = &bundle.publication;
        let mut doc = IndexDocument {
            id: p.id,
            slug: p.slug.clone(),
            title: p.title.clone(),
            description: p.description.clone(),
            publisher: p.publisher.clone(),
            resource_type: p.resource_type.clone(),
            resource_format: p.resource_format.clone(),
            rights: p.rights.clone(),
            issued: p.issued,
            issued_year: p.issued_year,
            journal_slug: bundle.journal.as_ref().map(|j| j.slug.clone()),
            journal_name: bundle.journal.as_ref().map(|j| j.name.clone()),
            created_at: p.created_at,
            updated_at: p.updated_at,
            ..Default::default()
        };

        for entry in &bundle.metadata {
            doc.metadata_text.push(entry.value.clone());
            doc.metadata.push(IndexedEntry {
                schema: entry.schema.clone(),
                element: entry.element.clone(),
                qualifier: entry.qualifier.clone(),
                value: entry.value.clone(),
                language: entry.language.clone(),
            });
            if entry.schema != crate::mapper::DC_SCHEMA
                || !entry.qualifier.is_empty()
                || !MULTI_VALUED.contains(&entry.element.as_str())
            {
                continue;
            }
            let target = match entry.element.as_str() {
                "creator" => &mut doc.creator,
                "contributor" => &mut doc.contributor,
                "subject" => &mut doc.subject,
                "identifier" => &mut doc.identifier,
                "source" => &mut doc.source,
                "language" => &mut doc.language,
                "relation" => &mut doc.relation,
                _ => &mut doc.coverage,
            };
            target.push(entry.value.clone());
        }
        doc
    }
}

/// A ranked full-text query with facet aggregations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexQuery {
    pub text: String,
    pub offset: u64,
    pub size: u64,
    pub bucket_size: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndexBucket {
    pub key: String,
    pub label: String,
    pub count: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndexFacet {
    pub buckets: Vec<IndexBucket>,
    /// Distinct values overall, which may exceed the buckets returned.
    pub total: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndexFacets {
    pub authors: IndexFacet,
    pub subjects: IndexFacet,
    pub journals: IndexFacet,
    pub issued_years: IndexFacet,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndexResponse {
    pub total: u64,
    pub ids: Vec<i32>,
    pub facets: IndexFacets,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IndexHealth {
    pub cluster_status: String,
    pub healthy: bool,
}

/// Contract against the external search index.
#[cfg_attr(any(test, feature = "test-export-mocks"), automock)]
#[async_trait]
pub trait SearchIndex: Send + Sync {
    /// Creates the index with its mapping; an existing index is left untouched.
    async fn ensure_index(&self) -> Result<(), IndexSyncError>;

    async fn upsert(&self, documents: &[IndexDocument]) -> Result<(), IndexSyncError>;

    /// Removes documents; ids that are already absent are not an error.
    async fn delete(&self, ids: &[i32]) -> Result<(), IndexSyncError>;

    async fn search(&self, query: &IndexQuery) -> Result<IndexResponse, IndexSyncError>;

    async fn health(&self) -> Result<IndexHealth, IndexSyncError>;
}

/// Elasticsearch-compatible REST client.
pub struct HttpSearchIndex {
    client: reqwest::Client,
    base_url: String,
    index: String,
    username: Option<String>,
    password: Option<String>,
}

impl HttpSearchIndex {
    pub fn new(config: &SearchConfig) -> Result<Self, IndexSyncError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| IndexSyncError::Unreachable(e.to_string()))?;
        Ok(Self {
            client,
            base_url: config.url.trim_end_matches('/').to_string(),
            index: config.index.clone(),
            username: config.username.clone(),
            password: config.password.clone(),
        })
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let builder = self
            .client
            .request(method, format!("{}/{}", self.base_url, path.trim_start_matches('/')));
        match &self.username {
            Some(user) => builder.basic_auth(user, self.password.as_deref()),
            None => builder,
        }
    }

    async fn send_json(&self, builder: RequestBuilder) -> Result<Value, IndexSyncError> {
        let resp = builder
            .send()
            .await
            .map_err(|e| IndexSyncError::Unreachable(e.to_string()))?;
        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| IndexSyncError::Unreachable(e.to_string()))?;
        if !status.is_success() {
            return Err(IndexSyncError::Rejected {
                status: status.as_u16(),
                detail: text.chars().take(500).collect(),
            });
        }
        serde_json::from_str(&text).map_err(|e| IndexSyncError::InvalidResponse(e.to_string()))
    }

    async fn bulk(&self, lines: Vec<String>) -> Result<(), IndexSyncError> {
        let mut body = lines.join("\n");
        body.push('\n');
        let value = self
            .send_json(
                self.request(Method::POST, &format!("{}/_bulk", self.index))
                    .header("Content-Type", "application/x-ndjson")
                    .body(body),
            )
            .await?;
        bulk_failure(&value).map_or(Ok(()), Err)
    }

    fn mapping() -> Value {
        let text_with_raw = json!({
            "type": "text",
            "fields": { "raw": { "type": "keyword" } }
        });
        json!({
            "mappings": {
                "properties": {
                    "id": { "type": "integer" },
                    "slug": { "type": "keyword" },
                    "title": text_with_raw,
                    "description": { "type": "text" },
                    "publisher": { "type": "text" },
                    "resource_type": { "type": "keyword" },
                    "resource_format": { "type": "keyword" },
                    "rights": { "type": "text" },
                    "issued": { "type": "date", "format": "yyyy-MM-dd" },
                    "issued_year": { "type": "integer" },
                    "journal_slug": { "type": "keyword" },
                    "journal_name": { "type": "keyword" },
                    "creator": text_with_raw,
                    "contributor": text_with_raw,
                    "subject": text_with_raw,
                    "identifier": { "type": "keyword" },
                    "source": { "type": "text" },
                    "language": { "type": "keyword" },
                    "relation": { "type": "text" },
                    "coverage": { "type": "text" },
                    "metadata_text": { "type": "text" },
                    "metadata": {
                        "type": "nested",
                        "properties": {
                            "schema": { "type": "keyword" },
                            "element": { "type": "keyword" },
                            "qualifier": { "type": "keyword" },
                            "value": { "type": "text" },
                            "language": { "type": "keyword" }
                        }
                    },
                    "created_at": { "type": "long" },
                    "updated_at": { "type": "long" }
                }
            }
        })
    }
}

fn search_body(query: &IndexQuery) -> Value {
    let terms = |field: &str| json!({ "terms": { "field": field, "size": query.bucket_size } });
    let cardinality = |field: &str| json!({ "cardinality": { "field": field } });
    json!({
        "from": query.offset,
        "size": query.size,
        "track_total_hits": true,
        "_source": false,
        "query": {
            "multi_match": {
                "query": query.text,
                "fields": ["title^3", "description", "publisher", "creator", "subject", "metadata_text"],
                "fuzziness": "AUTO"
            }
        },
        "aggs": {
            "authors": terms("creator.raw"),
            "authors_total": cardinality("creator.raw"),
            "subjects": terms("subject.raw"),
            "subjects_total": cardinality("subject.raw"),
            "journals": {
                "terms": { "field": "journal_slug", "size": query.bucket_size },
                "aggs": {
                    "top_name": { "top_hits": { "size": 1, "_source": { "includes": ["journal_name"] } } }
                }
            },
            "journals_total": cardinality("journal_slug"),
            "issued_years": terms("issued_year"),
            "issued_years_total": cardinality("issued_year")
        }
    })
}

fn bucket_key(bucket: &Value) -> Option<String> {
    match bucket.get("key")? {
        Value::String(s) if !s.trim().is_empty() => Some(s.clone()),
        Value::Number(n) => n.as_i64().map(|v| v.to_string()),
        _ => None,
    }
}

fn parse_facet(aggs: &Value, name: &str) -> IndexFacet {
    let buckets: Vec<IndexBucket> = aggs
        .pointer(&format!("/{}/buckets", name))
        .and_then(Value::as_array)
        .map(|buckets| {
            buckets
                .iter()
                .filter_map(|b| {
                    let key = bucket_key(b)?;
                    let label = b
                        .pointer("/top_name/hits/hits/0/_source/journal_name")
                        .and_then(Value::as_str)
                        .map(str::to_string)
                        .unwrap_or_else(|| key.clone());
                    Some(IndexBucket {
                        key,
                        label,
                        count: b.get("doc_count").and_then(Value::as_u64).unwrap_or(0),
                    })
                })
                .collect()
        })
        .unwrap_or_default();
    let total = aggs
        .pointer(&format!("/{}_total/value", name))
        .and_then(Value::as_u64)
        .filter(|t| *t > 0)
        .unwrap_or(buckets.len() as u64);
    IndexFacet { buckets, total }
}

pub(crate) fn parse_search_response(value: &Value) -> Result<IndexResponse, IndexSyncError> {
    let hits = value
        .get("hits")
        .ok_or_else(|| IndexSyncError::InvalidResponse("missing hits".to_string()))?;
    let total = hits
        .pointer("/total/value")
        .or_else(|| hits.get("total"))
        .and_then(Value::as_u64)
        .unwrap_or(0);
    let ids = hits
        .get("hits")
        .and_then(Value::as_array)
        .map(|hits| {
            hits.iter()
                .filter_map(|h| h.get("_id").and_then(Value::as_str)?.parse().ok())
                .collect()
        })
        .unwrap_or_default();

    let empty = Value::Null;
    let aggs = value.get("aggregations").unwrap_or(&empty);
    Ok(IndexResponse {
        total,
        ids,
        facets: IndexFacets {
            authors: parse_facet(aggs, "authors"),
            subjects: parse_facet(aggs, "subjects"),
            journals: parse_facet(aggs, "journals"),
            issued_years: parse_facet(aggs, "issued_years"),
        },
    })
}

/// First item-level failure of a bulk response. 404 on delete is fine.
fn bulk_failure(value: &Value) -> Option<IndexSyncError> {
    if !value.get("errors").and_then(Value::as_bool).unwrap_or(false) {
        return None;
    }
    value
        .get("items")
        .and_then(Value::as_array)?
        .iter()
        .filter_map(|item| item.as_object()?.values().next())
        .find_map(|result| {
            let status = result.get("status").and_then(Value::as_u64).unwrap_or(500) as u16;
            let is_delete_miss = status == StatusCode::NOT_FOUND.as_u16()
                && result.get("result").and_then(Value::as_str) == Some("not_found");
            if status < 300 || is_delete_miss {
                return None;
            }
            Some(IndexSyncError::Rejected {
                status,
                detail: result
                    .pointer("/error/reason")
                    .and_then(Value::as_str)
                    .unwrap_or("bulk item failed")
                    .to_string(),
            })
        })
}

#[async_trait]
impl SearchIndex for HttpSearchIndex {
    async fn ensure_index(&self) -> Result<(), IndexSyncError> {
        match self
            .send_json(self.request(Method::PUT, &self.index).json(&Self::mapping()))
            .await
        {
            Ok(_) => Ok(()),
            Err(IndexSyncError::Rejected { status: 400, detail })
                if detail.contains("resource_already_exists_exception") =>
            {
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn upsert(&self, documents: &[IndexDocument]) -> Result<(), IndexSyncError> {
        if documents.is_empty() {
            return Ok(());
        }
        let mut lines = Vec::with_capacity(documents.len() * 2);
        for doc in documents {
            lines.push(json!({ "index": { "_index": self.index, "_id": doc.id.to_string() } }).to_string());
            lines.push(
                serde_json::to_string(doc)
                    .map_err(|e| IndexSyncError::InvalidResponse(e.to_string()))?,
            );
        }
        self.bulk(lines).await
    }

    async fn delete(&self, ids: &[i32]) -> Result<(), IndexSyncError> {
        if ids.is_empty() {
            return Ok(());
        }
        let lines = ids
            .iter()
            .map(|id| json!({ "delete": { "_index": self.index, "_id": id.to_string() } }).to_string())
            .collect();
        self.bulk(lines).await
    }

    async fn search(&self, query: &IndexQuery) -> Result<IndexResponse, IndexSyncError> {
        let value = self
            .send_json(
                self.request(Method::POST, &format!("{}/_search", self.index))
                    .json(&search_body(query)),
            )
            .await?;
        parse_search_response(&value)
    }

    async fn health(&self) -> Result<IndexHealth, IndexSyncError> {
        let value = self
            .send_json(self.request(Method::GET, "_cluster/health"))
            .await?;
        let cluster_status = value
            .get("status")
            .and_then(Value::as_str)
            .ok_or_else(|| IndexSyncError::InvalidResponse("missing cluster status".to_string()))?
            .to_string();
        Ok(IndexHealth {
            healthy: matches!(cluster_status.as_str(), "green" | "yellow"),
            cluster_status,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::entity::{journal, publication, publication_metadata};

    fn entry(id: i32, element: &str, qualifier: &str, value: &str) -> publication_metadata::Model {
        publication_metadata::Model {
            id,
            publication_id: 1,
            schema: "dc".into(),
            element: element.into(),
            qualifier: qualifier.into(),
            value: value.into(),
            language: String::new(),
            position: id,
        }
    }

    #[test]
    fn test_document_from_bundle() {
        let bundle = PublicationBundle {
            publication: publication::Model {
                id: 1,
                journal_id: Some(3),
                title: "Maize".into(),
                slug: "maize".into(),
                description: String::new(),
                publisher: String::new(),
                issued: NaiveDate::from_ymd_opt(2020, 1, 1),
                issued_year: Some(2020),
                resource_type: String::new(),
                resource_format: String::new(),
                rights: String::new(),
                oai_identifier: Some("oai:1".into()),
                oai_datestamp: Some(0),
                created_at: 0,
                updated_at: 0,
            },
            journal: Some(journal::Model {
                id: 3,
                slug: "agro".into(),
                name: "Agronomy".into(),
                oai_url: String::new(),
                last_harvested_at: None,
                is_active: true,
                created_at: 0,
                updated_at: 0,
            }),
            metadata: vec![
                entry(0, "title", "", "Maize"),
                entry(1, "creator", "", "Doe, Jane"),
                entry(2, "subject", "", "Agronomy"),
                entry(3, "relation", "ispartof", "Vol 1"),
            ],
        };
        let doc = IndexDocument::from_bundle(&bundle);
        assert_eq!(doc.creator, vec!["Doe, Jane"]);
        assert_eq!(doc.subject, vec!["Agronomy"]);
        assert!(doc.relation.is_empty(), "qualified entries stay in metadata only");
        assert_eq!(doc.metadata.len(), 4);
        assert_eq!(doc.metadata_text.len(), 4);
        assert_eq!(doc.journal_slug.as_deref(), Some("agro"));
    }

    #[test]
    fn test_parse_search_response() {
        let value = json!({
            "hits": { "total": { "value": 12 }, "hits": [ { "_id": "4" }, { "_id": "9" } ] },
            "aggregations": {
                "authors": { "buckets": [ { "key": "Doe, Jane", "doc_count": 3 } ] },
                "authors_total": { "value": 7 },
                "journals": { "buckets": [ {
                    "key": "agro", "doc_count": 12,
                    "top_name": { "hits": { "hits": [ { "_source": { "journal_name": "Agronomy" } } ] } }
                } ] },
                "issued_years": { "buckets": [ { "key": 2020, "doc_count": 5 } ] }
            }
        });
        let resp = parse_search_response(&value).unwrap();
        assert_eq!(resp.total, 12);
        assert_eq!(resp.ids, vec![4, 9]);
        assert_eq!(resp.facets.authors.total, 7);
        assert_eq!(resp.facets.journals.buckets[0].label, "Agronomy");
        assert_eq!(resp.facets.issued_years.buckets[0].key, "2020");
        assert_eq!(resp.facets.issued_years.total, 1);
        assert!(resp.facets.subjects.buckets.is_empty());
    }

    #[test]
    fn test_bulk_failure_ignores_missing_deletes() {
        let ok = json!({ "errors": true, "items": [
            { "delete": { "status": 404, "result": "not_found" } }
        ]});
        assert!(bulk_failure(&ok).is_none());

        let bad = json!({ "errors": true, "items": [
            { "index": { "status": 201 } },
            { "index": { "status": 400, "error": { "reason": "mapper_parsing_exception" } } }
        ]});
        match bulk_failure(&bad) {
            Some(IndexSyncError::Rejected { status, detail }) => {
                assert_eq!(status, 400);
                assert_eq!(detail, "mapper_parsing_exception");
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
