use crate::error::{IndexSyncError, QueryError};
use crate::search::facets::{ActiveFilters, FacetAggregator, FacetItem, FacetKind, FacetSet, FACET_TOP_LIMIT};
use crate::search::index::{IndexQuery, SearchIndex, MAX_FACET_BUCKETS};
use crate::search::request::ListRequest;
use crate::storage::repository::{
    PublicationBundle, PublicationFilter, PublicationOrdering, PublicationRepository,
};
use chrono::NaiveDate;
use log::{debug, warn};
use sea_orm::DatabaseConnection;
use serde::Serialize;
use std::sync::Arc;

pub const FACET_PAGE_SIZE_DEFAULT: u64 = 25;
pub const FACET_PAGE_SIZE_MAX: u64 = 100;

/// Backend chosen for one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryPlan {
    /// Explicit predicates against the relational store; a query term is a substring filter.
    Relational {
        filter: PublicationFilter,
        ordering: PublicationOrdering,
    },
    /// Ranked full-text search plus aggregations in one index call.
    Index { text: String },
}

impl QueryPlan {
    /// Free text alone goes to the index; any structured filter keeps the request
    /// relational so that every filter is applied exactly.
    pub fn select(req: &ListRequest) -> QueryPlan {
        let filter = req.filter();
        match filter.search_term() {
            Some(text) if !filter.has_structured_filters() => QueryPlan::Index {
                text: text.to_string(),
            },
            _ => QueryPlan::Relational {
                filter,
                ordering: req.ordering(),
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    Relational,
    Index,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PublicationSummary {
    pub id: i32,
    pub slug: String,
    pub title: String,
    pub description: String,
    pub publisher: String,
    pub issued: Option<NaiveDate>,
    pub resource_type: String,
    pub journal_slug: Option<String>,
    pub journal_name: Option<String>,
    pub authors: Vec<String>,
    pub subjects: Vec<String>,
}

impl PublicationSummary {
    fn from_bundle(bundle: PublicationBundle) -> Self {
        let values = |element: &str| {
            bundle
                .metadata
                .iter()
                .filter(|m| m.element == element && m.qualifier.is_empty())
                .map(|m| m.value.clone())
                .collect::<Vec<_>>()
        };
        let authors = values("creator");
        let subjects = values("subject");
        let p = bundle.publication;
        PublicationSummary {
            id: p.id,
            slug: p.slug,
            title: p.title,
            description: p.description,
            publisher: p.publisher,
            issued: p.issued,
            resource_type: p.resource_type,
            journal_slug: bundle.journal.as_ref().map(|j| j.slug.clone()),
            journal_name: bundle.journal.map(|j| j.name),
            authors,
            subjects,
        }
    }
}

/// Shared response shape of both backends.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ListEnvelope {
    pub count: u64,
    pub page: u64,
    pub page_size: u64,
    pub results: Vec<PublicationSummary>,
    pub facets: FacetSet,
    pub backend: Backend,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FacetPage {
    pub count: u64,
    pub page: u64,
    pub page_size: u64,
    pub total_pages: u64,
    pub param: String,
    pub results: Vec<FacetItem>,
}

fn total_pages(count: u64, page_size: u64) -> u64 {
    count.div_ceil(page_size.max(1)).max(1)
}

pub struct QueryPlanner {
    db: Arc<DatabaseConnection>,
    index: Arc<dyn SearchIndex>,
}

impl QueryPlanner {
    pub fn new(db: Arc<DatabaseConnection>, index: Arc<dyn SearchIndex>) -> Self {
        Self { db, index }
    }

    /// Serves a list/search request. Index failures fall back to the relational
    /// store; only relational failures are returned.
    pub async fn list(&self, req: &ListRequest) -> Result<ListEnvelope, QueryError> {
        let active = ActiveFilters::from_request(req);
        match QueryPlan::select(req) {
            QueryPlan::Relational { filter, ordering } => {
                self.run_relational(req, &filter, ordering, &active).await
            }
            QueryPlan::Index { text } => match self.run_index(req, &text, &active).await {
                Ok(envelope) => envelope,
                Err(e) => {
                    warn!("Search index unavailable, serving '{}' from the database: {}", text, e);
                    self.run_relational(req, &req.filter(), req.ordering(), &active)
                        .await
                }
            },
        }
    }

    async fn run_relational(
        &self,
        req: &ListRequest,
        filter: &PublicationFilter,
        ordering: PublicationOrdering,
        active: &ActiveFilters,
    ) -> Result<ListEnvelope, QueryError> {
        let (page, page_size) = (req.page(), req.page_size());
        let (rows, count) =
            PublicationRepository::list_page(&self.db, filter, ordering, page, page_size).await?;
        let pages = total_pages(count, page_size);
        if page > pages {
            return Err(QueryError::InvalidPage {
                page,
                total_pages: pages,
            });
        }

        let ids: Vec<i32> = rows.iter().map(|p| p.id).collect();
        let results = PublicationRepository::load_bundles(&self.db, &ids)
            .await?
            .into_iter()
            .map(PublicationSummary::from_bundle)
            .collect();
        let facets = FacetAggregator::relational(&self.db, filter, active, FACET_TOP_LIMIT).await?;

        debug!("Relational list: {} match(es), page {}/{}", count, page, pages);
        Ok(ListEnvelope {
            count,
            page,
            page_size,
            results,
            facets,
            backend: Backend::Relational,
        })
    }

    /// Outer error: the index failed and the caller may fall back.
    /// Inner error: the relational store failed while hydrating results.
    async fn run_index(
        &self,
        req: &ListRequest,
        text: &str,
        active: &ActiveFilters,
    ) -> Result<Result<ListEnvelope, QueryError>, IndexSyncError> {
        let (page, page_size) = (req.page(), req.page_size());
        let response = self
            .index
            .search(&IndexQuery {
                text: text.to_string(),
                offset: (page - 1) * page_size,
                size: page_size,
                bucket_size: MAX_FACET_BUCKETS,
            })
            .await?;

        let pages = total_pages(response.total, page_size);
        if page > pages {
            return Ok(Err(QueryError::InvalidPage {
                page,
                total_pages: pages,
            }));
        }

        let bundles = match PublicationRepository::load_bundles(&self.db, &response.ids).await {
            Ok(bundles) => bundles,
            Err(e) => return Ok(Err(e.into())),
        };
        Ok(Ok(ListEnvelope {
            count: response.total,
            page,
            page_size,
            results: bundles.into_iter().map(PublicationSummary::from_bundle).collect(),
            facets: FacetAggregator::from_index(&response.facets, active, FACET_TOP_LIMIT),
            backend: Backend::Index,
        }))
    }

    /// All values of one facet dimension, paginated. Pages past the end clamp to the last page.
    pub async fn facet_page(
        &self,
        facet_name: &str,
        req: &ListRequest,
        page: Option<u64>,
        page_size: Option<u64>,
    ) -> Result<FacetPage, QueryError> {
        let kind = FacetKind::parse(facet_name)?;
        let page_size = page_size
            .unwrap_or(FACET_PAGE_SIZE_DEFAULT)
            .clamp(1, FACET_PAGE_SIZE_MAX);
        let filter = req.filter();
        let active = ActiveFilters::from_request(req);

        // the total is only known after the first query, so a clamped page costs a second one
        let requested = page.unwrap_or(1).max(1);
        let (mut results, count) = FacetAggregator::relational_page(
            &self.db,
            &filter,
            kind,
            &active,
            (requested - 1) * page_size,
            page_size,
        )
        .await?;
        let pages = total_pages(count, page_size);
        let page = requested.min(pages);
        if page != requested {
            results = FacetAggregator::relational_page(
                &self.db,
                &filter,
                kind,
                &active,
                (page - 1) * page_size,
                page_size,
            )
            .await?
            .0;
        }

        Ok(FacetPage {
            count,
            page,
            page_size,
            total_pages: pages,
            param: kind.param().to_string(),
            results,
        })
    }
}
