use crate::error::QueryError;
use crate::search::index::{IndexFacet, IndexFacets};
use crate::search::request::ListRequest;
use crate::storage::repository::{FacetDimension, FacetRow, PublicationFilter, PublicationRepository};
use sea_orm::{DatabaseConnection, DbErr};
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::HashSet;

/// Items per dimension in the list envelope.
pub const FACET_TOP_LIMIT: u64 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FacetKind {
    Authors,
    Subjects,
    Journals,
    IssuedYears,
}

impl FacetKind {
    pub const ALL: [FacetKind; 4] = [
        FacetKind::Authors,
        FacetKind::Subjects,
        FacetKind::Journals,
        FacetKind::IssuedYears,
    ];

    pub fn parse(name: &str) -> Result<Self, QueryError> {
        match name.trim().to_lowercase().as_str() {
            "author" | "authors" => Ok(FacetKind::Authors),
            "subject" | "subjects" => Ok(FacetKind::Subjects),
            "journal" | "journals" => Ok(FacetKind::Journals),
            "issued" | "issued_year" | "issued_years" | "year" | "years" => {
                Ok(FacetKind::IssuedYears)
            }
            _ => Err(QueryError::UnsupportedFacet(name.to_string())),
        }
    }

    /// Request parameter that toggles this facet.
    pub fn param(&self) -> &'static str {
        match self {
            FacetKind::Authors => "author",
            FacetKind::Subjects => "subject",
            FacetKind::Journals => "journal",
            FacetKind::IssuedYears => "issued_year",
        }
    }

    fn dimension(&self) -> FacetDimension {
        match self {
            FacetKind::Authors => FacetDimension::Authors,
            FacetKind::Subjects => FacetDimension::Subjects,
            FacetKind::Journals => FacetDimension::Journals,
            FacetKind::IssuedYears => FacetDimension::IssuedYears,
        }
    }

    /// Authors and subjects compare case-insensitively; journals by slug; years as text.
    fn normalise(&self, key: &str) -> String {
        match self {
            FacetKind::Authors | FacetKind::Subjects => key.trim().to_lowercase(),
            FacetKind::Journals | FacetKind::IssuedYears => key.trim().to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FacetItem {
    pub value: String,
    pub label: String,
    pub count: u64,
    pub active: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FacetSummary {
    pub param: String,
    pub total: u64,
    pub items: Vec<FacetItem>,
    /// More values exist than `items` shows; the facet page lists them all.
    pub more: bool,
}

impl FacetSummary {
    fn new(kind: FacetKind, total: u64, items: Vec<FacetItem>) -> Self {
        Self {
            param: kind.param().to_string(),
            more: total > items.len() as u64,
            total,
            items,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FacetSet {
    pub authors: FacetSummary,
    pub subjects: FacetSummary,
    pub journals: FacetSummary,
    pub issued_years: FacetSummary,
}

/// Values the caller currently filters on, normalised per dimension.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActiveFilters {
    pub authors: HashSet<String>,
    pub subjects: HashSet<String>,
    pub journals: HashSet<String>,
    pub issued_years: HashSet<String>,
}

impl ActiveFilters {
    pub fn from_request(req: &ListRequest) -> Self {
        let mut active = ActiveFilters {
            authors: req.author_values().iter().map(|a| a.to_lowercase()).collect(),
            subjects: req.subject_terms().iter().map(|s| s.to_lowercase()).collect(),
            journals: req
                .journal
                .as_deref()
                .map(str::trim)
                .filter(|j| !j.is_empty())
                .map(str::to_string)
                .into_iter()
                .collect(),
            issued_years: req
                .issued_year
                .iter()
                .map(|y| y.trim().to_string())
                .filter(|y| !y.is_empty())
                .collect(),
        };
        if let (Some(from), Some(to)) = (req.issued_from.as_deref(), req.issued_to.as_deref()) {
            if !from.trim().is_empty() && from == to {
                active.issued_years.insert(from.trim().to_string());
            }
        }
        active
    }

    fn set(&self, kind: FacetKind) -> &HashSet<String> {
        match kind {
            FacetKind::Authors => &self.authors,
            FacetKind::Subjects => &self.subjects,
            FacetKind::Journals => &self.journals,
            FacetKind::IssuedYears => &self.issued_years,
        }
    }

    pub fn is_active(&self, kind: FacetKind, key: &str) -> bool {
        let normalised = kind.normalise(key);
        !normalised.is_empty() && self.set(kind).contains(&normalised)
    }
}

/// Builds facet summaries from either backend and marks active values.
pub struct FacetAggregator;

impl FacetAggregator {
    fn item(kind: FacetKind, key: &str, label: &str, count: u64, active: &ActiveFilters) -> FacetItem {
        let label = label.trim();
        // authors and subjects show the label as value; the normalised key is only for matching
        let value = match kind {
            FacetKind::Authors | FacetKind::Subjects => label.to_string(),
            FacetKind::Journals | FacetKind::IssuedYears => key.trim().to_string(),
        };
        FacetItem {
            value,
            label: if label.is_empty() { key.to_string() } else { label.to_string() },
            count,
            active: active.is_active(kind, key),
        }
    }

    pub fn from_rows(kind: FacetKind, rows: &[FacetRow], active: &ActiveFilters) -> Vec<FacetItem> {
        rows.iter()
            .filter(|r| !r.facet_key.trim().is_empty())
            .map(|r| Self::item(kind, &r.facet_key, &r.label, r.count.max(0) as u64, active))
            .collect()
    }

    /// Top `limit` items of every dimension from the relational store.
    pub async fn relational(
        db: &DatabaseConnection,
        filter: &PublicationFilter,
        active: &ActiveFilters,
        limit: u64,
    ) -> Result<FacetSet, DbErr> {
        let mut summaries = Vec::with_capacity(FacetKind::ALL.len());
        for kind in FacetKind::ALL {
            let (rows, total) =
                PublicationRepository::facet_rows(db, filter, kind.dimension(), 0, limit).await?;
            summaries.push(FacetSummary::new(
                kind,
                total,
                Self::from_rows(kind, &rows, active),
            ));
        }
        Ok(Self::into_set(summaries))
    }

    /// One page of a single dimension from the relational store.
    pub async fn relational_page(
        db: &DatabaseConnection,
        filter: &PublicationFilter,
        kind: FacetKind,
        active: &ActiveFilters,
        offset: u64,
        limit: u64,
    ) -> Result<(Vec<FacetItem>, u64), DbErr> {
        let (rows, total) =
            PublicationRepository::facet_rows(db, filter, kind.dimension(), offset, limit).await?;
        Ok((Self::from_rows(kind, &rows, active), total))
    }

    pub fn from_index(facets: &IndexFacets, active: &ActiveFilters, limit: u64) -> FacetSet {
        let summary = |kind: FacetKind, facet: &IndexFacet| {
            let mut items: Vec<FacetItem> = facet
                .buckets
                .iter()
                .map(|b| Self::item(kind, &b.key, &b.label, b.count, active))
                .collect();
            items.sort_by(|a, b| Self::compare(kind, a, b));
            items.truncate(limit as usize);
            FacetSummary::new(kind, facet.total, items)
        };
        FacetSet {
            authors: summary(FacetKind::Authors, &facets.authors),
            subjects: summary(FacetKind::Subjects, &facets.subjects),
            journals: summary(FacetKind::Journals, &facets.journals),
            issued_years: summary(FacetKind::IssuedYears, &facets.issued_years),
        }
    }

    /// Count descending, then label ascending; years break ties newest first.
    fn compare(kind: FacetKind, a: &FacetItem, b: &FacetItem) -> Ordering {
        b.count.cmp(&a.count).then_with(|| match kind {
            FacetKind::IssuedYears => {
                let year = |i: &FacetItem| i.value.parse::<i64>().unwrap_or(i64::MIN);
                year(b).cmp(&year(a))
            }
            _ => a.label.cmp(&b.label),
        })
    }

    fn into_set(mut summaries: Vec<FacetSummary>) -> FacetSet {
        let issued_years = summaries.pop();
        let journals = summaries.pop();
        let subjects = summaries.pop();
        let authors = summaries.pop();
        let empty = |kind: FacetKind| FacetSummary::new(kind, 0, Vec::new());
        FacetSet {
            authors: authors.unwrap_or_else(|| empty(FacetKind::Authors)),
            subjects: subjects.unwrap_or_else(|| empty(FacetKind::Subjects)),
            journals: journals.unwrap_or_else(|| empty(FacetKind::Journals)),
            issued_years: issued_years.unwrap_or_else(|| empty(FacetKind::IssuedYears)),
        }
    }
}
