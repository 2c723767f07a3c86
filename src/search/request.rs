use crate::storage::repository::{OrderField, PublicationFilter, PublicationOrdering};
use chrono::{Datelike, NaiveDate};
use serde::Deserialize;

pub const DEFAULT_PAGE_SIZE: u64 = 10;
pub const MAX_PAGE_SIZE: u64 = 100;

/// A publication list/search request as received from the presentation layer.
/// Values arrive as raw strings; anything unparseable is ignored rather than rejected.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ListRequest {
    pub page: Option<u64>,
    pub page_size: Option<u64>,
    pub search: Option<String>,
    pub journal: Option<String>,
    pub issued_from: Option<String>,
    pub issued_to: Option<String>,
    /// Comma-separated; OR-combined.
    pub subject: Option<String>,
    #[serde(default)]
    pub author: Vec<String>,
    #[serde(default)]
    pub issued_year: Vec<String>,
    pub ordering: Option<String>,
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

impl ListRequest {
    pub fn page(&self) -> u64 {
        self.page.unwrap_or(1).max(1)
    }

    pub fn page_size(&self) -> u64 {
        self.page_size
            .unwrap_or(DEFAULT_PAGE_SIZE)
            .clamp(1, MAX_PAGE_SIZE)
    }

    pub fn search_term(&self) -> Option<&str> {
        non_empty(&self.search)
    }

    pub fn subject_terms(&self) -> Vec<String> {
        non_empty(&self.subject)
            .map(|s| {
                s.split(',')
                    .map(str::trim)
                    .filter(|t| !t.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn author_values(&self) -> Vec<String> {
        self.author
            .iter()
            .map(|a| a.trim())
            .filter(|a| !a.is_empty())
            .map(str::to_string)
            .collect()
    }

    pub fn year_values(&self) -> Vec<i32> {
        self.issued_year
            .iter()
            .filter_map(|y| y.trim().parse::<i32>().ok())
            .filter(|y| (1000..=9999).contains(y))
            .collect()
    }

    pub fn filter(&self) -> PublicationFilter {
        PublicationFilter {
            search: self.search_term().map(str::to_string),
            journal_slug: non_empty(&self.journal).map(str::to_string),
            issued_from: non_empty(&self.issued_from).and_then(|v| parse_date_boundary(v, false)),
            issued_to: non_empty(&self.issued_to).and_then(|v| parse_date_boundary(v, true)),
            subjects: self.subject_terms(),
            authors: self.author_values(),
            issued_years: self.year_values(),
        }
    }

    pub fn ordering(&self) -> PublicationOrdering {
        let Some(raw) = non_empty(&self.ordering) else {
            return PublicationOrdering::default();
        };
        let (descending, name) = match raw.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, raw),
        };
        let field = match name {
            "title" => OrderField::Title,
            "issued" => OrderField::Issued,
            "created_at" => OrderField::CreatedAt,
            "updated_at" => OrderField::UpdatedAt,
            _ => return PublicationOrdering::default(),
        };
        PublicationOrdering { field, descending }
    }
}

fn last_day_of_month(year: i32, month: u32) -> Option<NaiveDate> {
    let (next_year, next_month) = if month == 12 { (year + 1, 1) } else { (year, month + 1) };
    NaiveDate::from_ymd_opt(next_year, next_month, 1)?.pred_opt()
}

/// Parses `YYYY-MM-DD`, `YYYY-MM` or `YYYY`. With `end_of_period` a month or year
/// expands to its last day.
pub fn parse_date_boundary(value: &str, end_of_period: bool) -> Option<NaiveDate> {
    let value = value.trim();
    if let Ok(date) = NaiveDate::parse_from_str(value, "%Y-%m-%d") {
        return Some(date);
    }
    let parts: Vec<&str> = value.split('-').collect();
    match parts.as_slice() {
        [year, month] if year.len() == 4 => {
            let year: i32 = year.parse().ok()?;
            let month: u32 = month.parse().ok()?;
            let first = NaiveDate::from_ymd_opt(year, month, 1)?;
            if end_of_period {
                last_day_of_month(first.year(), first.month())
            } else {
                Some(first)
            }
        }
        [year] if year.len() == 4 => {
            let year: i32 = year.parse().ok()?;
            if end_of_period {
                NaiveDate::from_ymd_opt(year, 12, 31)
            } else {
                NaiveDate::from_ymd_opt(year, 1, 1)
            }
        }
        _ => None,
    }
}
