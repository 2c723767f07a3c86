//! Turns one harvested OAI record into publication fields plus its ordered
//! Dublin Core metadata entries. Pure and deterministic: the same record always
//! maps to the same output, which is what makes re-harvesting idempotent.

use crate::error::MappingError;
use crate::oai::parser::{FieldNamespace, RawField, RawRecord};
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

pub const DC_SCHEMA: &str = "dc";

/// dcterms refinements folded onto a Dublin Core element plus qualifier.
const TERM_REFINEMENTS: &[(&str, &str, &str)] = &[
    ("issued", "date", "issued"),
    ("created", "date", "created"),
    ("modified", "date", "modified"),
    ("available", "date", "available"),
    ("dateaccepted", "date", "accepted"),
    ("datesubmitted", "date", "submitted"),
    ("abstract", "description", "abstract"),
    ("tableofcontents", "description", "tableofcontents"),
    ("alternative", "title", "alternative"),
    ("ispartof", "relation", "ispartof"),
    ("haspart", "relation", "haspart"),
    ("isversionof", "relation", "isversionof"),
    ("references", "relation", "references"),
    ("bibliographiccitation", "identifier", "citation"),
    ("extent", "format", "extent"),
    ("medium", "format", "medium"),
    ("spatial", "coverage", "spatial"),
    ("temporal", "coverage", "temporal"),
    ("license", "rights", "license"),
    ("accessrights", "rights", "accessrights"),
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataEntry {
    pub schema: String,
    pub element: String,
    pub qualifier: Option<String>,
    pub value: String,
    pub language: Option<String>,
    pub position: i32,
}

impl MetadataEntry {
    fn matches(&self, element: &str, qualifiers: &[Option<&str>]) -> bool {
        self.schema == DC_SCHEMA
            && self.element == element
            && qualifiers.contains(&self.qualifier.as_deref())
    }
}

/// Core display fields mirrored from the first matching metadata entry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicationFields {
    pub title: String,
    pub description: String,
    pub publisher: String,
    pub issued: Option<NaiveDate>,
    pub resource_type: String,
    pub resource_format: String,
    pub rights: String,
}

impl PublicationFields {
    pub fn issued_year(&self) -> Option<i32> {
        use chrono::Datelike;
        self.issued.map(|d| d.year())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappedRecord {
    pub oai_identifier: String,
    pub oai_datestamp: DateTime<Utc>,
    pub set_specs: Vec<String>,
    pub fields: PublicationFields,
    pub metadata: Vec<MetadataEntry>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    Deleted,
    MissingIdentifier,
    MissingDatestamp,
    MissingMetadata,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::Deleted => "deleted",
            SkipReason::MissingIdentifier => "missing identifier",
            SkipReason::MissingDatestamp => "missing datestamp",
            SkipReason::MissingMetadata => "missing metadata",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mapped {
    Record(MappedRecord),
    Skip {
        identifier: Option<String>,
        reason: SkipReason,
    },
}

/// (element, qualifier, value) as seen through the Dublin Core view.
pub type DcTriple = (String, Option<String>, String);

pub fn map_record(raw: &RawRecord) -> Result<Mapped, MappingError> {
    let identifier = match raw.identifier.as_deref().map(str::trim) {
        Some(id) if !id.is_empty() => id.to_string(),
        _ => {
            return Ok(Mapped::Skip {
                identifier: None,
                reason: SkipReason::MissingIdentifier,
            })
        }
    };
    let skip = |reason| {
        Ok(Mapped::Skip {
            identifier: Some(identifier.clone()),
            reason,
        })
    };

    if raw.deleted {
        return skip(SkipReason::Deleted);
    }
    let datestamp_raw = match raw.datestamp.as_deref().map(str::trim) {
        Some(d) if !d.is_empty() => d,
        _ => return skip(SkipReason::MissingDatestamp),
    };
    let fields = match raw.fields.as_ref() {
        Some(fields) => fields,
        None => return skip(SkipReason::MissingMetadata),
    };

    let oai_datestamp =
        parse_datestamp(datestamp_raw).ok_or_else(|| MappingError::InvalidDatestamp {
            identifier: identifier.clone(),
            value: datestamp_raw.to_string(),
        })?;

    let metadata = metadata_entries(fields);
    let fields = promote_fields(&metadata).ok_or_else(|| MappingError::MissingTitle {
        identifier: identifier.clone(),
    })?;

    Ok(Mapped::Record(MappedRecord {
        oai_identifier: identifier,
        oai_datestamp,
        set_specs: raw.set_specs.clone(),
        fields,
        metadata,
    }))
}

fn metadata_entries(fields: &[RawField]) -> Vec<MetadataEntry> {
    let mut entries = Vec::with_capacity(fields.len());
    for field in fields {
        let value = field.value.trim();
        if value.is_empty() {
            continue;
        }
        let Some((element, qualifier)) = dc_element(field) else {
            continue;
        };
        entries.push(MetadataEntry {
            schema: DC_SCHEMA.to_string(),
            element,
            qualifier,
            value: value.to_string(),
            language: field
                .language
                .as_deref()
                .map(|l| l.trim().to_lowercase())
                .filter(|l| !l.is_empty()),
            position: entries.len() as i32,
        });
    }
    entries
}

fn dc_element(field: &RawField) -> Option<(String, Option<String>)> {
    let name = field.name.trim().to_lowercase();
    if name.is_empty() {
        return None;
    }
    match field.namespace {
        FieldNamespace::Elements => Some((name, None)),
        FieldNamespace::Terms => Some(
            TERM_REFINEMENTS
                .iter()
                .find(|(term, _, _)| *term == name)
                .map(|(_, element, qualifier)| (element.to_string(), Some(qualifier.to_string())))
                .unwrap_or((name, None)),
        ),
        FieldNamespace::Other(_) => None,
    }
}

fn first_value<'a>(
    entries: &'a [MetadataEntry],
    element: &str,
    qualifiers: &[Option<&str>],
) -> Option<&'a str> {
    entries
        .iter()
        .find(|e| e.matches(element, qualifiers))
        .map(|e| e.value.as_str())
}

fn promote_fields(entries: &[MetadataEntry]) -> Option<PublicationFields> {
    let title = first_value(entries, "title", &[None])?;
    let text = |element: &str, qualifiers: &[Option<&str>]| {
        first_value(entries, element, qualifiers)
            .unwrap_or_default()
            .to_string()
    };

    // only the first date is ever promoted; later ones stay ordinary entries
    let issued = first_value(entries, "date", &[None, Some("issued")]).and_then(parse_issued);

    Some(PublicationFields {
        title: title.to_string(),
        description: text("description", &[None, Some("abstract")]),
        publisher: text("publisher", &[None]),
        issued,
        resource_type: text("type", &[None]),
        resource_format: text("format", &[None]),
        rights: text("rights", &[None]),
    })
}

/// Parses an OAI datestamp (`YYYY-MM-DD` or a UTC/offset datetime), truncated to seconds.
pub fn parse_datestamp(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    let parsed = if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        dt.with_timezone(&Utc)
    } else if let Ok(naive) = NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S") {
        naive.and_utc()
    } else {
        NaiveDate::parse_from_str(value, "%Y-%m-%d")
            .ok()?
            .and_hms_opt(0, 0, 0)?
            .and_utc()
    };
    DateTime::from_timestamp(parsed.timestamp(), 0)
}

/// Parses a Dublin Core date as `YYYY-MM-DD`, `YYYY-MM`, `YYYY` or a datetime prefix.
pub fn parse_issued(value: &str) -> Option<NaiveDate> {
    let value = value.trim();
    if let Some(prefix) = value.get(..10) {
        if let Ok(date) = NaiveDate::parse_from_str(prefix, "%Y-%m-%d") {
            return Some(date);
        }
    }
    let year_only = |s: &str| s.len() == 4 && s.bytes().all(|b| b.is_ascii_digit());
    match value.len() {
        7 => {
            let (year, month) = value.split_once('-')?;
            if !year_only(year) {
                return None;
            }
            NaiveDate::from_ymd_opt(year.parse().ok()?, month.parse().ok()?, 1)
        }
        4 if year_only(value) => NaiveDate::from_ymd_opt(value.parse().ok()?, 1, 1),
        _ => None,
    }
}

/// Projects entries back to Dublin Core triples in position order.
pub fn dc_view(entries: &[MetadataEntry]) -> Vec<DcTriple> {
    let mut dc: Vec<&MetadataEntry> = entries.iter().filter(|e| e.schema == DC_SCHEMA).collect();
    dc.sort_by_key(|e| e.position);
    dc.into_iter()
        .map(|e| (e.element.clone(), e.qualifier.clone(), e.value.clone()))
        .collect()
}
