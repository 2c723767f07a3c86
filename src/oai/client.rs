use crate::error::OaiError;
use crate::oai::parser::{parse_identify, parse_list_records, ParseError, RawRecord};
use crate::oai::transport::OaiTransport;
use chrono::{DateTime, Utc};
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use log::debug;
use reqwest::Url;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

/// Lazy, finite feed of raw records. Restartable only by asking the client again.
pub type RecordStream = BoxStream<'static, Result<RawRecord, OaiError>>;

/// The same feed, one `ListRecords` response at a time.
pub type PageStream = BoxStream<'static, Result<Vec<RawRecord>, OaiError>>;

/// Parameters that only make sense on a ListRecords request.
const LIST_ONLY_PARAMS: &[&str] = &["metadataPrefix", "resumptionToken", "from", "until", "set"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub base_url: String,
    pub params: Vec<(String, String)>,
}

impl Endpoint {
    fn set(&mut self, key: &str, value: &str) {
        self.params.retain(|(k, _)| k != key);
        self.params.push((key.to_string(), value.to_string()));
    }

    fn set_default(&mut self, key: &str, value: &str) {
        if !self.params.iter().any(|(k, _)| k == key) {
            self.params.push((key.to_string(), value.to_string()));
        }
    }
}

/// Splits an OAI URL into its base endpoint and the query parameters it already carries.
/// Repeated keys keep their last value.
pub fn prepare_endpoint(oai_url: &str) -> Result<Endpoint, OaiError> {
    let trimmed = oai_url.trim();
    let mut url = Url::parse(trimmed)
        .map_err(|e| OaiError::transport(trimmed, format!("invalid endpoint URL: {}", e)))?;

    let mut endpoint = Endpoint {
        base_url: String::new(),
        params: Vec::new(),
    };
    for (key, value) in url.query_pairs() {
        endpoint.set(&key, &value);
    }
    url.set_query(None);
    url.set_fragment(None);
    endpoint.base_url = url.to_string();
    Ok(endpoint)
}

pub fn format_oai_datestamp(value: &DateTime<Utc>) -> String {
    value.format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationReport {
    pub ok: bool,
    pub detail: String,
}

enum Cursor {
    Start,
    Resume(String),
    Done,
}

struct FeedState {
    transport: Arc<dyn OaiTransport>,
    endpoint: Endpoint,
    timeout: Duration,
    cursor: Cursor,
}

async fn next_page(mut state: FeedState) -> Result<Option<(Vec<RawRecord>, FeedState)>, OaiError> {
    let params = match &state.cursor {
        Cursor::Done => return Ok(None),
        Cursor::Start => state.endpoint.params.clone(),
        Cursor::Resume(token) => vec![
            ("verb".to_string(), "ListRecords".to_string()),
            ("resumptionToken".to_string(), token.clone()),
        ],
    };
    let base_url = state.endpoint.base_url.as_str();

    let body = state.transport.fetch(base_url, &params, state.timeout).await?;
    let page = parse_list_records(&body).map_err(|e| OaiError::protocol(base_url, e.to_string()))?;
    debug!(
        "OAI page from {}: {} record(s), token {:?}",
        base_url,
        page.records.len(),
        page.resumption_token
    );

    let next = match page.resumption_token {
        Some(token) => {
            if matches!(&state.cursor, Cursor::Resume(previous) if *previous == token) {
                return Err(OaiError::protocol(
                    base_url,
                    format!("resumption token '{}' was returned twice", token),
                ));
            }
            Cursor::Resume(token)
        }
        None => Cursor::Done,
    };
    state.cursor = next;
    Ok(Some((page.records, state)))
}

pub struct OaiClient {
    transport: Arc<dyn OaiTransport>,
    timeout: Duration,
    validate_timeout: Duration,
}

impl OaiClient {
    pub fn new(transport: Arc<dyn OaiTransport>, timeout: Duration, validate_timeout: Duration) -> Self {
        Self {
            transport,
            timeout,
            validate_timeout,
        }
    }

    /// Streams `ListRecords` pages for `oai_url`, following resumption tokens.
    /// A page is requested only when the previous one has been consumed.
    pub fn list_pages(
        &self,
        oai_url: &str,
        from: Option<DateTime<Utc>>,
    ) -> Result<PageStream, OaiError> {
        let mut endpoint = prepare_endpoint(oai_url)?;
        endpoint.set_default("verb", "ListRecords");
        endpoint.set_default("metadataPrefix", "oai_dc");
        if let Some(since) = from {
            endpoint.set("from", &format_oai_datestamp(&since));
        }

        let state = FeedState {
            transport: self.transport.clone(),
            endpoint,
            timeout: self.timeout,
            cursor: Cursor::Start,
        };
        Ok(stream::try_unfold(state, next_page).boxed())
    }

    /// Streams `ListRecords` for `oai_url` record by record.
    /// Only one page is held in memory at a time; the feed stops after `limit` records.
    pub fn list_records(
        &self,
        oai_url: &str,
        from: Option<DateTime<Utc>>,
        limit: Option<usize>,
    ) -> Result<RecordStream, OaiError> {
        let records = self
            .list_pages(oai_url, from)?
            .map_ok(|records| stream::iter(records.into_iter().map(Ok)))
            .try_flatten();

        Ok(match limit {
            Some(n) => records.take(n).boxed(),
            None => records.boxed(),
        })
    }

    /// One `Identify` call; reports whether the endpoint speaks OAI-PMH. Never mutates state.
    pub async fn validate_endpoint(&self, oai_url: &str) -> ValidationReport {
        let fail = |detail: String| ValidationReport { ok: false, detail };

        let mut endpoint = match prepare_endpoint(oai_url) {
            Ok(endpoint) => endpoint,
            Err(err) => return fail(format!("Could not reach endpoint: {}", err)),
        };
        endpoint
            .params
            .retain(|(k, _)| !LIST_ONLY_PARAMS.contains(&k.as_str()));
        endpoint.set("verb", "Identify");

        let body = match self
            .transport
            .fetch(&endpoint.base_url, &endpoint.params, self.validate_timeout)
            .await
        {
            Ok(body) => body,
            Err(OaiError::Transport { detail, .. }) => {
                return fail(format!("Could not reach endpoint: {}", detail))
            }
            Err(other) => return fail(format!("Could not reach endpoint: {}", other)),
        };

        match parse_identify(&body) {
            Ok(info) => ValidationReport {
                ok: true,
                detail: match info.repository_name {
                    Some(name) => format!("Connected to '{}'.", name),
                    None => "Endpoint responded with a valid Identify payload.".to_string(),
                },
            },
            Err(ParseError::Xml(e)) => fail(format!("Response was not valid XML: {}", e)),
            Err(err @ ParseError::Oai { .. }) => fail(err.to_string()),
            Err(ParseError::Unexpected(_)) => {
                fail("The endpoint did not return an Identify response.".to_string())
            }
        }
    }
}
