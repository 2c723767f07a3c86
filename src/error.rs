use sea_orm::DbErr;
use thiserror::Error;

/// Failures talking to an OAI-PMH source. Either one aborts the current feed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OaiError {
    #[error("Transport error from {endpoint}: {detail}")]
    Transport {
        endpoint: String,
        status: Option<u16>,
        detail: String,
    },
    #[error("Protocol error from {endpoint}: {detail}")]
    Protocol { endpoint: String, detail: String },
}

impl OaiError {
    pub fn transport(endpoint: impl Into<String>, detail: impl Into<String>) -> Self {
        OaiError::Transport {
            endpoint: endpoint.into(),
            status: None,
            detail: detail.into(),
        }
    }

    pub fn protocol(endpoint: impl Into<String>, detail: impl Into<String>) -> Self {
        OaiError::Protocol {
            endpoint: endpoint.into(),
            detail: detail.into(),
        }
    }

    pub fn endpoint(&self) -> &str {
        match self {
            OaiError::Transport { endpoint, .. } | OaiError::Protocol { endpoint, .. } => endpoint,
        }
    }
}

/// A single record that cannot become a publication. Counted against the run's error budget.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MappingError {
    #[error("record {identifier} has no title")]
    MissingTitle { identifier: String },
    #[error("record {identifier} has an unparseable datestamp '{value}'")]
    InvalidDatestamp { identifier: String, value: String },
}

#[derive(Error, Debug)]
pub enum IndexSyncError {
    #[error("search index unreachable: {0}")]
    Unreachable(String),
    #[error("search index rejected the request (HTTP {status}): {detail}")]
    Rejected { status: u16, detail: String },
    #[error("unexpected search index response: {0}")]
    InvalidResponse(String),
    #[error("could not load publications for indexing: {0}")]
    Storage(#[from] DbErr),
}

#[derive(Error, Debug)]
pub enum HarvestError {
    #[error(transparent)]
    Oai(#[from] OaiError),
    #[error("journal {journal_id} already has a running harvest (run {run_id})")]
    ConcurrentRun { journal_id: i32, run_id: i32 },
    #[error("Journal '{0}' was not found.")]
    JournalNotFound(String),
    #[error("Journal '{0}' does not have an OAI-PMH URL configured.")]
    MissingEndpoint(String),
    #[error("harvest run {0} was not found")]
    RunNotFound(i32),
    #[error("database error: {0}")]
    Database(#[from] DbErr),
}

#[derive(Error, Debug)]
pub enum QueryError {
    #[error("database error: {0}")]
    Database(#[from] DbErr),
    #[error("unsupported facet '{0}'")]
    UnsupportedFacet(String),
    #[error("invalid page {page}: there are {total_pages} page(s)")]
    InvalidPage { page: u64, total_pages: u64 },
}
