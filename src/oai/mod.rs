//! OAI-PMH harvesting protocol: transport, page parsing and the paginated record feed.

pub mod client;
pub mod parser;
pub mod transport;

pub use client::{
    prepare_endpoint, Endpoint, OaiClient, PageStream, RecordStream, ValidationReport,
};
pub use parser::{FieldNamespace, RawField, RawRecord, RecordPage};
pub use transport::{build_http_client, OaiTransport, ReqwestTransport};
