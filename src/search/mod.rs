pub mod facets;
pub mod index;
pub mod planner;
pub mod request;
pub mod sync;

pub use facets::{FacetAggregator, FacetItem, FacetKind, FacetSet, FacetSummary};
pub use index::{HttpSearchIndex, IndexDocument, IndexHealth, SearchIndex};
#[cfg(any(test, feature = "test-export-mocks"))]
pub use index::MockSearchIndex;
pub use planner::{Backend, FacetPage, ListEnvelope, PublicationSummary, QueryPlan, QueryPlanner};
pub use request::ListRequest;
pub use sync::{IndexOp, IndexSynchronizer, SyncReport};
