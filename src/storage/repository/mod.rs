pub mod harvest_repo;
pub mod journal_repo;
pub mod publication_repo;

pub use harvest_repo::{HarvestLogFilter, HarvestLogRow, HarvestRepository};
pub use journal_repo::JournalRepository;
pub use publication_repo::{
    FacetDimension, FacetRow, OrderField, PublicationBundle, PublicationFilter,
    PublicationOrdering, PublicationRepository, UpsertOutcome,
};
