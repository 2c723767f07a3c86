pub mod harvest_run;
pub mod journal;
pub mod publication;
pub mod publication_metadata;

pub use harvest_run::Entity as HarvestRun;
pub use journal::Entity as Journal;
pub use publication::Entity as Publication;
pub use publication_metadata::Entity as PublicationMetadata;
