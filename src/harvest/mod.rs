pub mod model;
pub mod scheduler;
pub mod service;

pub use model::{HarvestOptions, HarvestReport, HarvestStatus, HarvestSummary};
pub use scheduler::run_schedule;
pub use service::{CancelOutcome, HarvestService};
