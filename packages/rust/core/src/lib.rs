//! Pipeline orchestration.
//!
//! - [`coordinator`]: domain discovery and full recon runs
//! - [`profile`]: profile synthesis stage handler
//! - [`pretext`]: pretext drafting stage handler
//! - [`pipeline`]: wiring of storage, queues, workers, and shutdown

pub mod coordinator;
pub mod pipeline;
pub mod pretext;
pub mod profile;

pub use coordinator::{Coordinator, DiscoveryOutcome, ReconSummary};
pub use pipeline::{Pipeline, PipelineConfig, WorkerSet};
