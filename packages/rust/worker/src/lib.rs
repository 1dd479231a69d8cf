//! Stage workers that mutate entity state.
//!
//! - [`scrape`]: the scraping worker (fetch → extract → convert → store)
//! - [`dns`]: the DNS posture worker
//! - [`convergence`]: the status convergence engine invoked after every
//!   terminal source write

pub mod convergence;
pub mod dns;
pub mod scrape;

pub use convergence::{Convergence, evaluate_target};
pub use dns::DnsHandler;
pub use scrape::ScrapeHandler;
