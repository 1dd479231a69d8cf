//! HTTP clients for external collaborators.
//!
//! - [`contacts`]: contact-discovery API (email format + known contacts per domain)
//! - [`related`]: domain-relation API (related domains for a primary domain)
//! - [`doh`]: DNS-over-HTTPS lookups for mail posture records
//! - [`converter`]: HTML-to-Markdown conversion service
//! - [`llm`]: chat-completion provider for profile synthesis and pretext drafting
//!
//! Every client takes its base URL at construction so tests run against mock
//! servers. API keys arrive as values read from the environment by the caller;
//! they are never persisted.

pub mod contacts;
pub mod converter;
pub mod doh;
pub mod llm;
pub mod related;

/// User-Agent string for collaborator requests.
pub(crate) const USER_AGENT: &str = concat!("ReconPipe/", env!("CARGO_PKG_VERSION"));
