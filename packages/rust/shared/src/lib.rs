//! Shared types, error model, and configuration for ReconPipe.
//!
//! This crate is the foundation depended on by all other ReconPipe crates.
//! It provides:
//! - [`PipelineError`] — the unified error type
//! - Domain entities and status state machines ([`Target`], [`SourceData`], …)
//! - Stage job payloads ([`ScrapeJob`], [`DnsJob`], …)
//! - Configuration ([`AppConfig`], [`ScrapeConfig`], config loading)

pub mod config;
pub mod error;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AppConfig, ConverterConfig, DefaultsConfig, DiscoveryConfig, OpenRouterConfig, PlatformRegion,
    ScrapeConfig, ScrapePoliciesConfig, StagesConfig, config_dir, config_file_path, init_config,
    load_config, load_config_from, validate_api_key,
};
pub use error::{PipelineError, Result};
pub use types::{
    DnsJob, Domain, MinedPayload, Pretext, PretextJob, PretextStatus, ProfileJob, Prompt,
    ScrapeJob, SourceData, SourceDomain, SourceStatus, Target, TargetSourceMap, TargetStatus,
};
