//! Domain-relation API client.
//!
//! Given a primary domain, the collaborator reports which other domains the
//! organization answers for, plus an application identifier describing what
//! produced the relation (mail autodiscovery, certificate transparency, ...).

use std::time::Duration;

use reqwest::Client;
use serde::Deserialize;
use tracing::{debug, instrument};

use reconpipe_shared::{PipelineError, Result};

const DEFAULT_TIMEOUT_SECS: u64 = 15;

/// Relation lookup result.
#[derive(Debug, Clone, Deserialize)]
pub struct RelatedDomains {
    /// Identifier of the application/mechanism that produced the relation.
    pub application: Option<String>,
    #[serde(default)]
    pub domains: Vec<String>,
}

/// Client for the domain-relation API.
pub struct RelatedClient {
    client: Client,
    base_url: String,
}

impl RelatedClient {
    pub fn new(base_url: &str) -> Result<Self> {
        let client = Client::builder()
            .user_agent(crate::USER_AGENT)
            .timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
            .build()
            .map_err(|e| PipelineError::Network(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    /// Look up domains related to `domain`. The primary domain itself is
    /// filtered out of the result.
    #[instrument(skip_all, fields(domain = %domain))]
    pub async fn lookup(&self, domain: &str) -> Result<RelatedDomains> {
        let url = format!("{}/related", self.base_url);
        let response = self
            .client
            .get(&url)
            .query(&[("domain", domain)])
            .send()
            .await
            .map_err(|e| PipelineError::Network(format!("{url}: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(PipelineError::Network(format!(
                "relation lookup for {domain}: HTTP {status}"
            )));
        }

        let mut parsed: RelatedDomains = response
            .json()
            .await
            .map_err(|e| PipelineError::Network(format!("invalid relation response: {e}")))?;

        parsed.domains.retain(|d| !d.eq_ignore_ascii_case(domain));
        debug!(related = parsed.domains.len(), "relation lookup complete");
        Ok(parsed)
    }
}
