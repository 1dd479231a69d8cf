//! Contact-discovery API client.
//!
//! Given a domain, the collaborator returns the organization's email address
//! pattern and a list of known contacts, each with zero or more discovery
//! sources carrying a URI, a host domain, and first/last-seen dates. The
//! coordinator turns these into Target, SourceData, and map rows.

use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use reqwest::Client;
use serde::Deserialize;
use tracing::{debug, instrument};

use reconpipe_shared::{PipelineError, Result};

const DEFAULT_TIMEOUT_SECS: u64 = 20;

/// Response to a domain search.
#[derive(Debug, Clone, Deserialize)]
pub struct DomainSearch {
    pub data: DomainSearchData,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DomainSearchData {
    pub domain: String,
    /// Email address pattern, e.g. `{first}.{last}`.
    pub pattern: Option<String>,
    pub organization: Option<String>,
    #[serde(default)]
    pub emails: Vec<ContactRecord>,
}

/// One discovered contact.
#[derive(Debug, Clone, Deserialize)]
pub struct ContactRecord {
    /// The email address.
    pub value: String,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub position: Option<String>,
    #[serde(default)]
    pub sources: Vec<ContactSource>,
}

/// Where a contact was seen.
#[derive(Debug, Clone, Deserialize)]
pub struct ContactSource {
    pub domain: String,
    pub uri: String,
    /// First-seen date, `YYYY-MM-DD`.
    pub extracted_on: Option<String>,
    /// Last-seen date, `YYYY-MM-DD`.
    pub last_seen_on: Option<String>,
}

impl ContactRecord {
    /// Full name assembled from the name parts, if any are present.
    pub fn full_name(&self) -> Option<String> {
        match (self.first_name.as_deref(), self.last_name.as_deref()) {
            (Some(f), Some(l)) => Some(format!("{f} {l}")),
            (Some(f), None) => Some(f.to_string()),
            (None, Some(l)) => Some(l.to_string()),
            (None, None) => None,
        }
    }

    /// Earliest first-seen date across all sources. Used as the contact's
    /// tenure start estimate.
    pub fn earliest_seen(&self) -> Option<DateTime<Utc>> {
        self.sources
            .iter()
            .filter_map(|s| s.extracted_on.as_deref())
            .filter_map(parse_seen_date)
            .min()
    }
}

fn parse_seen_date(s: &str) -> Option<DateTime<Utc>> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc())
}

/// Client for the contact-discovery API.
pub struct ContactsClient {
    client: Client,
    base_url: String,
    api_key: String,
}

impl ContactsClient {
    pub fn new(base_url: &str, api_key: String) -> Result<Self> {
        let client = Client::builder()
            .user_agent(crate::USER_AGENT)
            .timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
            .build()
            .map_err(|e| PipelineError::Network(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
        })
    }

    /// Search a domain for its email pattern and known contacts.
    #[instrument(skip_all, fields(domain = %domain))]
    pub async fn domain_search(&self, domain: &str) -> Result<DomainSearchData> {
        let url = format!("{}/v2/domain-search", self.base_url);
        let response = self
            .client
            .get(&url)
            .query(&[("domain", domain), ("api_key", self.api_key.as_str())])
            .send()
            .await
            .map_err(|e| PipelineError::Network(format!("{url}: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(PipelineError::Network(format!(
                "domain search for {domain}: HTTP {status}"
            )));
        }

        let parsed: DomainSearch = response
            .json()
            .await
            .map_err(|e| PipelineError::Network(format!("invalid domain search response: {e}")))?;

        debug!(
            pattern = ?parsed.data.pattern,
            contacts = parsed.data.emails.len(),
            "domain search complete"
        );
        Ok(parsed.data)
    }
}
