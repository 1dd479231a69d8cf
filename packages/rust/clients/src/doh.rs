//! DNS-over-HTTPS client for mail posture lookups.
//!
//! Uses the JSON resolver API (`/resolve?name=...&type=...`) to fetch MX,
//! SPF, and DMARC records for a domain. A domain with none of the three is a
//! valid outcome, not an error; only transport failures surface as errors.

use std::time::Duration;

use reqwest::Client;
use serde::Deserialize;
use tracing::{debug, instrument};

use reconpipe_shared::{PipelineError, Result};

const DEFAULT_TIMEOUT_SECS: u64 = 10;

const TYPE_MX: u16 = 15;
const TYPE_TXT: u16 = 16;

/// Mail-related DNS posture of a domain.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DnsPosture {
    /// Lowest-preference MX exchange, if any.
    pub mx: Option<String>,
    /// SPF policy (`v=spf1 ...`), if published.
    pub spf: Option<String>,
    /// DMARC policy (`v=DMARC1 ...`), if published.
    pub dmarc: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DohResponse {
    #[serde(rename = "Status")]
    status: u32,
    #[serde(rename = "Answer", default)]
    answer: Vec<DohAnswer>,
}

#[derive(Debug, Deserialize)]
struct DohAnswer {
    #[serde(rename = "type")]
    record_type: u16,
    data: String,
}

/// DNS-over-HTTPS resolver client.
pub struct DohClient {
    client: Client,
    base_url: String,
}

impl DohClient {
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

    /// Fetch MX, SPF, and DMARC records for `domain`.
    #[instrument(skip_all, fields(domain = %domain))]
    pub async fn mail_posture(&self, domain: &str) -> Result<DnsPosture> {
        let dmarc_name = format!("_dmarc.{domain}");
        let (mx_answers, txt_answers, dmarc_answers) = tokio::try_join!(
            self.resolve(domain, TYPE_MX),
            self.resolve(domain, TYPE_TXT),
            self.resolve(&dmarc_name, TYPE_TXT),
        )?;

        let mx = lowest_preference_mx(&mx_answers);
        let spf = txt_answers
            .iter()
            .map(|a| unquote_txt(&a.data))
            .find(|t| t.starts_with("v=spf1"));
        let dmarc = dmarc_answers
            .iter()
            .map(|a| unquote_txt(&a.data))
            .find(|t| t.starts_with("v=DMARC1"));

        let posture = DnsPosture { mx, spf, dmarc };
        debug!(
            has_mx = posture.mx.is_some(),
            has_spf = posture.spf.is_some(),
            has_dmarc = posture.dmarc.is_some(),
            "mail posture resolved"
        );
        Ok(posture)
    }

    async fn resolve(&self, name: &str, record_type: u16) -> Result<Vec<DohAnswer>> {
        let url = format!("{}/resolve", self.base_url);
        let response = self
            .client
            .get(&url)
            .query(&[("name", name), ("type", &record_type.to_string())])
            .header("accept", "application/dns-json")
            .send()
            .await
            .map_err(|e| PipelineError::Network(format!("{url}: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(PipelineError::Network(format!(
                "DoH lookup {name}/{record_type}: HTTP {status}"
            )));
        }

        let parsed: DohResponse = response
            .json()
            .await
            .map_err(|e| PipelineError::Network(format!("invalid DoH response: {e}")))?;

        // NXDOMAIN and friends mean "no record", not a lookup failure.
        if parsed.status != 0 {
            return Ok(Vec::new());
        }
        Ok(parsed
            .answer
            .into_iter()
            .filter(|a| a.record_type == record_type)
            .collect())
    }
}

/// Pick the exchange with the lowest preference from MX answer data
/// (`"10 mail.example.com."`).
fn lowest_preference_mx(answers: &[DohAnswer]) -> Option<String> {
    answers
        .iter()
        .filter_map(|a| {
            let mut parts = a.data.split_whitespace();
            let pref: u16 = parts.next()?.parse().ok()?;
            let exchange = parts.next()?.trim_end_matches('.').to_string();
            Some((pref, exchange))
        })
        .min_by_key(|(pref, _)| *pref)
        .map(|(_, exchange)| exchange)
}

/// TXT record data arrives quoted, possibly in multiple segments.
fn unquote_txt(data: &str) -> String {
    data.split('"')
        .filter(|s| !s.trim().is_empty())
        .collect::<Vec<_>>()
        .join("")
}
