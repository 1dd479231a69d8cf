//! HTML-to-Markdown conversion service client.
//!
//! The converter is an external collaborator: extracted HTML is posted as a
//! multipart upload and comes back as Markdown. All failures here map to
//! `PipelineError::Conversion`, which scraping jobs treat as recoverable and
//! downgrade to a placeholder payload instead of failing the source.

use std::time::Duration;

use reqwest::Client;
use reqwest::multipart::{Form, Part};
use serde::Deserialize;
use tracing::{debug, instrument};

use reconpipe_shared::{PipelineError, Result};

#[derive(Debug, Deserialize)]
struct ConvertResponse {
    markdown: String,
}

/// Client for the conversion service.
pub struct ConverterClient {
    client: Client,
    base_url: String,
    timeout: Duration,
}

impl ConverterClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .user_agent(crate::USER_AGENT)
            .build()
            .map_err(|e| PipelineError::Network(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            timeout,
        })
    }

    /// Convert an HTML fragment to Markdown.
    #[instrument(skip_all, fields(bytes = html.len()))]
    pub async fn to_markdown(&self, html: &str) -> Result<String> {
        let url = format!("{}/convert", self.base_url);
        let part = Part::bytes(html.as_bytes().to_vec())
            .file_name("page.html")
            .mime_str("text/html")
            .map_err(|e| PipelineError::Conversion(e.to_string()))?;
        let form = Form::new().part("file", part);

        let response = self
            .client
            .post(&url)
            .timeout(self.timeout)
            .multipart(form)
            .send()
            .await
            .map_err(|e| PipelineError::Conversion(format!("{url}: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(PipelineError::Conversion(format!(
                "converter returned HTTP {status}"
            )));
        }

        let parsed: ConvertResponse = response
            .json()
            .await
            .map_err(|e| PipelineError::Conversion(format!("invalid converter response: {e}")))?;

        debug!(markdown_len = parsed.markdown.len(), "conversion complete");
        Ok(parsed.markdown)
    }
}
