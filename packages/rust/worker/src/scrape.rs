//! Scraping worker.
//!
//! Per job: `fetching → extracting → converting → stored`, with failure at
//! any step collapsing the source to `failed`. The page handle is closed on
//! every exit path; the engine behind the pool is the single shared browser
//! resource for the whole run.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use scraper::{Html, Selector};
use tracing::{debug, info, instrument, warn};
use url::Url;

use reconpipe_browser::{BrowserPage, PagePool};
use reconpipe_clients::converter::ConverterClient;
use reconpipe_events::{EventBus, PipelineEvent};
use reconpipe_queue::{JobHandler, QueuedJob};
use reconpipe_shared::{
    MinedPayload, PipelineError, Result, ScrapeConfig, ScrapeJob, SourceData, SourceStatus,
};
use reconpipe_storage::Storage;

use crate::convergence;

/// Hosts treated as generic search engines for the URL substitution rule.
const SEARCH_ENGINE_HOSTS: &[&str] = &["google.com", "bing.com", "duckduckgo.com"];

/// What came out of a driven page.
struct PageCapture {
    title: Option<String>,
    html: String,
}

/// Handler for scraping-stage jobs.
pub struct ScrapeHandler {
    storage: Arc<Storage>,
    pool: Arc<PagePool>,
    converter: Arc<ConverterClient>,
    events: EventBus,
    config: ScrapeConfig,
}

impl ScrapeHandler {
    pub fn new(
        storage: Arc<Storage>,
        pool: Arc<PagePool>,
        converter: Arc<ConverterClient>,
        events: EventBus,
        config: ScrapeConfig,
    ) -> Self {
        Self {
            storage,
            pool,
            converter,
            events,
            config,
        }
    }

    #[instrument(skip_all, fields(source_id = job.source_id, url = %job.source_url))]
    async fn run(&self, job: ScrapeJob) -> Result<()> {
        let source = self
            .storage
            .get_source(job.source_id)
            .await?
            .ok_or_else(|| {
                PipelineError::validation(format!("unknown source {}", job.source_id))
            })?;

        // At-least-once delivery: a redelivered job for a terminal source is done.
        if source.status.is_terminal() {
            debug!(status = %source.status, "source already terminal, skipping");
            return Ok(());
        }

        self.storage.mark_source_processing(source.id).await?;
        self.events.emit(PipelineEvent::SourceUpdate {
            source_id: source.id,
            status: SourceStatus::Processing,
            message: None,
        });

        let (scrape_url, original_url) = self.resolve_scrape_url(&source).await?;

        let outcome = self.capture(&scrape_url).await;
        match outcome {
            Ok(capture) => {
                let (content, status_message) = match self.converter.to_markdown(&capture.html).await
                {
                    Ok(markdown) => (markdown, None),
                    Err(e) => {
                        // Conversion failure does not fail the job: store a
                        // placeholder so the pipeline still progresses.
                        warn!(error = %e, "conversion failed, storing placeholder");
                        (
                            placeholder_content(capture.title.as_deref(), &scrape_url),
                            Some(format!("conversion failed: {e}")),
                        )
                    }
                };

                let payload = MinedPayload {
                    scraped_at: Utc::now(),
                    title: capture.title,
                    url: scrape_url,
                    original_url,
                    content,
                };
                let payload = serde_json::to_value(&payload)
                    .map_err(|e| PipelineError::Storage(e.to_string()))?;
                self.storage
                    .mark_source_mined(source.id, &payload, status_message.as_deref())
                    .await?;
                info!(source_id = source.id, "source mined");

                self.finish_source(source.id, SourceStatus::Mined).await?;
                Ok(())
            }
            Err(e) => {
                self.storage
                    .mark_source_failed(source.id, &e.to_string())
                    .await?;
                self.finish_source(source.id, SourceStatus::Failed).await?;
                Err(e)
            }
        }
    }

    /// Emit the terminal event for every mapped target and evaluate each for
    /// convergence.
    async fn finish_source(&self, source_id: i64, status: SourceStatus) -> Result<()> {
        for email in self.storage.target_emails_for_source(source_id).await? {
            let event = match status {
                SourceStatus::Mined => PipelineEvent::SourceMined {
                    source_id,
                    target_email: email.clone(),
                    status,
                },
                _ => PipelineEvent::SourceFailed {
                    source_id,
                    target_email: email.clone(),
                    status,
                },
            };
            self.events.emit(event);
            // A convergence store failure must not fail the job or starve the
            // remaining targets; the next terminal source write retries it.
            if let Err(e) = convergence::evaluate_target(&self.storage, &self.events, &email).await
            {
                warn!(target = %email, error = %e, "convergence evaluation failed");
            }
        }
        Ok(())
    }

    /// Apply the search-redirect substitution rule: when the discovered URL
    /// is a search-engine redirect into a known profile platform and a direct
    /// profile URL is already on file for the same contact, scrape that
    /// instead. The original URL is kept for the stored payload.
    async fn resolve_scrape_url(&self, source: &SourceData) -> Result<(String, Option<String>)> {
        if !is_search_redirect(&source.url) {
            return Ok((source.url.clone(), None));
        }
        for region in &self.config.platform_regions {
            if !source.url.contains(&region.domain) {
                continue;
            }
            if let Some(direct) = self
                .storage
                .find_direct_profile_url(source.id, &region.domain)
                .await?
            {
                info!(
                    original = %source.url,
                    direct = %direct,
                    "substituting direct profile URL for search redirect"
                );
                return Ok((direct, Some(source.url.clone())));
            }
        }
        Ok((source.url.clone(), None))
    }

    /// Fetch and extract one page. The lease (and its page) is closed before
    /// this returns, whatever happened.
    async fn capture(&self, raw_url: &str) -> Result<PageCapture> {
        let url = Url::parse(raw_url)
            .map_err(|e| PipelineError::validation(format!("invalid source URL {raw_url}: {e}")))?;

        let mut lease = self.pool.acquire().await?;
        let driven = self.drive_page(lease.page(), &url).await;
        if let Err(e) = lease.close().await {
            warn!(error = %e, "page close failed");
        }

        let html = driven?;
        self.extract(&url, &html)
    }

    async fn drive_page(&self, page: &mut Box<dyn BrowserPage>, url: &Url) -> Result<String> {
        page.goto(url, self.config.nav_timeout).await?;

        // Race the settle signal against a fixed fallback delay; whichever
        // fires first is accepted.
        tokio::select! {
            settled = page.wait_settled() => {
                if let Err(e) = settled {
                    debug!(error = %e, "settle wait failed, continuing");
                }
            }
            _ = tokio::time::sleep(self.config.settle_fallback) => {
                debug!("settle fallback elapsed");
            }
        }

        // Two scroll steps (midpoint, bottom) to trigger lazy-loaded content.
        page.scroll_to(0.5).await?;
        tokio::time::sleep(self.config.scroll_settle).await;
        page.scroll_to(1.0).await?;
        tokio::time::sleep(self.config.scroll_settle).await;

        page.content().await
    }

    /// Pull the title and the markup to convert. For a platform with a
    /// configured content region, extraction is restricted to that region and
    /// its absence is an extraction failure rather than an empty result.
    fn extract(&self, url: &Url, html: &str) -> Result<PageCapture> {
        let document = Html::parse_document(html);

        let title_sel = Selector::parse("title").unwrap();
        let title = document
            .select(&title_sel)
            .next()
            .map(|t| t.text().collect::<String>().trim().to_string())
            .filter(|t| !t.is_empty());

        let host = url.host_str().unwrap_or_default();
        let region = self
            .config
            .platform_regions
            .iter()
            .find(|r| host == r.domain || host.ends_with(&format!(".{}", r.domain)));

        let html = match region {
            Some(region) => {
                let selector = Selector::parse(&region.selector).map_err(|e| {
                    PipelineError::extraction(format!(
                        "invalid content selector {:?}: {e}",
                        region.selector
                    ))
                })?;
                let node = document.select(&selector).next().ok_or_else(|| {
                    PipelineError::extraction(format!(
                        "content region {:?} not found on {url}",
                        region.selector
                    ))
                })?;
                node.html()
            }
            None => html.to_string(),
        };

        Ok(PageCapture { title, html })
    }
}

#[async_trait]
impl JobHandler for ScrapeHandler {
    async fn handle(&self, job: QueuedJob) -> Result<()> {
        let job: ScrapeJob = serde_json::from_value(job.payload)
            .map_err(|e| PipelineError::validation(format!("bad scrape payload: {e}")))?;
        self.run(job).await
    }
}

fn is_search_redirect(url: &str) -> bool {
    let Ok(parsed) = Url::parse(url) else {
        return false;
    };
    let Some(host) = parsed.host_str() else {
        return false;
    };
    SEARCH_ENGINE_HOSTS
        .iter()
        .any(|engine| host == *engine || host.ends_with(&format!(".{engine}")))
}

fn placeholder_content(title: Option<&str>, url: &str) -> String {
    format!(
        "# {}\n\n{url}\n\n_Content unavailable: conversion failed._\n",
        title.unwrap_or("Untitled page")
    )
}
