//! Browser abstraction for page fetching.
//!
//! Scraping always goes through the [`BrowserEngine`] / [`BrowserPage`]
//! traits so the fetch mechanics stay swappable: the built-in
//! [`StaticEngine`] does plain HTTP fetches, a headless-browser engine can
//! implement the same traits without touching the scraping worker. Pages are
//! rationed through a [`PagePool`] so a run never opens more concurrent pages
//! than configured.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reconpipe_shared::{PipelineError, Result};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;
use url::Url;

/// User-Agent string for page fetches.
const USER_AGENT: &str = concat!("ReconPipe/", env!("CARGO_PKG_VERSION"));

/// A single open page.
///
/// Callers must `close` the page on every exit path; the pool slot is held by
/// the lease, not the page, but engines may pin real resources to an open page.
#[async_trait]
pub trait BrowserPage: Send {
    /// Navigate to `url`, bounded by `timeout`.
    async fn goto(&mut self, url: &Url, timeout: Duration) -> Result<()>;

    /// Resolve when the page reports itself settled (network idle or
    /// equivalent). Engines with no settle signal may pend forever; callers
    /// race this against their own fallback delay.
    async fn wait_settled(&mut self) -> Result<()>;

    /// Scroll the viewport to `fraction` of the document height (0.0..=1.0),
    /// to trigger lazy-loaded content. Static engines treat this as a no-op.
    async fn scroll_to(&mut self, fraction: f64) -> Result<()>;

    /// Current rendered document as an HTML string.
    async fn content(&mut self) -> Result<String>;

    /// Release page resources.
    async fn close(self: Box<Self>) -> Result<()>;
}

/// Factory for pages.
#[async_trait]
pub trait BrowserEngine: Send + Sync {
    async fn open_page(&self) -> Result<Box<dyn BrowserPage>>;

    /// Tear down shared engine resources on process shutdown. Engines
    /// without a persistent process keep the default no-op.
    async fn shutdown(&self) -> Result<()> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// PagePool
// ---------------------------------------------------------------------------

/// Bounds the number of concurrently open pages across the whole process.
pub struct PagePool {
    engine: Arc<dyn BrowserEngine>,
    slots: Arc<Semaphore>,
}

/// An open page plus its held pool slot. The slot frees when the lease drops,
/// after [`PageLease::close`].
pub struct PageLease {
    page: Box<dyn BrowserPage>,
    _permit: OwnedSemaphorePermit,
}

impl PagePool {
    pub fn new(engine: Arc<dyn BrowserEngine>, max_pages: usize) -> Self {
        Self {
            engine,
            slots: Arc::new(Semaphore::new(max_pages)),
        }
    }

    /// Wait for a free slot and open a page in it.
    pub async fn acquire(&self) -> Result<PageLease> {
        let permit = self
            .slots
            .clone()
            .acquire_owned()
            .await
            .map_err(|e| PipelineError::Navigation(e.to_string()))?;
        let page = self.engine.open_page().await?;
        Ok(PageLease {
            page,
            _permit: permit,
        })
    }

    /// Free slots right now, for tests and status reporting.
    pub fn available(&self) -> usize {
        self.slots.available_permits()
    }
}

impl PageLease {
    pub fn page(&mut self) -> &mut Box<dyn BrowserPage> {
        &mut self.page
    }

    /// Close the page and release the pool slot.
    pub async fn close(self) -> Result<()> {
        self.page.close().await
    }
}

// ---------------------------------------------------------------------------
// StaticEngine
// ---------------------------------------------------------------------------

/// Plain-HTTP engine. No script execution: `wait_settled` resolves
/// immediately after a successful fetch and scrolling is a no-op.
pub struct StaticEngine {
    client: reqwest::Client,
}

impl StaticEngine {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .redirect(reqwest::redirect::Policy::limited(5))
            .build()
            .map_err(|e| PipelineError::Network(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client })
    }
}

struct StaticPage {
    client: reqwest::Client,
    body: Option<String>,
}

#[async_trait]
impl BrowserEngine for StaticEngine {
    async fn open_page(&self) -> Result<Box<dyn BrowserPage>> {
        Ok(Box::new(StaticPage {
            client: self.client.clone(),
            body: None,
        }))
    }
}

#[async_trait]
impl BrowserPage for StaticPage {
    async fn goto(&mut self, url: &Url, timeout: Duration) -> Result<()> {
        debug!(%url, "fetching page");
        let response = self
            .client
            .get(url.clone())
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    PipelineError::Navigation(format!("navigation to {url} timed out"))
                } else {
                    PipelineError::Network(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(PipelineError::Navigation(format!(
                "{url} returned HTTP {status}"
            )));
        }

        let body = response
            .text()
            .await
            .map_err(|e| PipelineError::Network(e.to_string()))?;
        self.body = Some(body);
        Ok(())
    }

    async fn wait_settled(&mut self) -> Result<()> {
        // A static fetch is settled as soon as the body has arrived.
        Ok(())
    }

    async fn scroll_to(&mut self, _fraction: f64) -> Result<()> {
        Ok(())
    }

    async fn content(&mut self) -> Result<String> {
        self.body
            .clone()
            .ok_or_else(|| PipelineError::Navigation("content requested before goto".into()))
    }

    async fn close(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn static_engine_fetches_and_reports_content() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/profile"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html><main>hi</main></html>"))
            .mount(&server)
            .await;

        let engine = StaticEngine::new().unwrap();
        let mut page = engine.open_page().await.unwrap();
        let url = Url::parse(&format!("{}/profile", server.uri())).unwrap();
        page.goto(&url, Duration::from_secs(5)).await.unwrap();
        page.wait_settled().await.unwrap();
        page.scroll_to(0.5).await.unwrap();
        let html = page.content().await.unwrap();
        assert!(html.contains("<main>hi</main>"));
        page.close().await.unwrap();
    }

    #[tokio::test]
    async fn non_success_status_is_a_navigation_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/gone"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let engine = StaticEngine::new().unwrap();
        let mut page = engine.open_page().await.unwrap();
        let url = Url::parse(&format!("{}/gone", server.uri())).unwrap();
        let err = page.goto(&url, Duration::from_secs(5)).await.unwrap_err();
        assert!(matches!(err, PipelineError::Navigation(_)));
    }

    #[tokio::test]
    async fn content_before_goto_is_an_error() {
        let engine = StaticEngine::new().unwrap();
        let mut page = engine.open_page().await.unwrap();
        assert!(page.content().await.is_err());
    }

    #[tokio::test]
    async fn pool_bounds_open_pages() {
        let engine: Arc<dyn BrowserEngine> = Arc::new(StaticEngine::new().unwrap());
        let pool = PagePool::new(engine, 2);

        let a = pool.acquire().await.unwrap();
        let _b = pool.acquire().await.unwrap();
        assert_eq!(pool.available(), 0);

        // third acquire blocks until a lease closes
        let third = tokio::time::timeout(Duration::from_millis(50), pool.acquire()).await;
        assert!(third.is_err());

        a.close().await.unwrap();
        let _c = tokio::time::timeout(Duration::from_millis(200), pool.acquire())
            .await
            .expect("slot should free after close")
            .unwrap();
    }
}
