//! Wiring of storage, queues, stage workers, and shutdown.
//!
//! [`Pipeline::build`] opens the database, constructs the service clients and
//! stage handlers, and hands back one object the CLI drives. Workers are
//! spawned explicitly via [`Pipeline::spawn_workers`] so one-shot commands
//! (status, review) can use storage without paying for worker tasks.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use reconpipe_browser::{BrowserEngine, PagePool};
use reconpipe_clients::contacts::ContactsClient;
use reconpipe_clients::converter::ConverterClient;
use reconpipe_clients::doh::DohClient;
use reconpipe_clients::llm::{LlmClient, OpenRouterClient};
use reconpipe_clients::related::RelatedClient;
use reconpipe_events::EventBus;
use reconpipe_queue::{JobHandler, Stage, StageQueue};
use reconpipe_shared::config::{AppConfig, ScrapeConfig, StagesConfig, validate_api_key};
use reconpipe_shared::{PipelineError, Result};
use reconpipe_storage::Storage;
use reconpipe_worker::{DnsHandler, ScrapeHandler};

use crate::coordinator::Coordinator;
use crate::pretext::{PretextHandler, ensure_default_prompt};
use crate::profile::ProfileHandler;

/// Poll interval used by [`Pipeline::drain`].
const DRAIN_POLL: Duration = Duration::from_millis(200);

/// Everything [`Pipeline::build`] needs, resolved from the app config plus
/// the environment. Kept separate from [`AppConfig`] so tests can point every
/// endpoint at a mock server.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub db_path: PathBuf,
    pub stages: StagesConfig,
    pub scrape: ScrapeConfig,
    pub discovery_base_url: String,
    pub discovery_api_key: String,
    pub related_base_url: String,
    pub doh_base_url: String,
    pub openrouter_base_url: String,
    pub openrouter_api_key: String,
    pub model: String,
    pub converter_base_url: String,
    pub converter_timeout: Duration,
}

impl PipelineConfig {
    /// Resolve a runtime config from the loaded app config. Fails when either
    /// API key env var is unset.
    pub fn from_app(config: &AppConfig) -> Result<Self> {
        Ok(Self {
            db_path: config.db_path()?,
            stages: config.stages.clone(),
            scrape: ScrapeConfig::from(config),
            discovery_base_url: config.discovery.base_url.clone(),
            discovery_api_key: validate_api_key(&config.discovery.api_key_env)?,
            related_base_url: config.discovery.related_base_url.clone(),
            doh_base_url: config.discovery.doh_base_url.clone(),
            openrouter_base_url: config.openrouter.base_url.clone(),
            openrouter_api_key: validate_api_key(&config.openrouter.api_key_env)?,
            model: config.openrouter.default_model.clone(),
            converter_base_url: config.converter.base_url.clone(),
            converter_timeout: Duration::from_secs(config.converter.timeout_secs),
        })
    }
}

/// Assembled pipeline: storage, event bus, queues, and stage handlers.
pub struct Pipeline {
    storage: Arc<Storage>,
    events: EventBus,
    queue: StageQueue,
    coordinator: Coordinator,
    stages: StagesConfig,
    engine: Arc<dyn BrowserEngine>,
    dns: Arc<DnsHandler>,
    scrape: Arc<ScrapeHandler>,
    profile: Arc<ProfileHandler>,
    pretext: Arc<PretextHandler>,
}

impl Pipeline {
    /// Open storage and wire every stage against `engine` for page rendering.
    #[instrument(skip_all, fields(db = %config.db_path.display()))]
    pub async fn build(config: PipelineConfig, engine: Arc<dyn BrowserEngine>) -> Result<Self> {
        let storage = Arc::new(Storage::open(&config.db_path).await?);
        ensure_default_prompt(&storage).await?;

        let events = EventBus::new();
        let queue = StageQueue::new(storage.clone());

        let contacts =
            ContactsClient::new(&config.discovery_base_url, config.discovery_api_key.clone())?;
        let related = RelatedClient::new(&config.related_base_url)?;
        let doh = DohClient::new(&config.doh_base_url)?;
        let converter = Arc::new(ConverterClient::new(
            &config.converter_base_url,
            config.converter_timeout,
        )?);
        let llm: Arc<dyn LlmClient> = Arc::new(OpenRouterClient::new(
            &config.openrouter_base_url,
            config.openrouter_api_key.clone(),
            config.model.clone(),
        )?);

        // One page slot per scrape worker; extra slots would never be used.
        let pool = Arc::new(PagePool::new(
            engine.clone(),
            config.stages.scrape_concurrency,
        ));

        let coordinator = Coordinator::new(
            storage.clone(),
            queue.clone(),
            events.clone(),
            contacts,
            related,
        );
        let dns = Arc::new(DnsHandler::new(storage.clone(), doh, events.clone()));
        let scrape = Arc::new(ScrapeHandler::new(
            storage.clone(),
            pool,
            converter,
            events.clone(),
            config.scrape.clone(),
        ));
        let profile = Arc::new(ProfileHandler::new(
            storage.clone(),
            llm.clone(),
            events.clone(),
        ));
        let pretext = Arc::new(PretextHandler::new(storage.clone(), llm, events.clone()));

        info!("pipeline assembled");
        Ok(Self {
            storage,
            events,
            queue,
            coordinator,
            stages: config.stages,
            engine,
            dns,
            scrape,
            profile,
            pretext,
        })
    }

    pub fn storage(&self) -> &Arc<Storage> {
        &self.storage
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn queue(&self) -> &StageQueue {
        &self.queue
    }

    pub fn coordinator(&self) -> &Coordinator {
        &self.coordinator
    }

    /// Spawn one drain loop per stage. Workers stop (after finishing in-flight
    /// jobs) when `shutdown` fires.
    pub fn spawn_workers(&self, shutdown: &broadcast::Sender<()>) -> WorkerSet {
        let plan: [(Stage, usize, Arc<dyn JobHandler>); 4] = [
            (Stage::Dns, self.stages.dns_concurrency, self.dns.clone()),
            (
                Stage::Scrape,
                self.stages.scrape_concurrency,
                self.scrape.clone(),
            ),
            (
                Stage::Profile,
                self.stages.profile_concurrency,
                self.profile.clone(),
            ),
            (
                Stage::Pretext,
                self.stages.pretext_concurrency,
                self.pretext.clone(),
            ),
        ];

        let tasks = plan
            .into_iter()
            .map(|(stage, concurrency, handler)| {
                let queue = self.queue.clone();
                let shutdown = shutdown.subscribe();
                debug!(%stage, concurrency, "spawning stage worker");
                tokio::spawn(
                    async move { queue.process(stage, concurrency, shutdown, handler).await },
                )
            })
            .collect();

        WorkerSet { tasks }
    }

    /// Tear down the shared browser engine. Called once, after every worker
    /// has exited. Close failures are logged, not propagated.
    pub async fn shutdown(&self) {
        if let Err(e) = self.engine.shutdown().await {
            warn!(error = %e, "browser engine shutdown failed");
        }
    }

    /// Wait until no stage has queued or active jobs left.
    pub async fn drain(&self) -> Result<()> {
        loop {
            let mut live = 0;
            for stage in Stage::ALL {
                live += self.queue.live_count(stage).await?;
            }
            if live == 0 {
                return Ok(());
            }
            tokio::time::sleep(DRAIN_POLL).await;
        }
    }
}

/// Handles of the spawned stage workers.
pub struct WorkerSet {
    tasks: Vec<JoinHandle<Result<()>>>,
}

impl WorkerSet {
    /// Wait for every worker loop to exit, surfacing the first failure.
    pub async fn join(self) -> Result<()> {
        for task in self.tasks {
            task.await
                .map_err(|e| PipelineError::Enqueue(format!("worker task panicked: {e}")))??;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reconpipe_browser::StaticEngine;

    fn test_config() -> PipelineConfig {
        let db_path = std::env::temp_dir().join(format!(
            "rp_pipeline_test_{}_{}.db",
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .expect("clock")
                .as_nanos()
        ));
        PipelineConfig {
            db_path,
            stages: StagesConfig::default(),
            scrape: ScrapeConfig::from(&AppConfig::default()),
            discovery_base_url: "http://127.0.0.1:1".into(),
            discovery_api_key: "test-key".into(),
            related_base_url: "http://127.0.0.1:1".into(),
            doh_base_url: "http://127.0.0.1:1".into(),
            openrouter_base_url: "http://127.0.0.1:1".into(),
            openrouter_api_key: "test-key".into(),
            model: "test/model".into(),
            converter_base_url: "http://127.0.0.1:1".into(),
            converter_timeout: Duration::from_secs(5),
        }
    }

    #[tokio::test]
    async fn build_seeds_default_prompt() {
        let engine = Arc::new(StaticEngine::new().unwrap());
        let pipeline = Pipeline::build(test_config(), engine).await.unwrap();

        let prompt = pipeline
            .storage()
            .get_prompt("it-notification")
            .await
            .unwrap();
        assert!(prompt.is_some());
    }

    #[tokio::test]
    async fn workers_stop_on_shutdown() {
        let engine = Arc::new(StaticEngine::new().unwrap());
        let pipeline = Pipeline::build(test_config(), engine).await.unwrap();

        let (shutdown_tx, _) = broadcast::channel(1);
        let workers = pipeline.spawn_workers(&shutdown_tx);

        shutdown_tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(5), workers.join())
            .await
            .expect("workers should stop promptly")
            .unwrap();
    }

    #[tokio::test]
    async fn drain_returns_when_queues_are_empty() {
        let engine = Arc::new(StaticEngine::new().unwrap());
        let pipeline = Pipeline::build(test_config(), engine).await.unwrap();

        tokio::time::timeout(Duration::from_secs(2), pipeline.drain())
            .await
            .expect("empty queues drain immediately")
            .unwrap();
    }

    struct ClosableEngine {
        closed: Arc<std::sync::atomic::AtomicBool>,
    }

    #[async_trait::async_trait]
    impl BrowserEngine for ClosableEngine {
        async fn open_page(&self) -> Result<Box<dyn reconpipe_browser::BrowserPage>> {
            Err(PipelineError::Navigation("no pages in this test".into()))
        }

        async fn shutdown(&self) -> Result<()> {
            self.closed.store(true, std::sync::atomic::Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn shutdown_tears_down_the_engine() {
        let closed = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let engine = Arc::new(ClosableEngine {
            closed: closed.clone(),
        });
        let pipeline = Pipeline::build(test_config(), engine).await.unwrap();

        pipeline.shutdown().await;
        assert!(closed.load(std::sync::atomic::Ordering::SeqCst));
    }
}
