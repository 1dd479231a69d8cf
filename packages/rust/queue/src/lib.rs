//! Durable, deduplicating stage queues.
//!
//! Every pipeline stage (dns, scrape, profile, pretext) drains its own queue
//! backed by the storage job table, so queued work survives restarts and a
//! logically identical unfinished job is never enqueued twice. Delivery is
//! at-least-once: handlers must be idempotent.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reconpipe_shared::{PipelineError, Result};
use reconpipe_storage::Storage;
use serde::Serialize;
use tokio::sync::{Semaphore, broadcast};
use tracing::{debug, warn};

pub use reconpipe_storage::QueuedJob;

const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Pipeline stage a job belongs to. Each stage has its own queue and
/// concurrency limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Dns,
    Scrape,
    Profile,
    Pretext,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Dns => "dns",
            Stage::Scrape => "scrape",
            Stage::Profile => "profile",
            Stage::Pretext => "pretext",
        }
    }

    pub const ALL: [Stage; 4] = [Stage::Dns, Stage::Scrape, Stage::Profile, Stage::Pretext];
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Handler invoked for each claimed job of a stage.
#[async_trait]
pub trait JobHandler: Send + Sync + 'static {
    async fn handle(&self, job: QueuedJob) -> Result<()>;
}

/// Handle to a durable multi-stage queue.
#[derive(Clone)]
pub struct StageQueue {
    storage: Arc<Storage>,
}

impl StageQueue {
    pub fn new(storage: Arc<Storage>) -> Self {
        Self { storage }
    }

    /// Enqueue a job. Returns the job id, or `None` when an unfinished job
    /// with the same stage and dedupe key already exists.
    pub async fn enqueue<T: Serialize>(
        &self,
        stage: Stage,
        dedupe_key: &str,
        payload: &T,
    ) -> Result<Option<i64>> {
        let payload =
            serde_json::to_value(payload).map_err(|e| PipelineError::Enqueue(e.to_string()))?;
        let id = self
            .storage
            .enqueue_job(stage.as_str(), dedupe_key, &payload)
            .await?;
        match id {
            Some(id) => debug!(%stage, dedupe_key, id, "job enqueued"),
            None => debug!(%stage, dedupe_key, "duplicate live job suppressed"),
        }
        Ok(id)
    }

    /// Jobs currently queued or active for a stage.
    pub async fn live_count(&self, stage: Stage) -> Result<i64> {
        let queued = self.storage.count_jobs(stage.as_str(), "queued").await?;
        let active = self.storage.count_jobs(stage.as_str(), "active").await?;
        Ok(queued + active)
    }

    /// Drain a stage's queue until `shutdown` fires, running at most
    /// `concurrency` handlers at once.
    ///
    /// Handler success marks the job done; handler error marks it failed with
    /// the error message. Either way the dedupe key is freed. Returns only
    /// after in-flight handlers finish.
    pub async fn process(
        &self,
        stage: Stage,
        concurrency: usize,
        mut shutdown: broadcast::Receiver<()>,
        handler: Arc<dyn JobHandler>,
    ) -> Result<()> {
        let semaphore = Arc::new(Semaphore::new(concurrency));

        loop {
            let permit = tokio::select! {
                permit = semaphore.clone().acquire_owned() => {
                    permit.map_err(|e| PipelineError::Enqueue(e.to_string()))?
                }
                _ = shutdown.recv() => break,
            };

            match self.storage.claim_job(stage.as_str()).await? {
                Some(job) => {
                    let storage = self.storage.clone();
                    let handler = handler.clone();
                    tokio::spawn(async move {
                        let _permit = permit;
                        let job_id = job.id;
                        match handler.handle(job).await {
                            Ok(()) => {
                                if let Err(e) = storage.complete_job(job_id).await {
                                    warn!(job_id, error = %e, "failed to mark job done");
                                }
                            }
                            Err(e) => {
                                warn!(job_id, %stage, error = %e, "job handler failed");
                                if let Err(e) = storage.fail_job(job_id, &e.to_string()).await {
                                    warn!(job_id, error = %e, "failed to mark job failed");
                                }
                            }
                        }
                    });
                }
                None => {
                    drop(permit);
                    tokio::select! {
                        _ = tokio::time::sleep(POLL_INTERVAL) => {}
                        _ = shutdown.recv() => break,
                    }
                }
            }
        }

        // Wait for in-flight handlers before returning.
        let _ = semaphore.acquire_many(concurrency as u32).await;
        debug!(%stage, "queue worker stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    async fn test_queue() -> StageQueue {
        let tmp = std::env::temp_dir().join(format!(
            "rp_queue_test_{}_{}.db",
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .expect("clock")
                .as_nanos()
        ));
        StageQueue::new(Arc::new(Storage::open(&tmp).await.expect("open test db")))
    }

    struct CountingHandler {
        current: AtomicUsize,
        max_seen: AtomicUsize,
        handled: AtomicUsize,
    }

    #[async_trait]
    impl JobHandler for CountingHandler {
        async fn handle(&self, _job: QueuedJob) -> Result<()> {
            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_seen.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(30)).await;
            self.current.fetch_sub(1, Ordering::SeqCst);
            self.handled.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct FailingHandler;

    #[async_trait]
    impl JobHandler for FailingHandler {
        async fn handle(&self, _job: QueuedJob) -> Result<()> {
            Err(PipelineError::Network("connection refused".into()))
        }
    }

    #[tokio::test]
    async fn concurrency_stays_within_limit() {
        let queue = test_queue().await;
        for n in 0..8 {
            queue
                .enqueue(Stage::Scrape, &format!("u{n}"), &serde_json::json!({"n": n}))
                .await
                .unwrap();
        }

        let handler = Arc::new(CountingHandler {
            current: AtomicUsize::new(0),
            max_seen: AtomicUsize::new(0),
            handled: AtomicUsize::new(0),
        });
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

        let worker = {
            let queue = queue.clone();
            let handler = handler.clone();
            tokio::spawn(async move { queue.process(Stage::Scrape, 3, shutdown_rx, handler).await })
        };

        // Wait for the queue to drain.
        for _ in 0..100 {
            if handler.handled.load(Ordering::SeqCst) == 8 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        shutdown_tx.send(()).unwrap();
        worker.await.unwrap().unwrap();

        assert_eq!(handler.handled.load(Ordering::SeqCst), 8);
        assert!(handler.max_seen.load(Ordering::SeqCst) <= 3);
        assert_eq!(queue.live_count(Stage::Scrape).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn handler_error_marks_job_failed() {
        let queue = test_queue().await;
        let id = queue
            .enqueue(Stage::Dns, "acme.test", &serde_json::json!({"domain": "acme.test"}))
            .await
            .unwrap()
            .unwrap();

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let worker = {
            let queue = queue.clone();
            tokio::spawn(async move {
                queue
                    .process(Stage::Dns, 1, shutdown_rx, Arc::new(FailingHandler))
                    .await
            })
        };

        for _ in 0..100 {
            if queue.storage.count_jobs("dns", "failed").await.unwrap() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        shutdown_tx.send(()).unwrap();
        worker.await.unwrap().unwrap();

        let (state, error) = queue.storage.get_job_state(id).await.unwrap().unwrap();
        assert_eq!(state, "failed");
        assert_eq!(error.as_deref(), Some("network error: connection refused"));
    }

    #[tokio::test]
    async fn enqueue_dedupes_live_jobs_across_typed_payloads() {
        let queue = test_queue().await;
        let first = queue
            .enqueue(Stage::Scrape, "https://a.example/p", &serde_json::json!({"v": 1}))
            .await
            .unwrap();
        let second = queue
            .enqueue(Stage::Scrape, "https://a.example/p", &serde_json::json!({"v": 2}))
            .await
            .unwrap();
        assert!(first.is_some());
        assert!(second.is_none());

        // same key on a different stage is a different queue
        let other_stage = queue
            .enqueue(Stage::Dns, "https://a.example/p", &serde_json::json!({}))
            .await
            .unwrap();
        assert!(other_stage.is_some());
    }
}
