//! DNS posture worker.
//!
//! Resolves MX, SPF, and DMARC for a queued domain and writes the result onto
//! the domain row. A domain with no mail posture at all is stored as such;
//! only resolver transport failures fail the job.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, instrument};

use reconpipe_clients::doh::DohClient;
use reconpipe_events::{EventBus, PipelineEvent};
use reconpipe_queue::{JobHandler, QueuedJob};
use reconpipe_shared::{DnsJob, PipelineError, Result};
use reconpipe_storage::Storage;

pub struct DnsHandler {
    storage: Arc<Storage>,
    doh: DohClient,
    events: EventBus,
}

impl DnsHandler {
    pub fn new(storage: Arc<Storage>, doh: DohClient, events: EventBus) -> Self {
        Self {
            storage,
            doh,
            events,
        }
    }

    #[instrument(skip_all, fields(domain = %job.domain))]
    async fn run(&self, job: DnsJob) -> Result<()> {
        let posture = self.doh.mail_posture(&job.domain).await?;
        self.storage
            .update_domain_dns(
                &job.domain,
                posture.mx.as_deref(),
                posture.spf.as_deref(),
                posture.dmarc.as_deref(),
            )
            .await?;

        info!(
            has_mx = posture.mx.is_some(),
            has_dmarc = posture.dmarc.is_some(),
            "domain posture stored"
        );
        self.events.emit(PipelineEvent::DomainUpdated {
            domain: job.domain,
        });
        Ok(())
    }
}

#[async_trait]
impl JobHandler for DnsHandler {
    async fn handle(&self, job: QueuedJob) -> Result<()> {
        let job: DnsJob = serde_json::from_value(job.payload)
            .map_err(|e| PipelineError::validation(format!("bad dns payload: {e}")))?;
        self.run(job).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn stores_posture_and_emits_domain_updated() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/resolve"))
            .and(query_param("type", "15"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                r#"{"Status":0,"Answer":[{"name":"acme.test.","type":15,"TTL":300,"data":"10 mail.acme.test."}]}"#,
            ))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/resolve"))
            .and(query_param("type", "16"))
            .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"Status":0}"#))
            .mount(&server)
            .await;

        let tmp = std::env::temp_dir().join(format!(
            "rp_dns_test_{}_{}.db",
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .expect("clock")
                .as_nanos()
        ));
        let storage = Arc::new(Storage::open(&tmp).await.unwrap());
        storage.upsert_domain("acme.test").await.unwrap();

        let events = EventBus::new();
        let mut rx = events.subscribe();
        let handler = DnsHandler::new(
            storage.clone(),
            DohClient::new(&server.uri()).unwrap(),
            events,
        );
        handler
            .handle(QueuedJob {
                id: 1,
                stage: "dns".into(),
                dedupe_key: "acme.test".into(),
                payload: serde_json::json!({"domain": "acme.test"}),
                attempts: 1,
            })
            .await
            .unwrap();

        let domain = storage.get_domain("acme.test").await.unwrap().unwrap();
        assert_eq!(domain.mx.as_deref(), Some("mail.acme.test"));
        assert!(domain.spf.is_none());

        assert!(matches!(
            rx.recv().await.unwrap(),
            PipelineEvent::DomainUpdated { .. }
        ));
    }
}
