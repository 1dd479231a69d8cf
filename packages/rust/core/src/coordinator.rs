//! Pipeline coordinator.
//!
//! Entry points for the two request classes: relate a domain to its sibling
//! domains, and run full recon for a domain. Both are safe to re-run: every
//! write is a conflict-tolerant upsert and every enqueue is deduplicated by
//! the stage queue.

use std::sync::Arc;

use tracing::{debug, info, instrument, warn};

use reconpipe_clients::contacts::ContactsClient;
use reconpipe_clients::related::RelatedClient;
use reconpipe_events::{EventBus, PipelineEvent};
use reconpipe_queue::{Stage, StageQueue};
use reconpipe_shared::{
    DnsJob, PipelineError, PretextJob, ProfileJob, Result, ScrapeJob, SourceStatus, TargetStatus,
};
use reconpipe_storage::Storage;

/// Outcome of a domain-relation discovery.
#[derive(Debug, Clone)]
pub struct DiscoveryOutcome {
    pub primary_domain: String,
    pub related_domains: Vec<String>,
}

/// Outcome of a full recon run's discovery and enqueue phase.
#[derive(Debug, Clone)]
pub struct ReconSummary {
    pub domain: String,
    pub targets_count: usize,
    pub sources_enqueued: usize,
}

/// Coordinates discovery calls, entity upserts, and stage enqueues.
pub struct Coordinator {
    storage: Arc<Storage>,
    queue: StageQueue,
    events: EventBus,
    contacts: ContactsClient,
    related: RelatedClient,
}

impl Coordinator {
    pub fn new(
        storage: Arc<Storage>,
        queue: StageQueue,
        events: EventBus,
        contacts: ContactsClient,
        related: RelatedClient,
    ) -> Self {
        Self {
            storage,
            queue,
            events,
            contacts,
            related,
        }
    }

    /// Discover domains related to `domain`, upsert all of them, and enqueue
    /// each onto the DNS stage.
    #[instrument(skip_all, fields(domain = %domain))]
    pub async fn discover_domains(&self, domain: &str) -> Result<DiscoveryOutcome> {
        self.storage.upsert_domain(domain).await?;

        let relation = self.related.lookup(domain).await?;
        for related in &relation.domains {
            self.storage.upsert_domain(related).await?;
        }

        if !relation.domains.is_empty() {
            self.events.emit(PipelineEvent::RelatedDomainsFound {
                primary_domain: domain.to_string(),
                related_domains: relation.domains.clone(),
            });
        }

        for name in std::iter::once(domain).chain(relation.domains.iter().map(String::as_str)) {
            self.queue
                .enqueue(Stage::Dns, name, &DnsJob { domain: name.to_string() })
                .await?;
        }

        info!(related = relation.domains.len(), "domain discovery complete");
        Ok(DiscoveryOutcome {
            primary_domain: domain.to_string(),
            related_domains: relation.domains,
        })
    }

    /// Run full recon for `domain`: contact discovery, entity upserts, and
    /// scrape enqueues for every source not yet terminal.
    #[instrument(skip_all, fields(domain = %domain))]
    pub async fn run_recon(&self, domain: &str) -> Result<ReconSummary> {
        self.storage.upsert_domain(domain).await?;
        self.queue
            .enqueue(Stage::Dns, domain, &DnsJob { domain: domain.to_string() })
            .await?;

        let search = self.contacts.domain_search(domain).await?;
        if let Some(pattern) = &search.pattern {
            self.storage.set_domain_email_format(domain, pattern).await?;
            self.events.emit(PipelineEvent::DomainUpdated {
                domain: domain.to_string(),
            });
        }

        let mut sources_enqueued = 0usize;
        for contact in &search.emails {
            self.storage
                .upsert_target(
                    &contact.value,
                    contact.full_name().as_deref(),
                    domain,
                    contact.earliest_seen(),
                )
                .await?;

            for source in &contact.sources {
                self.storage.upsert_source_domain(&source.domain).await?;
                let (source_id, status) = self
                    .storage
                    .upsert_source(&source.uri, &source.domain, Some("discovery"))
                    .await?;
                self.storage
                    .link_target_source(&contact.value, source_id)
                    .await?;

                // terminal sources keep their result; only pending work is queued
                if status == SourceStatus::Pending {
                    let enqueued = self
                        .queue
                        .enqueue(
                            Stage::Scrape,
                            &source.uri,
                            &ScrapeJob {
                                source_id,
                                source_url: source.uri.clone(),
                                source_domain: source.domain.clone(),
                            },
                        )
                        .await?;
                    if enqueued.is_some() {
                        sources_enqueued += 1;
                    }
                } else {
                    debug!(source_id, %status, "source already terminal, not enqueued");
                }
            }

            self.events.emit(PipelineEvent::ReconUpdate {
                message: format!("discovered {}", contact.value),
            });
        }

        let summary = ReconSummary {
            domain: domain.to_string(),
            targets_count: search.emails.len(),
            sources_enqueued,
        };
        self.events.emit(PipelineEvent::ReconComplete {
            domain: summary.domain.clone(),
            targets_count: summary.targets_count,
        });
        info!(
            targets = summary.targets_count,
            enqueued = summary.sources_enqueued,
            "recon discovery complete"
        );
        Ok(summary)
    }

    /// Queue profile synthesis for an enriched target.
    pub async fn enqueue_profile(&self, target_email: &str) -> Result<()> {
        let target = self
            .storage
            .get_target(target_email)
            .await?
            .ok_or_else(|| PipelineError::validation(format!("unknown target {target_email}")))?;
        if target.status != TargetStatus::Enriched {
            return Err(PipelineError::validation(format!(
                "target {target_email} is {}, profile synthesis needs enriched",
                target.status
            )));
        }
        self.queue
            .enqueue(
                Stage::Profile,
                target_email,
                &ProfileJob {
                    target_email: target_email.to_string(),
                },
            )
            .await?;
        Ok(())
    }

    /// Queue pretext drafting for a target that already has a profile.
    pub async fn enqueue_pretext(&self, target_email: &str, prompt_name: &str) -> Result<()> {
        let target = self
            .storage
            .get_target(target_email)
            .await?
            .ok_or_else(|| PipelineError::validation(format!("unknown target {target_email}")))?;
        if target.profile.is_none() {
            return Err(PipelineError::validation(format!(
                "target {target_email} has no profile yet"
            )));
        }
        if self.storage.get_prompt(prompt_name).await?.is_none() {
            return Err(PipelineError::validation(format!(
                "unknown prompt {prompt_name:?}"
            )));
        }
        self.queue
            .enqueue(
                Stage::Pretext,
                &format!("{target_email}:{prompt_name}"),
                &PretextJob {
                    target_email: target_email.to_string(),
                    prompt_name: prompt_name.to_string(),
                },
            )
            .await?;
        Ok(())
    }

    /// Reset a terminal source and queue it for scraping again.
    pub async fn rescrape_source(&self, url: &str) -> Result<()> {
        let source = self
            .storage
            .get_source_by_url(url)
            .await?
            .ok_or_else(|| PipelineError::validation(format!("unknown source {url}")))?;

        if !self.storage.reset_source(source.id).await? {
            warn!(source_id = source.id, status = %source.status, "source not terminal, nothing reset");
        }
        self.queue
            .enqueue(
                Stage::Scrape,
                url,
                &ScrapeJob {
                    source_id: source.id,
                    source_url: url.to_string(),
                    source_domain: source.source_domain_name.clone(),
                },
            )
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const SEARCH_FIXTURE: &str = r#"{
        "data": {
            "domain": "acme.test",
            "pattern": "{first}.{last}",
            "organization": "Acme Corp",
            "emails": [
                {
                    "value": "jane.doe@acme.test",
                    "first_name": "Jane",
                    "last_name": "Doe",
                    "position": "CFO",
                    "sources": [
                        {"domain": "linkedin.com", "uri": "https://linkedin.com/in/janedoe",
                         "extracted_on": "2021-03-04", "last_seen_on": "2024-01-11"},
                        {"domain": "acme.test", "uri": "https://acme.test/team",
                         "extracted_on": "2019-07-20", "last_seen_on": "2023-12-01"}
                    ]
                },
                {
                    "value": "sam.lee@acme.test",
                    "first_name": "Sam",
                    "last_name": "Lee",
                    "position": null,
                    "sources": []
                }
            ]
        }
    }"#;

    async fn coordinator_against(server: &MockServer) -> (Coordinator, Arc<Storage>, EventBus) {
        let tmp = std::env::temp_dir().join(format!(
            "rp_coord_test_{}_{}.db",
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .expect("clock")
                .as_nanos()
        ));
        let storage = Arc::new(Storage::open(&tmp).await.expect("open test db"));
        let queue = StageQueue::new(storage.clone());
        let events = EventBus::new();
        let coordinator = Coordinator::new(
            storage.clone(),
            queue,
            events.clone(),
            ContactsClient::new(&server.uri(), "k".into()).unwrap(),
            RelatedClient::new(&server.uri()).unwrap(),
        );
        (coordinator, storage, events)
    }

    #[tokio::test]
    async fn recon_is_idempotent_across_repeated_runs() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v2/domain-search"))
            .respond_with(ResponseTemplate::new(200).set_body_string(SEARCH_FIXTURE))
            .mount(&server)
            .await;

        let (coordinator, storage, _events) = coordinator_against(&server).await;

        let first = coordinator.run_recon("acme.test").await.unwrap();
        assert_eq!(first.targets_count, 2);
        assert_eq!(first.sources_enqueued, 2);

        // identical upstream data, run again: no duplicates, no new jobs
        let second = coordinator.run_recon("acme.test").await.unwrap();
        assert_eq!(second.targets_count, 2);
        assert_eq!(second.sources_enqueued, 0);

        let targets = storage.list_targets_by_domain("acme.test").await.unwrap();
        assert_eq!(targets.len(), 2);

        let jane = storage.get_target("jane.doe@acme.test").await.unwrap().unwrap();
        assert_eq!(jane.name.as_deref(), Some("Jane Doe"));
        // earliest of the two source first-seen dates
        assert_eq!(
            jane.tenure_start.unwrap().date_naive().to_string(),
            "2019-07-20"
        );
        let (total, pending) = storage
            .source_counts_for_target("jane.doe@acme.test")
            .await
            .unwrap();
        assert_eq!((total, pending), (2, 2));

        let domain = storage.get_domain("acme.test").await.unwrap().unwrap();
        assert_eq!(domain.email_format.as_deref(), Some("{first}.{last}"));
    }

    #[tokio::test]
    async fn discover_domains_upserts_and_queues_dns() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/related"))
            .and(query_param("domain", "acme.test"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                r#"{"application":"outlook","domains":["acme-labs.test"]}"#,
            ))
            .mount(&server)
            .await;

        let (coordinator, storage, events) = coordinator_against(&server).await;
        let mut rx = events.subscribe();

        let outcome = coordinator.discover_domains("acme.test").await.unwrap();
        assert_eq!(outcome.related_domains, vec!["acme-labs.test"]);

        assert!(storage.get_domain("acme.test").await.unwrap().is_some());
        assert!(storage.get_domain("acme-labs.test").await.unwrap().is_some());
        assert_eq!(storage.count_jobs("dns", "queued").await.unwrap(), 2);

        assert!(matches!(
            rx.recv().await.unwrap(),
            PipelineEvent::RelatedDomainsFound { .. }
        ));
    }

    #[tokio::test]
    async fn profile_enqueue_requires_an_enriched_target() {
        let server = MockServer::start().await;
        let (coordinator, storage, _events) = coordinator_against(&server).await;

        storage.upsert_domain("acme.test").await.unwrap();
        storage
            .upsert_target("jane.doe@acme.test", None, "acme.test", None)
            .await
            .unwrap();

        let err = coordinator.enqueue_profile("jane.doe@acme.test").await.unwrap_err();
        assert!(err.to_string().contains("needs enriched"));

        storage.mark_target_enriched("jane.doe@acme.test").await.unwrap();
        coordinator.enqueue_profile("jane.doe@acme.test").await.unwrap();
        assert_eq!(storage.count_jobs("profile", "queued").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn rescrape_resets_and_requeues_a_terminal_source() {
        let server = MockServer::start().await;
        let (coordinator, storage, _events) = coordinator_against(&server).await;

        storage.upsert_source_domain("a.example").await.unwrap();
        let (sid, _) = storage
            .upsert_source("https://a.example/p", "a.example", None)
            .await
            .unwrap();
        storage.mark_source_failed(sid, "timed out").await.unwrap();

        coordinator.rescrape_source("https://a.example/p").await.unwrap();

        let source = storage.get_source(sid).await.unwrap().unwrap();
        assert_eq!(source.status, SourceStatus::Pending);
        assert_eq!(storage.count_jobs("scrape", "queued").await.unwrap(), 1);
    }
}
