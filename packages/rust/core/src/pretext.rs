//! Pretext drafting stage handler.
//!
//! Renders a named prompt template against a profiled target, sends it to the
//! chat-completion provider, and stores the result as a `draft` pretext for
//! human review. Drafts are never sent anywhere by the pipeline.

use std::sync::Arc;

use async_trait::async_trait;
use regex::Regex;
use tracing::{info, instrument};

use reconpipe_clients::llm::LlmClient;
use reconpipe_events::{EventBus, PipelineEvent};
use reconpipe_queue::{JobHandler, QueuedJob};
use reconpipe_shared::{PipelineError, PretextJob, Result, Target};
use reconpipe_storage::Storage;

const SYSTEM_PROMPT: &str = "You draft internal security-awareness exercise emails. \
Write a subject line first as `Subject: ...`, then a blank line, then the body. \
Stay within the supplied instructions.";

/// Name of the prompt seeded on first run.
pub const DEFAULT_PROMPT_NAME: &str = "it-notification";

const DEFAULT_PROMPT_TEMPLATE: &str = "Draft a short IT notification email to {{name}} \
({{email}}) of {{domain}}, informed by this profile:\n\n{{profile}}";

pub struct PretextHandler {
    storage: Arc<Storage>,
    llm: Arc<dyn LlmClient>,
    events: EventBus,
}

impl PretextHandler {
    pub fn new(storage: Arc<Storage>, llm: Arc<dyn LlmClient>, events: EventBus) -> Self {
        Self {
            storage,
            llm,
            events,
        }
    }

    #[instrument(skip_all, fields(target_email = %job.target_email, prompt = %job.prompt_name))]
    async fn run(&self, job: PretextJob) -> Result<()> {
        let target = self
            .storage
            .get_target(&job.target_email)
            .await?
            .ok_or_else(|| {
                PipelineError::validation(format!("unknown target {}", job.target_email))
            })?;
        let profile = target.profile.clone().ok_or_else(|| {
            PipelineError::validation(format!("target {} has no profile", target.email))
        })?;
        let prompt = self
            .storage
            .get_prompt(&job.prompt_name)
            .await?
            .ok_or_else(|| {
                PipelineError::validation(format!("unknown prompt {:?}", job.prompt_name))
            })?;

        let mut rendered = render_template(&prompt.template, &target, &profile);
        if let Some(dos) = &prompt.dos {
            rendered.push_str(&format!("\n\nDo: {dos}"));
        }
        if let Some(donts) = &prompt.donts {
            rendered.push_str(&format!("\nDon't: {donts}"));
        }

        let completion = self.llm.complete(SYSTEM_PROMPT, &rendered).await?;
        let (subject, body) = split_subject(&completion);
        let link = first_link(&body);

        let pretext_id = self
            .storage
            .insert_pretext(
                &target.email,
                prompt.id,
                &rendered,
                &subject,
                &body,
                link.as_deref(),
            )
            .await?;

        info!(pretext_id, "pretext drafted");
        self.events.emit(PipelineEvent::ReconUpdate {
            message: format!("pretext {pretext_id} drafted for {}", target.email),
        });
        Ok(())
    }
}

#[async_trait]
impl JobHandler for PretextHandler {
    async fn handle(&self, job: QueuedJob) -> Result<()> {
        let job: PretextJob = serde_json::from_value(job.payload)
            .map_err(|e| PipelineError::validation(format!("bad pretext payload: {e}")))?;
        self.run(job).await
    }
}

/// Seed the built-in prompt so first runs work without any setup.
pub async fn ensure_default_prompt(storage: &Storage) -> Result<()> {
    if storage.get_prompt(DEFAULT_PROMPT_NAME).await?.is_none() {
        storage
            .upsert_prompt(
                DEFAULT_PROMPT_NAME,
                DEFAULT_PROMPT_TEMPLATE,
                Some("keep it under 120 words; reference one concrete detail from the profile"),
                Some("no urgency language; no attachments"),
            )
            .await?;
    }
    Ok(())
}

fn render_template(template: &str, target: &Target, profile: &str) -> String {
    template
        .replace("{{name}}", target.name.as_deref().unwrap_or("the contact"))
        .replace("{{email}}", &target.email)
        .replace("{{domain}}", &target.domain_name)
        .replace("{{profile}}", profile)
}

/// Split a `Subject: ...` first line off the completion; without one the
/// whole text becomes the body under a generic subject.
fn split_subject(completion: &str) -> (String, String) {
    let trimmed = completion.trim();
    if let Some(rest) = trimmed.strip_prefix("Subject:") {
        let mut lines = rest.splitn(2, '\n');
        let subject = lines.next().unwrap_or_default().trim().to_string();
        let body = lines.next().unwrap_or_default().trim().to_string();
        if !subject.is_empty() {
            return (subject, body);
        }
    }
    ("(no subject)".to_string(), trimmed.to_string())
}

fn first_link(body: &str) -> Option<String> {
    // static pattern, compiled per call; pretext volume is tiny
    let re = Regex::new(r"https?://[^\s<>\)]+").ok()?;
    re.find(body).map(|m| m.as_str().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    struct CannedLlm(String);

    #[async_trait]
    impl LlmClient for CannedLlm {
        async fn complete(&self, _system: &str, _user: &str) -> Result<String> {
            Ok(self.0.clone())
        }
    }

    async fn seeded_storage() -> Arc<Storage> {
        let tmp = std::env::temp_dir().join(format!(
            "rp_pretext_test_{}_{}.db",
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .expect("clock")
                .as_nanos()
        ));
        let storage = Arc::new(Storage::open(&tmp).await.expect("open test db"));
        storage.upsert_domain("acme.test").await.unwrap();
        storage
            .upsert_target("jane@acme.test", Some("Jane Doe"), "acme.test", None)
            .await
            .unwrap();
        storage
            .set_target_profile("jane@acme.test", "Jane is CFO at Acme.")
            .await
            .unwrap();
        ensure_default_prompt(&storage).await.unwrap();
        storage
    }

    fn pretext_job(email: &str) -> QueuedJob {
        QueuedJob {
            id: 1,
            stage: "pretext".into(),
            dedupe_key: email.into(),
            payload: serde_json::json!({
                "targetEmail": email,
                "promptName": DEFAULT_PROMPT_NAME,
            }),
            attempts: 1,
        }
    }

    #[tokio::test]
    async fn drafts_a_pretext_with_subject_body_and_link() {
        let storage = seeded_storage().await;
        let handler = PretextHandler::new(
            storage.clone(),
            Arc::new(CannedLlm(
                "Subject: Quarterly access review\n\nHi Jane,\n\nPlease confirm at https://intranet.acme.test/review today.".into(),
            )),
            EventBus::new(),
        );
        handler.handle(pretext_job("jane@acme.test")).await.unwrap();

        let pretexts = storage.list_pretexts_for_target("jane@acme.test").await.unwrap();
        assert_eq!(pretexts.len(), 1);
        assert_eq!(pretexts[0].subject, "Quarterly access review");
        assert!(pretexts[0].body.starts_with("Hi Jane,"));
        assert_eq!(
            pretexts[0].link.as_deref(),
            Some("https://intranet.acme.test/review")
        );
        // rendered prompt retained for audit
        assert!(pretexts[0].prompt_text.contains("Jane is CFO at Acme."));
    }

    #[tokio::test]
    async fn completion_without_subject_line_still_stores() {
        let storage = seeded_storage().await;
        let handler = PretextHandler::new(
            storage.clone(),
            Arc::new(CannedLlm("Just a body without a subject.".into())),
            EventBus::new(),
        );
        handler.handle(pretext_job("jane@acme.test")).await.unwrap();

        let pretexts = storage.list_pretexts_for_target("jane@acme.test").await.unwrap();
        assert_eq!(pretexts[0].subject, "(no subject)");
        assert!(pretexts[0].link.is_none());
    }

    #[tokio::test]
    async fn profile_is_required() {
        let storage = seeded_storage().await;
        storage.upsert_domain("acme.test").await.unwrap();
        storage
            .upsert_target("sam@acme.test", None, "acme.test", None)
            .await
            .unwrap();

        let handler = PretextHandler::new(
            storage,
            Arc::new(CannedLlm(String::new())),
            EventBus::new(),
        );
        let err = handler.handle(pretext_job("sam@acme.test")).await.unwrap_err();
        assert!(err.to_string().contains("no profile"));
    }

    #[test]
    fn template_rendering_substitutes_all_fields() {
        let target = Target {
            email: "jane@acme.test".into(),
            name: Some("Jane Doe".into()),
            profile: None,
            domain_name: "acme.test".into(),
            tenure_start: None,
            status: reconpipe_shared::TargetStatus::Enriched,
        };
        let rendered = render_template("{{name}} <{{email}}> @ {{domain}}: {{profile}}", &target, "P");
        assert_eq!(rendered, "Jane Doe <jane@acme.test> @ acme.test: P");
    }
}
