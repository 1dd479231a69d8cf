//! Profile synthesis stage handler.
//!
//! Collapses every mined source payload for an enriched target into one
//! narrative profile via the chat-completion provider and stores it on the
//! target row.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, instrument};

use reconpipe_clients::llm::LlmClient;
use reconpipe_events::{EventBus, PipelineEvent};
use reconpipe_queue::{JobHandler, QueuedJob};
use reconpipe_shared::{PipelineError, ProfileJob, Result};
use reconpipe_storage::Storage;

const SYSTEM_PROMPT: &str = "You are an analyst writing a factual professional profile. \
Use only the supplied source material. Note employer, role, tenure, interests, and \
communication style. Do not speculate beyond the sources.";

/// Per-source character budget for the completion context.
const MAX_SOURCE_CHARS: usize = 8_000;

pub struct ProfileHandler {
    storage: Arc<Storage>,
    llm: Arc<dyn LlmClient>,
    events: EventBus,
}

impl ProfileHandler {
    pub fn new(storage: Arc<Storage>, llm: Arc<dyn LlmClient>, events: EventBus) -> Self {
        Self {
            storage,
            llm,
            events,
        }
    }

    #[instrument(skip_all, fields(target_email = %job.target_email))]
    async fn run(&self, job: ProfileJob) -> Result<()> {
        let target = self
            .storage
            .get_target(&job.target_email)
            .await?
            .ok_or_else(|| {
                PipelineError::validation(format!("unknown target {}", job.target_email))
            })?;

        let payloads = self.storage.mined_payloads_for_target(&target.email).await?;
        if payloads.is_empty() {
            return Err(PipelineError::validation(format!(
                "no mined sources for {}, nothing to synthesize",
                target.email
            )));
        }

        let user_prompt = build_user_prompt(&target.email, target.name.as_deref(), &payloads);
        let profile = self.llm.complete(SYSTEM_PROMPT, &user_prompt).await?;
        self.storage.set_target_profile(&target.email, &profile).await?;

        info!(sources = payloads.len(), "profile synthesized");
        self.events.emit(PipelineEvent::ReconUpdate {
            message: format!("profile synthesized for {}", target.email),
        });
        Ok(())
    }
}

#[async_trait]
impl JobHandler for ProfileHandler {
    async fn handle(&self, job: QueuedJob) -> Result<()> {
        let job: ProfileJob = serde_json::from_value(job.payload)
            .map_err(|e| PipelineError::validation(format!("bad profile payload: {e}")))?;
        self.run(job).await
    }
}

fn build_user_prompt(email: &str, name: Option<&str>, payloads: &[serde_json::Value]) -> String {
    let mut prompt = format!(
        "Write a profile of {} ({email}).\n",
        name.unwrap_or("the contact")
    );
    for (n, payload) in payloads.iter().enumerate() {
        let url = payload["url"].as_str().unwrap_or("unknown");
        let content = payload["content"].as_str().unwrap_or("");
        prompt.push_str(&format!(
            "\n--- Source {} ({url}) ---\n{}\n",
            n + 1,
            truncate(content, MAX_SOURCE_CHARS)
        ));
    }
    prompt
}

fn truncate(content: &str, max_chars: usize) -> &str {
    match content.char_indices().nth(max_chars) {
        Some((idx, _)) => &content[..idx],
        None => content,
    }
}
