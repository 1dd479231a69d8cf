//! Core domain types for the ReconPipe entity store and job payloads.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Status enums
// ---------------------------------------------------------------------------

/// Lifecycle of a discovered intelligence source.
///
/// `pending → processing → {mined|failed}` within a job's lifetime. Terminal
/// rows only go back to `pending` through an explicit re-scrape request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceStatus {
    Pending,
    Processing,
    Mined,
    Failed,
}

impl SourceStatus {
    /// Exhaustive transition table. Anything not listed is rejected.
    pub fn can_transition_to(self, next: SourceStatus) -> bool {
        use SourceStatus::*;
        matches!(
            (self, next),
            (Pending, Processing)
                | (Pending, Failed)
                | (Processing, Mined)
                | (Processing, Failed)
                // explicit re-scrape resets a terminal row
                | (Mined, Pending)
                | (Failed, Pending)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, SourceStatus::Mined | SourceStatus::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SourceStatus::Pending => "pending",
            SourceStatus::Processing => "processing",
            SourceStatus::Mined => "mined",
            SourceStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for SourceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SourceStatus {
    type Err = crate::PipelineError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "mined" => Ok(Self::Mined),
            "failed" => Ok(Self::Failed),
            other => Err(crate::PipelineError::validation(format!(
                "unknown source status: {other}"
            ))),
        }
    }
}

/// Lifecycle of a recon target. Convergence to `enriched` is derived from the
/// terminal states of every mapped source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetStatus {
    Pending,
    Enriched,
    Failed,
}

impl TargetStatus {
    pub fn can_transition_to(self, next: TargetStatus) -> bool {
        use TargetStatus::*;
        matches!(
            (self, next),
            (Pending, Enriched) | (Pending, Failed) | (Enriched, Pending) | (Failed, Pending)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TargetStatus::Pending => "pending",
            TargetStatus::Enriched => "enriched",
            TargetStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for TargetStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TargetStatus {
    type Err = crate::PipelineError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "enriched" => Ok(Self::Enriched),
            "failed" => Ok(Self::Failed),
            other => Err(crate::PipelineError::validation(format!(
                "unknown target status: {other}"
            ))),
        }
    }
}

/// Review lifecycle of a drafted pretext.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PretextStatus {
    Draft,
    Approved,
    Rejected,
}

impl PretextStatus {
    pub fn can_transition_to(self, next: PretextStatus) -> bool {
        use PretextStatus::*;
        matches!((self, next), (Draft, Approved) | (Draft, Rejected))
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PretextStatus::Draft => "draft",
            PretextStatus::Approved => "approved",
            PretextStatus::Rejected => "rejected",
        }
    }
}

impl std::fmt::Display for PretextStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for PretextStatus {
    type Err = crate::PipelineError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "draft" => Ok(Self::Draft),
            "approved" => Ok(Self::Approved),
            "rejected" => Ok(Self::Rejected),
            other => Err(crate::PipelineError::validation(format!(
                "unknown pretext status: {other}"
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// Entities
// ---------------------------------------------------------------------------

/// A primary domain under assessment, keyed by name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Domain {
    pub name: String,
    pub mx: Option<String>,
    pub spf: Option<String>,
    pub dmarc: Option<String>,
    /// Email address pattern reported by contact discovery, e.g. `{first}.{last}`.
    pub email_format: Option<String>,
}

/// A third-party domain that hosted at least one discovered source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceDomain {
    pub name: String,
    pub mx: Option<String>,
    pub spf: Option<String>,
    pub dmarc: Option<String>,
}

/// A contact being enriched, keyed by email.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Target {
    pub email: String,
    pub name: Option<String>,
    /// Synthesized profile text (profile stage output).
    pub profile: Option<String>,
    pub domain_name: String,
    /// Earliest first-seen timestamp across the target's discovery sources.
    pub tenure_start: Option<DateTime<Utc>>,
    pub status: TargetStatus,
}

/// A single discovered URL to scrape, keyed by id with a globally unique URL.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceData {
    pub id: i64,
    pub url: String,
    pub source_domain_name: String,
    pub discovery_method: Option<String>,
    /// Opaque mined payload (see [`MinedPayload`]); `None` until mined.
    pub data: Option<serde_json::Value>,
    pub status: SourceStatus,
    /// Human-readable diagnostic accompanying any terminal state.
    pub status_message: Option<String>,
}

/// Many-to-many join between targets and sources.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetSourceMap {
    pub id: i64,
    pub target_email: String,
    pub source_id: i64,
}

/// A named pretext prompt template with style guidance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Prompt {
    pub id: i64,
    pub name: String,
    pub template: String,
    pub dos: Option<String>,
    pub donts: Option<String>,
}

/// A drafted pretext email awaiting review.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pretext {
    pub id: i64,
    pub target_email: String,
    pub prompt_id: i64,
    pub prompt_text: String,
    pub subject: String,
    pub body: String,
    pub link: Option<String>,
    pub status: PretextStatus,
}

// ---------------------------------------------------------------------------
// Job payloads
// ---------------------------------------------------------------------------

/// Payload carried by scraping-stage jobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScrapeJob {
    pub source_id: i64,
    pub source_url: String,
    pub source_domain: String,
}

/// Payload carried by DNS-stage jobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DnsJob {
    pub domain: String,
}

/// Payload carried by profile-generation jobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileJob {
    pub target_email: String,
}

/// Payload carried by pretext-generation jobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PretextJob {
    pub target_email: String,
    pub prompt_name: String,
}

/// The opaque `SourceData.data` payload written by a successful scrape.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MinedPayload {
    pub scraped_at: DateTime<Utc>,
    pub title: Option<String>,
    /// The URL actually scraped.
    pub url: String,
    /// The originally discovered URL when substitution rewrote it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_url: Option<String>,
    pub content: String,
}
