//! Typed, fire-and-forget event bus for pipeline progress.
//!
//! Stage handlers and the coordinator publish [`PipelineEvent`]s; observers
//! (the CLI progress printer, tests) subscribe. Publishing never blocks and
//! never fails: with no subscribers the event is simply dropped, and a slow
//! subscriber lags rather than back-pressuring the pipeline.

use reconpipe_shared::{SourceStatus, TargetStatus};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

const CHANNEL_CAPACITY: usize = 256;

/// Progress event emitted by the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum PipelineEvent {
    /// A source changed state (pending/processing).
    #[serde(rename_all = "camelCase")]
    SourceUpdate {
        source_id: i64,
        status: SourceStatus,
        message: Option<String>,
    },
    /// A source reached terminal `mined`; one event per mapped target.
    #[serde(rename_all = "camelCase")]
    SourceMined {
        source_id: i64,
        target_email: String,
        status: SourceStatus,
    },
    /// A source reached terminal `failed`; one event per mapped target.
    #[serde(rename_all = "camelCase")]
    SourceFailed {
        source_id: i64,
        target_email: String,
        status: SourceStatus,
    },
    /// A target transitioned status (convergence, profile, re-open).
    #[serde(rename_all = "camelCase")]
    TargetStatusUpdated {
        email: String,
        status: TargetStatus,
        message: Option<String>,
    },
    /// A domain's DNS posture or email format was written.
    #[serde(rename_all = "camelCase")]
    DomainUpdated { domain: String },
    /// Domains related to a primary domain were discovered.
    #[serde(rename_all = "camelCase")]
    RelatedDomainsFound {
        primary_domain: String,
        related_domains: Vec<String>,
    },
    /// Free-form progress line for a running recon.
    #[serde(rename_all = "camelCase")]
    ReconUpdate { message: String },
    /// A full recon run finished its discovery and enqueue phase.
    #[serde(rename_all = "camelCase")]
    ReconComplete { domain: String, targets_count: usize },
}

impl PipelineEvent {
    /// Wire name of the event, as serialized in the `event` tag.
    pub fn name(&self) -> &'static str {
        match self {
            Self::SourceUpdate { .. } => "sourceUpdate",
            Self::SourceMined { .. } => "sourceMined",
            Self::SourceFailed { .. } => "sourceFailed",
            Self::TargetStatusUpdated { .. } => "targetStatusUpdated",
            Self::DomainUpdated { .. } => "domainUpdated",
            Self::RelatedDomainsFound { .. } => "relatedDomainsFound",
            Self::ReconUpdate { .. } => "reconUpdate",
            Self::ReconComplete { .. } => "reconComplete",
        }
    }
}

/// Broadcast bus carrying [`PipelineEvent`]s.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<PipelineEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { tx }
    }

    /// Publish an event. Send errors (no subscribers) are ignored.
    pub fn emit(&self, event: PipelineEvent) {
        tracing::debug!(event = event.name(), "emit");
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn emit_without_subscribers_is_ok() {
        let bus = EventBus::new();
        bus.emit(PipelineEvent::DomainUpdated {
            domain: "acme.test".into(),
        });
    }

    #[tokio::test]
    async fn subscribers_receive_published_events() {
        let bus = EventBus::new();
        let mut rx_a = bus.subscribe();
        let mut rx_b = bus.subscribe();

        bus.emit(PipelineEvent::SourceMined {
            source_id: 7,
            target_email: "jdoe@acme.test".into(),
            status: SourceStatus::Mined,
        });

        let got = rx_a.recv().await.unwrap();
        assert_eq!(got.name(), "sourceMined");
        assert_eq!(got, rx_b.recv().await.unwrap());
    }

    #[test]
    fn events_serialize_with_camel_case_tags() {
        let event = PipelineEvent::TargetStatusUpdated {
            email: "jdoe@acme.test".into(),
            status: TargetStatus::Enriched,
            message: None,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "targetStatusUpdated");
        assert_eq!(json["data"]["email"], "jdoe@acme.test");
        assert_eq!(json["data"]["status"], "enriched");

        let back: PipelineEvent = serde_json::from_value(json).unwrap();
        assert_eq!(back, event);
    }
}
