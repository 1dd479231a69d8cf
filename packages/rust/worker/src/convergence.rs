//! Status convergence engine.
//!
//! A target becomes `enriched` exactly when every source mapped to it has
//! reached a terminal state. Evaluation happens after every terminal source
//! write and must be safe under concurrent invocation from workers finishing
//! different sources of the same target: the transition itself is a
//! conditional write, so only one evaluation observes the flip and emits the
//! status event.

use reconpipe_events::{EventBus, PipelineEvent};
use reconpipe_shared::{Result, TargetStatus};
use reconpipe_storage::Storage;
use tracing::{debug, info};

/// Outcome of one convergence evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Convergence {
    /// The target has no mapped sources; it never converges on its own.
    NoMappedSources,
    /// Some sources are still pending or processing.
    Pending(i64),
    /// This evaluation performed the transition to `enriched`.
    Transitioned,
    /// A concurrent evaluation already transitioned the target.
    AlreadyEnriched,
}

/// Evaluate a target for convergence, transitioning and emitting
/// `targetStatusUpdated` when all mapped sources are terminal.
pub async fn evaluate_target(
    storage: &Storage,
    events: &EventBus,
    target_email: &str,
) -> Result<Convergence> {
    let (total, pending) = storage.source_counts_for_target(target_email).await?;

    if total == 0 {
        debug!(target_email, "no mapped sources, not converging");
        return Ok(Convergence::NoMappedSources);
    }
    if pending > 0 {
        debug!(target_email, pending, "sources still outstanding");
        return Ok(Convergence::Pending(pending));
    }

    if storage.mark_target_enriched(target_email).await? {
        info!(target_email, "target enriched");
        events.emit(PipelineEvent::TargetStatusUpdated {
            email: target_email.to_string(),
            status: TargetStatus::Enriched,
            message: Some(format!("all {total} sources terminal")),
        });
        Ok(Convergence::Transitioned)
    } else {
        Ok(Convergence::AlreadyEnriched)
    }
}
