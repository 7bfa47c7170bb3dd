use std::time::Duration;

use uuid::Uuid;

use super::error::PipelineResult;
use super::orchestrator::stale_cutoff;
use crate::db::VideoStore;
use crate::queue::{JobEnvelope, JobQueue};

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    /// Videos moved back to `pending` and re-enqueued.
    pub reset: Vec<Uuid>,
}

/// Resets `processing` videos whose heartbeat is older than `stale_after`
/// and enqueues a fresh encoding job for each.
pub async fn sweep_stuck(
    store: &dyn VideoStore,
    queue: &dyn JobQueue,
    stale_after: Duration,
) -> PipelineResult<SweepReport> {
    let cutoff = stale_cutoff(stale_after);
    let note = format!(
        "no progress for {}s, reset by stuck-video sweep",
        stale_after.as_secs()
    );
    let mut report = SweepReport::default();

    for video in store.find_stuck(cutoff).await? {
        // A worker may have resumed it since the scan.
        if !store.reset_stuck(video.id, cutoff, &note).await? {
            continue;
        }
        log::info!("transition=processing->pending video_id={}", video.id);
        queue.enqueue(JobEnvelope::encode(video.id)).await?;
        report.reset.push(video.id);
    }

    if !report.reset.is_empty() {
        log::warn!("requeued {} stuck video(s)", report.reset.len());
    }
    Ok(report)
}
