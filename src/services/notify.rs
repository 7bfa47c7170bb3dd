use async_trait::async_trait;
use thiserror::Error;

use crate::db::models::Video;

#[derive(Debug, Error)]
#[error("notification failed: {0}")]
pub struct NotifyError(pub String);

/// Told about a video once it reached a terminal state.
///
/// Called after the state change is persisted. Errors are logged and never
/// change the outcome of the job.
#[async_trait]
pub trait VideoNotifier: Send + Sync {
    async fn video_ready(&self, video: &Video) -> Result<(), NotifyError>;

    async fn video_failed(&self, video: &Video) -> Result<(), NotifyError>;
}

/// Writes terminal outcomes to the log for whoever tails it.
#[derive(Debug, Clone, Default)]
pub struct LogNotifier;

#[async_trait]
impl VideoNotifier for LogNotifier {
    async fn video_ready(&self, video: &Video) -> Result<(), NotifyError> {
        log::info!(
            "notify=video_ready video_id={} creator_id={} title={:?}",
            video.id,
            video.creator_id,
            video.title
        );
        Ok(())
    }

    async fn video_failed(&self, video: &Video) -> Result<(), NotifyError> {
        log::info!(
            "notify=video_failed video_id={} creator_id={} error={:?}",
            video.id,
            video.creator_id,
            video.processing_error.as_deref().unwrap_or_default()
        );
        Ok(())
    }
}
