use chrono::Utc;
use uuid::Uuid;

use super::error::PipelineResult;
use crate::db::models::{NewVideo, Video};
use crate::db::VideoStore;
use crate::queue::{JobEnvelope, JobQueue};

#[derive(Debug, Clone)]
pub struct UploadRequest {
    pub title: String,
    pub description: Option<String>,
    pub creator_id: Uuid,
    /// Where the upload handler left the file, relative to the upload root
    /// or absolute.
    pub temp_video_file: String,
}

/// Lowercase ASCII words joined by `-`.
pub fn slugify(title: &str) -> String {
    let mut slug = String::with_capacity(title.len());
    for c in title.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
        } else if !slug.is_empty() && !slug.ends_with('-') {
            slug.push('-');
        }
    }
    let slug = slug.trim_end_matches('-');
    if slug.is_empty() {
        "video".to_string()
    } else {
        slug.chars().take(80).collect::<String>().trim_end_matches('-').to_string()
    }
}

/// Records a freshly uploaded video as `pending` and enqueues its encoding.
pub async fn register_upload(
    store: &dyn VideoStore,
    queue: &dyn JobQueue,
    request: UploadRequest,
) -> PipelineResult<Video> {
    let id = Uuid::new_v4();
    let mut short_id = id.simple().to_string();
    short_id.truncate(8);
    let slug = format!("{}-{}", slugify(&request.title), short_id);

    let video = store
        .insert(NewVideo::pending(
            id,
            slug,
            request.title,
            request.description,
            request.creator_id,
            request.temp_video_file,
            Utc::now().naive_utc(),
        ))
        .await?;
    let receipt = queue.enqueue(JobEnvelope::encode(id)).await?;
    log::info!("registered upload video_id={} slug={} job={}", id, video.slug, receipt);
    Ok(video)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReprocessOutcome {
    Requeued,
    /// Only failed videos that still have their source can be reprocessed.
    NotFailed,
    NotFound,
}

/// Moves a failed video back to `pending` and enqueues a new encoding job.
pub async fn reprocess(
    store: &dyn VideoStore,
    queue: &dyn JobQueue,
    video_id: Uuid,
) -> PipelineResult<ReprocessOutcome> {
    if store.find(video_id).await?.is_none() {
        return Ok(ReprocessOutcome::NotFound);
    }
    if !store.requeue_failed(video_id).await? {
        return Ok(ReprocessOutcome::NotFailed);
    }
    log::info!("transition=failed->pending video_id={}", video_id);
    queue.enqueue(JobEnvelope::encode(video_id)).await?;
    Ok(ReprocessOutcome::Requeued)
}
