use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{NaiveDateTime, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::models::{NewVideo, Video, VideoArtifacts, VideoRendition};
use super::status::{ProcessingStatus, Transition};
use super::{ClaimOutcome, StoreError, StoreResult, VideoStore, CLAIM_PROGRESS};

#[derive(Default)]
struct Tables {
    videos: HashMap<Uuid, Video>,
    renditions: HashMap<Uuid, Vec<VideoRendition>>,
}

/// In-process [`VideoStore`] with the same transition rules as Postgres.
#[derive(Default)]
pub struct MemoryVideoStore {
    tables: Mutex<Tables>,
}

impl MemoryVideoStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrites the heartbeat timestamp, e.g. to simulate a crashed worker.
    pub async fn set_updated_at(&self, id: Uuid, at: NaiveDateTime) -> StoreResult<()> {
        let mut tables = self.tables.lock().await;
        let video = tables.videos.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        video.updated_at = at;
        Ok(())
    }
}

fn transition(video: &mut Video, transition: Transition, now: NaiveDateTime) -> StoreResult<()> {
    let next = video.state()?.apply(transition)?;
    video.processing_status = next.as_str().to_string();
    video.status = next.video_status().as_str().to_string();
    video.updated_at = now;
    Ok(())
}

fn claimed_by<'a>(
    tables: &'a mut Tables,
    id: Uuid,
    token: Uuid,
) -> StoreResult<&'a mut Video> {
    match tables.videos.get_mut(&id) {
        Some(video)
            if video.claim_token == Some(token)
                && video.processing_status == ProcessingStatus::Processing.as_str() =>
        {
            Ok(video)
        }
        _ => Err(StoreError::ClaimLost(id)),
    }
}

#[async_trait]
impl VideoStore for MemoryVideoStore {
    async fn insert(&self, video: NewVideo) -> StoreResult<Video> {
        let video = video.into_video();
        let mut tables = self.tables.lock().await;
        tables.videos.insert(video.id, video.clone());
        Ok(video)
    }

    async fn find(&self, id: Uuid) -> StoreResult<Option<Video>> {
        let tables = self.tables.lock().await;
        Ok(tables.videos.get(&id).cloned())
    }

    async fn renditions(&self, id: Uuid) -> StoreResult<Vec<VideoRendition>> {
        let tables = self.tables.lock().await;
        let mut rows = tables.renditions.get(&id).cloned().unwrap_or_default();
        rows.sort_by(|a, b| b.height.cmp(&a.height));
        Ok(rows)
    }

    async fn claim(
        &self,
        id: Uuid,
        token: Uuid,
        stale_before: NaiveDateTime,
    ) -> StoreResult<ClaimOutcome> {
        let mut tables = self.tables.lock().await;
        let Some(video) = tables.videos.get_mut(&id) else {
            return Ok(ClaimOutcome::NotFound);
        };
        let state = video.state()?;
        if state.is_terminal() {
            return Ok(ClaimOutcome::AlreadyTerminal(state));
        }
        if state == ProcessingStatus::Processing && video.updated_at >= stale_before {
            return Ok(ClaimOutcome::InProgress);
        }
        let now = Utc::now().naive_utc();
        transition(video, Transition::Claim, now)?;
        video.processing_progress = CLAIM_PROGRESS;
        video.claim_token = Some(token);
        video.processing_started_at = Some(now);
        Ok(ClaimOutcome::Claimed(video.clone()))
    }

    async fn record_progress(&self, id: Uuid, token: Uuid, progress: i16) -> StoreResult<()> {
        let mut tables = self.tables.lock().await;
        let video = claimed_by(&mut tables, id, token)?;
        video.processing_progress = progress;
        video.updated_at = Utc::now().naive_utc();
        Ok(())
    }

    async fn heartbeat(&self, id: Uuid, token: Uuid) -> StoreResult<()> {
        let mut tables = self.tables.lock().await;
        let video = claimed_by(&mut tables, id, token)?;
        video.updated_at = Utc::now().naive_utc();
        Ok(())
    }

    async fn complete(
        &self,
        id: Uuid,
        token: Uuid,
        artifacts: VideoArtifacts,
    ) -> StoreResult<Video> {
        let mut tables = self.tables.lock().await;
        let now = Utc::now().naive_utc();
        let video = claimed_by(&mut tables, id, token)?;
        transition(video, Transition::Complete, now)?;
        video.processing_progress = 100;
        video.processing_error = None;
        video.retry_count = artifacts.attempts;
        video.temp_video_file = artifacts.temp_video_file;
        video.poster_path = Some(artifacts.poster_path);
        video.poster_offset_secs = Some(artifacts.poster_offset_secs);
        video.preview_path = artifacts.preview_path;
        video.duration = artifacts.duration;
        video.width = Some(artifacts.width);
        video.height = Some(artifacts.height);
        video.video_codec = artifacts.video_codec;
        video.claim_token = None;
        video.published_at = Some(now);
        let video = video.clone();
        tables.renditions.insert(id, artifacts.renditions);
        Ok(video)
    }

    async fn fail(
        &self,
        id: Uuid,
        token: Uuid,
        reason: &str,
        attempts: i32,
    ) -> StoreResult<Video> {
        let mut tables = self.tables.lock().await;
        let video = claimed_by(&mut tables, id, token)?;
        transition(video, Transition::Fail, Utc::now().naive_utc())?;
        video.processing_error = Some(reason.to_string());
        video.retry_count = attempts;
        video.claim_token = None;
        Ok(video.clone())
    }

    async fn find_stuck(&self, stale_before: NaiveDateTime) -> StoreResult<Vec<Video>> {
        let tables = self.tables.lock().await;
        let mut rows: Vec<Video> = tables
            .videos
            .values()
            .filter(|v| {
                v.processing_status == ProcessingStatus::Processing.as_str()
                    && v.updated_at < stale_before
            })
            .cloned()
            .collect();
        rows.sort_by_key(|v| v.updated_at);
        Ok(rows)
    }

    async fn reset_stuck(
        &self,
        id: Uuid,
        stale_before: NaiveDateTime,
        note: &str,
    ) -> StoreResult<bool> {
        let mut tables = self.tables.lock().await;
        let Some(video) = tables.videos.get_mut(&id) else {
            return Ok(false);
        };
        if video.state()? != ProcessingStatus::Processing || video.updated_at >= stale_before {
            return Ok(false);
        }
        transition(video, Transition::ResetStuck, Utc::now().naive_utc())?;
        video.processing_progress = 0;
        video.processing_error = Some(note.to_string());
        video.claim_token = None;
        Ok(true)
    }

    async fn requeue_failed(&self, id: Uuid) -> StoreResult<bool> {
        let mut tables = self.tables.lock().await;
        let Some(video) = tables.videos.get_mut(&id) else {
            return Ok(false);
        };
        if video.state()? != ProcessingStatus::Failed || video.temp_video_file.is_none() {
            return Ok(false);
        }
        transition(video, Transition::Requeue, Utc::now().naive_utc())?;
        video.processing_progress = 0;
        video.processing_error = None;
        video.retry_count = 0;
        Ok(true)
    }
}
