use async_trait::async_trait;
use chrono::{NaiveDateTime, Utc};
use diesel::prelude::*;
use diesel_async::scoped_futures::ScopedFutureExt;
use diesel_async::{AsyncConnection, RunQueryDsl};
use uuid::Uuid;

use super::models::{NewVideo, Video, VideoArtifacts, VideoRendition};
use super::schema::{video_renditions, videos};
use super::status::{ProcessingStatus, VideoStatus};
use super::{ClaimOutcome, DbPool, StoreError, StoreResult, VideoStore, CLAIM_PROGRESS};

const PROCESSING: &str = "processing";

/// Postgres-backed [`VideoStore`].
#[derive(Clone)]
pub struct PgVideoStore {
    pool: DbPool,
}

impl PgVideoStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl VideoStore for PgVideoStore {
    async fn insert(&self, video: NewVideo) -> StoreResult<Video> {
        let conn = &mut self.pool.get().await?;
        let video = diesel::insert_into(videos::table)
            .values(&video)
            .returning(Video::as_returning())
            .get_result(conn)
            .await?;
        Ok(video)
    }

    async fn find(&self, id: Uuid) -> StoreResult<Option<Video>> {
        let conn = &mut self.pool.get().await?;
        let video = videos::table
            .find(id)
            .select(Video::as_select())
            .first(conn)
            .await
            .optional()?;
        Ok(video)
    }

    async fn renditions(&self, id: Uuid) -> StoreResult<Vec<VideoRendition>> {
        let conn = &mut self.pool.get().await?;
        let rows = video_renditions::table
            .filter(video_renditions::video_id.eq(id))
            .order_by(video_renditions::height.desc())
            .select(VideoRendition::as_select())
            .load(conn)
            .await?;
        Ok(rows)
    }

    async fn claim(
        &self,
        id: Uuid,
        token: Uuid,
        stale_before: NaiveDateTime,
    ) -> StoreResult<ClaimOutcome> {
        let conn = &mut self.pool.get().await?;
        let now = Utc::now().naive_utc();
        let claimed = diesel::update(videos::table)
            .filter(videos::id.eq(id))
            .filter(
                videos::processing_status
                    .eq(ProcessingStatus::Pending.as_str())
                    .or(videos::processing_status
                        .eq(PROCESSING)
                        .and(videos::updated_at.lt(stale_before))),
            )
            .set((
                videos::status.eq(VideoStatus::Processing.as_str()),
                videos::processing_status.eq(PROCESSING),
                videos::processing_progress.eq(CLAIM_PROGRESS),
                videos::claim_token.eq(Some(token)),
                videos::processing_started_at.eq(Some(now)),
                videos::updated_at.eq(now),
            ))
            .returning(Video::as_returning())
            .get_result(conn)
            .await
            .optional()?;

        if let Some(video) = claimed {
            return Ok(ClaimOutcome::Claimed(video));
        }

        let current = videos::table
            .find(id)
            .select(videos::processing_status)
            .first::<String>(conn)
            .await
            .optional()?;
        let outcome = match current {
            None => ClaimOutcome::NotFound,
            Some(status) => {
                let status: ProcessingStatus = status.parse()?;
                if status.is_terminal() {
                    ClaimOutcome::AlreadyTerminal(status)
                } else {
                    ClaimOutcome::InProgress
                }
            }
        };
        Ok(outcome)
    }

    async fn record_progress(&self, id: Uuid, token: Uuid, progress: i16) -> StoreResult<()> {
        let conn = &mut self.pool.get().await?;
        let updated = diesel::update(videos::table)
            .filter(videos::id.eq(id))
            .filter(videos::claim_token.eq(token))
            .filter(videos::processing_status.eq(PROCESSING))
            .set((
                videos::processing_progress.eq(progress),
                videos::updated_at.eq(Utc::now().naive_utc()),
            ))
            .execute(conn)
            .await?;
        if updated == 0 {
            return Err(StoreError::ClaimLost(id));
        }
        Ok(())
    }

    async fn heartbeat(&self, id: Uuid, token: Uuid) -> StoreResult<()> {
        let conn = &mut self.pool.get().await?;
        let updated = diesel::update(videos::table)
            .filter(videos::id.eq(id))
            .filter(videos::claim_token.eq(token))
            .filter(videos::processing_status.eq(PROCESSING))
            .set(videos::updated_at.eq(Utc::now().naive_utc()))
            .execute(conn)
            .await?;
        if updated == 0 {
            return Err(StoreError::ClaimLost(id));
        }
        Ok(())
    }

    async fn complete(
        &self,
        id: Uuid,
        token: Uuid,
        artifacts: VideoArtifacts,
    ) -> StoreResult<Video> {
        let mut conn = self.pool.get().await?;
        let now = Utc::now().naive_utc();
        let video = conn
            .transaction::<Video, StoreError, _>(|conn| {
                async move {
                    let video = diesel::update(videos::table)
                        .filter(videos::id.eq(id))
                        .filter(videos::claim_token.eq(token))
                        .filter(videos::processing_status.eq(PROCESSING))
                        .set((
                            videos::status.eq(VideoStatus::Ready.as_str()),
                            videos::processing_status.eq(ProcessingStatus::Ready.as_str()),
                            videos::processing_progress.eq(100),
                            videos::processing_error.eq(None::<String>),
                            videos::retry_count.eq(artifacts.attempts),
                            videos::temp_video_file.eq(artifacts.temp_video_file.clone()),
                            videos::poster_path.eq(Some(artifacts.poster_path.clone())),
                            videos::poster_offset_secs.eq(Some(artifacts.poster_offset_secs)),
                            videos::preview_path.eq(artifacts.preview_path.clone()),
                            videos::duration.eq(artifacts.duration),
                            videos::width.eq(Some(artifacts.width)),
                            videos::height.eq(Some(artifacts.height)),
                            videos::video_codec.eq(artifacts.video_codec.clone()),
                            videos::claim_token.eq(None::<Uuid>),
                            videos::updated_at.eq(now),
                            videos::published_at.eq(Some(now)),
                        ))
                        .returning(Video::as_returning())
                        .get_result(conn)
                        .await
                        .optional()?
                        .ok_or(StoreError::ClaimLost(id))?;

                    diesel::delete(
                        video_renditions::table.filter(video_renditions::video_id.eq(id)),
                    )
                    .execute(conn)
                    .await?;
                    diesel::insert_into(video_renditions::table)
                        .values(&artifacts.renditions)
                        .execute(conn)
                        .await?;
                    Ok(video)
                }
                .scope_boxed()
            })
            .await?;
        Ok(video)
    }

    async fn fail(
        &self,
        id: Uuid,
        token: Uuid,
        reason: &str,
        attempts: i32,
    ) -> StoreResult<Video> {
        let conn = &mut self.pool.get().await?;
        let video = diesel::update(videos::table)
            .filter(videos::id.eq(id))
            .filter(videos::claim_token.eq(token))
            .filter(videos::processing_status.eq(PROCESSING))
            .set((
                videos::status.eq(VideoStatus::Failed.as_str()),
                videos::processing_status.eq(ProcessingStatus::Failed.as_str()),
                videos::processing_error.eq(Some(reason)),
                videos::retry_count.eq(attempts),
                videos::claim_token.eq(None::<Uuid>),
                videos::updated_at.eq(Utc::now().naive_utc()),
            ))
            .returning(Video::as_returning())
            .get_result(conn)
            .await
            .optional()?
            .ok_or(StoreError::ClaimLost(id))?;
        Ok(video)
    }

    async fn find_stuck(&self, stale_before: NaiveDateTime) -> StoreResult<Vec<Video>> {
        let conn = &mut self.pool.get().await?;
        let rows = videos::table
            .filter(videos::processing_status.eq(PROCESSING))
            .filter(videos::updated_at.lt(stale_before))
            .order_by(videos::updated_at.asc())
            .select(Video::as_select())
            .load(conn)
            .await?;
        Ok(rows)
    }

    async fn reset_stuck(
        &self,
        id: Uuid,
        stale_before: NaiveDateTime,
        note: &str,
    ) -> StoreResult<bool> {
        let conn = &mut self.pool.get().await?;
        let updated = diesel::update(videos::table)
            .filter(videos::id.eq(id))
            .filter(videos::processing_status.eq(PROCESSING))
            .filter(videos::updated_at.lt(stale_before))
            .set((
                videos::processing_status.eq(ProcessingStatus::Pending.as_str()),
                videos::processing_progress.eq(0),
                videos::processing_error.eq(Some(note)),
                videos::claim_token.eq(None::<Uuid>),
                videos::updated_at.eq(Utc::now().naive_utc()),
            ))
            .execute(conn)
            .await?;
        Ok(updated > 0)
    }

    async fn requeue_failed(&self, id: Uuid) -> StoreResult<bool> {
        let conn = &mut self.pool.get().await?;
        let updated = diesel::update(videos::table)
            .filter(videos::id.eq(id))
            .filter(videos::processing_status.eq(ProcessingStatus::Failed.as_str()))
            .filter(videos::temp_video_file.is_not_null())
            .set((
                videos::status.eq(VideoStatus::Processing.as_str()),
                videos::processing_status.eq(ProcessingStatus::Pending.as_str()),
                videos::processing_progress.eq(0),
                videos::processing_error.eq(None::<String>),
                videos::retry_count.eq(0),
                videos::updated_at.eq(Utc::now().naive_utc()),
            ))
            .execute(conn)
            .await?;
        Ok(updated > 0)
    }
}
