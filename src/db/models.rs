use chrono::NaiveDateTime;
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::status::{ProcessingStatus, VideoStatus};
use super::StoreError;

#[derive(Debug, Serialize, Deserialize, Queryable, Selectable, Clone)]
#[diesel(table_name = crate::db::schema::videos)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct Video {
    pub id: Uuid,
    pub slug: String,
    pub title: String,
    pub description: Option<String>,
    pub creator_id: Uuid,
    pub status: String,
    pub processing_status: String,
    pub processing_progress: i16,
    pub processing_error: Option<String>,
    pub retry_count: i32,
    pub temp_video_file: Option<String>,
    pub poster_path: Option<String>,
    pub poster_offset_secs: Option<f64>,
    pub preview_path: Option<String>,
    pub duration: Option<f64>,
    pub width: Option<i32>,
    pub height: Option<i32>,
    pub video_codec: Option<String>,
    #[serde(skip_serializing)]
    pub claim_token: Option<Uuid>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
    pub processing_started_at: Option<NaiveDateTime>,
    pub published_at: Option<NaiveDateTime>,
}

impl Video {
    pub fn state(&self) -> Result<ProcessingStatus, StoreError> {
        self.processing_status.parse()
    }
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = crate::db::schema::videos)]
pub struct NewVideo {
    pub id: Uuid,
    pub slug: String,
    pub title: String,
    pub description: Option<String>,
    pub creator_id: Uuid,
    pub status: String,
    pub processing_status: String,
    pub processing_progress: i16,
    pub retry_count: i32,
    pub temp_video_file: Option<String>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

impl NewVideo {
    /// A freshly uploaded video waiting for its first encoding run.
    pub fn pending(
        id: Uuid,
        slug: String,
        title: String,
        description: Option<String>,
        creator_id: Uuid,
        temp_video_file: String,
        now: NaiveDateTime,
    ) -> Self {
        Self {
            id,
            slug,
            title,
            description,
            creator_id,
            status: VideoStatus::Processing.as_str().to_string(),
            processing_status: ProcessingStatus::Pending.as_str().to_string(),
            processing_progress: 0,
            retry_count: 0,
            temp_video_file: Some(temp_video_file),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn into_video(self) -> Video {
        Video {
            id: self.id,
            slug: self.slug,
            title: self.title,
            description: self.description,
            creator_id: self.creator_id,
            status: self.status,
            processing_status: self.processing_status,
            processing_progress: self.processing_progress,
            processing_error: None,
            retry_count: self.retry_count,
            temp_video_file: self.temp_video_file,
            poster_path: None,
            poster_offset_secs: None,
            preview_path: None,
            duration: None,
            width: None,
            height: None,
            video_codec: None,
            claim_token: None,
            created_at: self.created_at,
            updated_at: self.updated_at,
            processing_started_at: None,
            published_at: None,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Queryable, Selectable, Insertable, Clone, PartialEq)]
#[diesel(table_name = crate::db::schema::video_renditions)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct VideoRendition {
    pub id: Uuid,
    pub video_id: Uuid,
    pub label: String,
    pub file_path: String,
    pub width: i32,
    pub height: i32,
    pub bitrate_kbps: i32,
    pub container: String,
    pub file_size: i64,
    /// The rendition players start with; exactly one per ready video.
    pub is_primary: bool,
    pub created_at: NaiveDateTime,
}

/// Everything persisted together with the `processing -> ready` transition.
#[derive(Debug, Clone)]
pub struct VideoArtifacts {
    pub duration: Option<f64>,
    pub width: i32,
    pub height: i32,
    pub video_codec: Option<String>,
    pub poster_path: String,
    pub poster_offset_secs: f64,
    /// `None` when no usable preview clip could be cut.
    pub preview_path: Option<String>,
    pub renditions: Vec<VideoRendition>,
    /// Source path left on the row; `None` once the temp file is removed.
    pub temp_video_file: Option<String>,
    pub attempts: i32,
}

#[derive(Debug, Serialize)]
pub struct VideoWithMeta {
    #[serde(flatten)]
    pub video: Video,
    pub renditions: Vec<VideoRendition>,
}
