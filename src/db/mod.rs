pub mod memory;
pub mod models;
pub mod pg_store;
pub mod schema;
pub mod status;

use async_trait::async_trait;
use chrono::NaiveDateTime;
use diesel_async::pooled_connection::deadpool::Pool;
use diesel_async::pooled_connection::AsyncDieselConnectionManager;
use diesel_async::AsyncPgConnection;
use thiserror::Error;
use uuid::Uuid;

use models::{NewVideo, Video, VideoArtifacts, VideoRendition};
use status::{InvalidTransition, ProcessingStatus};

pub use memory::MemoryVideoStore;
pub use pg_store::PgVideoStore;

pub type DbPool = deadpool::managed::Pool<AsyncDieselConnectionManager<AsyncPgConnection>>;

/// Progress recorded when a worker claims a video.
pub const CLAIM_PROGRESS: i16 = 5;

pub fn create_pool(database_url: &str, max_connections: usize) -> Result<DbPool, StoreError> {
    let config = AsyncDieselConnectionManager::<AsyncPgConnection>::new(database_url);
    Pool::builder(config)
        .max_size(max_connections)
        .build()
        .map_err(|e| StoreError::Pool(e.to_string()))
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] diesel::result::Error),
    #[error("connection pool error: {0}")]
    Pool(String),
    #[error("video {0} not found")]
    NotFound(Uuid),
    #[error("claim on video {0} was lost to another worker")]
    ClaimLost(Uuid),
    #[error("invalid processing status: {0}")]
    InvalidStatus(String),
    #[error(transparent)]
    Transition(#[from] InvalidTransition),
}

impl<E: std::fmt::Display> From<deadpool::managed::PoolError<E>> for StoreError {
    fn from(error: deadpool::managed::PoolError<E>) -> Self {
        StoreError::Pool(error.to_string())
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Result of trying to move a video into `processing` for one worker.
#[derive(Debug, Clone)]
pub enum ClaimOutcome {
    Claimed(Video),
    NotFound,
    AlreadyTerminal(ProcessingStatus),
    /// Another worker holds a live claim.
    InProgress,
}

/// Source of truth for video lifecycle state.
///
/// Every write a worker makes after claiming is guarded by its claim token so
/// a duplicate delivery can never overwrite a newer state.
#[async_trait]
pub trait VideoStore: Send + Sync {
    async fn insert(&self, video: NewVideo) -> StoreResult<Video>;

    async fn find(&self, id: Uuid) -> StoreResult<Option<Video>>;

    async fn renditions(&self, id: Uuid) -> StoreResult<Vec<VideoRendition>>;

    /// `pending -> processing`, or re-claim of a `processing` row whose
    /// heartbeat is older than `stale_before`.
    async fn claim(
        &self,
        id: Uuid,
        token: Uuid,
        stale_before: NaiveDateTime,
    ) -> StoreResult<ClaimOutcome>;

    async fn record_progress(&self, id: Uuid, token: Uuid, progress: i16) -> StoreResult<()>;

    async fn heartbeat(&self, id: Uuid, token: Uuid) -> StoreResult<()>;

    /// `processing -> ready`, persisting every artifact in the same write.
    async fn complete(&self, id: Uuid, token: Uuid, artifacts: VideoArtifacts)
        -> StoreResult<Video>;

    /// `processing -> failed` with the reason and attempts consumed.
    async fn fail(&self, id: Uuid, token: Uuid, reason: &str, attempts: i32)
        -> StoreResult<Video>;

    async fn find_stuck(&self, stale_before: NaiveDateTime) -> StoreResult<Vec<Video>>;

    /// `processing -> pending` for a row whose heartbeat stopped.
    async fn reset_stuck(
        &self,
        id: Uuid,
        stale_before: NaiveDateTime,
        note: &str,
    ) -> StoreResult<bool>;

    /// `failed -> pending` on operator request.
    async fn requeue_failed(&self, id: Uuid) -> StoreResult<bool>;
}
