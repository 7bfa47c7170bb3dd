pub mod memory;
pub mod pg;

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub use memory::MemoryJobQueue;
pub use pg::PgJobQueue;

/// Message placed on the durable queue.
///
/// Encoding jobs carry only the video id; the worker re-reads the video from
/// the store before acting so a stale snapshot is never processed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobEnvelope {
    ProcessVideoEncoding { video_id: Uuid },
    CheckStuckVideos { stale_after_secs: u64 },
}

impl JobEnvelope {
    pub fn encode(video_id: Uuid) -> Self {
        JobEnvelope::ProcessVideoEncoding { video_id }
    }

    pub fn check_stuck(stale_after: Duration) -> Self {
        JobEnvelope::CheckStuckVideos {
            stale_after_secs: stale_after.as_secs(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            JobEnvelope::ProcessVideoEncoding { .. } => "process_video_encoding",
            JobEnvelope::CheckStuckVideos { .. } => "check_stuck_videos",
        }
    }

    pub fn to_payload(&self) -> Result<String, QueueError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_payload(payload: &str) -> Result<Self, QueueError> {
        Ok(serde_json::from_str(payload)?)
    }
}

/// A leased envelope; must be acknowledged once handling reached a terminal
/// outcome, otherwise it becomes visible again after the lease expires.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub receipt: i64,
    /// How many times this envelope has been handed out, this one included.
    pub deliveries: i32,
    pub envelope: JobEnvelope,
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("database error: {0}")]
    Database(#[from] diesel::result::Error),
    #[error("connection pool error: {0}")]
    Pool(String),
    #[error("malformed job payload: {0}")]
    Payload(#[from] serde_json::Error),
}

impl<E: std::fmt::Display> From<deadpool::managed::PoolError<E>> for QueueError {
    fn from(error: deadpool::managed::PoolError<E>) -> Self {
        QueueError::Pool(error.to_string())
    }
}

pub type QueueResult<T> = Result<T, QueueError>;

/// Competing-consumers queue with at-least-once delivery.
#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn enqueue(&self, envelope: JobEnvelope) -> QueueResult<i64>;

    /// Waits up to `wait` for an envelope to become available.
    async fn receive(&self, wait: Duration) -> QueueResult<Option<Delivery>>;

    async fn ack(&self, delivery: &Delivery) -> QueueResult<()>;

    /// Pushes the lease of an unacknowledged delivery out by a full
    /// visibility timeout, keeping long jobs from being handed out twice.
    async fn extend_lease(&self, delivery: &Delivery) -> QueueResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_is_tagged_json() {
        let id = Uuid::parse_str("6f1c1f0e-3a0b-4b57-9a3e-2f4f6d9c1a10").unwrap();
        let payload = JobEnvelope::encode(id).to_payload().unwrap();
        assert_eq!(
            payload,
            r#"{"type":"process_video_encoding","video_id":"6f1c1f0e-3a0b-4b57-9a3e-2f4f6d9c1a10"}"#
        );
    }

    #[test]
    fn rejects_unknown_job_kind() {
        let err = JobEnvelope::from_payload(r#"{"type":"transcode_audio","video_id":"x"}"#)
            .unwrap_err();
        assert!(matches!(err, QueueError::Payload(_)));
    }

    #[test]
    fn check_stuck_carries_threshold() {
        let envelope = JobEnvelope::check_stuck(Duration::from_secs(1800));
        let decoded = JobEnvelope::from_payload(&envelope.to_payload().unwrap()).unwrap();
        assert_eq!(
            decoded,
            JobEnvelope::CheckStuckVideos {
                stale_after_secs: 1800
            }
        );
        assert_eq!(decoded.kind(), "check_stuck_videos");
    }
}
