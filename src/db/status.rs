use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Fine-grained lifecycle of a video's encoding job.
///
/// `Pending -> Processing -> {Ready, Failed}`. `Processing` may be re-claimed
/// by a new worker once its heartbeat goes stale, and an operator may send a
/// stuck or failed video back to `Pending`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingStatus {
    Pending,
    Processing,
    Ready,
    Failed,
}

/// Coarse publication status shown next to the processing status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VideoStatus {
    Processing,
    Ready,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// A worker picked up the job envelope.
    Claim,
    /// Probe, poster and every rendition succeeded.
    Complete,
    /// Unrecoverable error or retry budget exhausted.
    Fail,
    /// Stuck-video sweeper gave up on the current worker.
    ResetStuck,
    /// Operator asked for another run of a failed video.
    Requeue,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("cannot apply {transition:?} to a video in {from} state")]
pub struct InvalidTransition {
    pub from: ProcessingStatus,
    pub transition: Transition,
}

impl ProcessingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessingStatus::Pending => "pending",
            ProcessingStatus::Processing => "processing",
            ProcessingStatus::Ready => "ready",
            ProcessingStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ProcessingStatus::Ready | ProcessingStatus::Failed)
    }

    pub fn video_status(&self) -> VideoStatus {
        match self {
            ProcessingStatus::Pending | ProcessingStatus::Processing => VideoStatus::Processing,
            ProcessingStatus::Ready => VideoStatus::Ready,
            ProcessingStatus::Failed => VideoStatus::Failed,
        }
    }

    pub fn apply(self, transition: Transition) -> Result<ProcessingStatus, InvalidTransition> {
        use ProcessingStatus::*;
        let next = match (self, transition) {
            (Pending, Transition::Claim) | (Processing, Transition::Claim) => Processing,
            (Processing, Transition::Complete) => Ready,
            (Processing, Transition::Fail) => Failed,
            (Processing, Transition::ResetStuck) => Pending,
            (Failed, Transition::Requeue) => Pending,
            (from, transition) => return Err(InvalidTransition { from, transition }),
        };
        Ok(next)
    }
}

impl VideoStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            VideoStatus::Processing => "processing",
            VideoStatus::Ready => "ready",
            VideoStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for ProcessingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::fmt::Display for VideoStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for ProcessingStatus {
    type Err = super::StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "ready" => Ok(Self::Ready),
            "failed" => Ok(Self::Failed),
            other => Err(super::StoreError::InvalidStatus(other.to_string())),
        }
    }
}
