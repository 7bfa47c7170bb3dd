use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::db::StoreError;
use crate::queue::QueueError;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("unreadable media at {path}: {reason}")]
    UnreadableMedia { path: PathBuf, reason: String },
    #[error("io error at {path}: {source}")]
    Io {
        source: std::io::Error,
        path: PathBuf,
    },
    #[error("{program} exceeded {timeout:?} and was killed")]
    TransformTimeout { program: String, timeout: Duration },
    #[error("{program} was terminated before finishing: {detail}")]
    TransformCrashed { program: String, detail: String },
    #[error("{program} exited with status {code}: {stderr}")]
    TransformFailed {
        program: String,
        code: i32,
        stderr: String,
    },
    #[error("rendition {label} failed: {cause}")]
    EncodingFailed {
        label: String,
        cause: Box<PipelineError>,
    },
    #[error("{program} produced no output at {path}")]
    MissingOutput { program: String, path: PathBuf },
    #[error("poster extraction produced no image at {path}")]
    PosterFailed { path: PathBuf },
    #[error("queue error: {0}")]
    TransientQueue(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl PipelineError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        PipelineError::Io {
            path: path.into(),
            source,
        }
    }

    pub fn unreadable(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        PipelineError::UnreadableMedia {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Classifies a non-zero exit status.
    ///
    /// ffmpeg exits with 255 after catching SIGINT or SIGTERM, and shells
    /// report a signal death as `128 + n`. Both mean the process was stopped
    /// from outside rather than rejecting its input.
    pub fn exit(program: impl Into<String>, code: i32, stderr: String) -> Self {
        let program = program.into();
        match code {
            255 => PipelineError::TransformCrashed {
                program,
                detail: "exit status 255, interrupted".to_string(),
            },
            129..=192 => PipelineError::TransformCrashed {
                program,
                detail: format!("exit status {code}, signal {}", code - 128),
            },
            _ => PipelineError::TransformFailed {
                program,
                code,
                stderr,
            },
        }
    }

    /// Whether another attempt of the same job can reasonably succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            PipelineError::Io { .. }
            | PipelineError::TransformTimeout { .. }
            | PipelineError::TransformCrashed { .. }
            | PipelineError::TransientQueue(_) => true,
            PipelineError::Store(err) => !matches!(err, StoreError::ClaimLost(_)),
            PipelineError::EncodingFailed { cause, .. } => cause.is_retryable(),
            PipelineError::UnreadableMedia { .. }
            | PipelineError::TransformFailed { .. }
            | PipelineError::MissingOutput { .. }
            | PipelineError::PosterFailed { .. } => false,
        }
    }
}

impl From<QueueError> for PipelineError {
    fn from(error: QueueError) -> Self {
        PipelineError::TransientQueue(error.to_string())
    }
}

pub type PipelineResult<T> = Result<T, PipelineError>;

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn encoding_failure_inherits_retryability() {
        let crashed = PipelineError::EncodingFailed {
            label: "720p".into(),
            cause: Box::new(PipelineError::TransformCrashed {
                program: "ffmpeg".into(),
                detail: "signal 9".into(),
            }),
        };
        assert!(crashed.is_retryable());

        let rejected = PipelineError::EncodingFailed {
            label: "720p".into(),
            cause: Box::new(PipelineError::TransformFailed {
                program: "ffmpeg".into(),
                code: 1,
                stderr: "Invalid data found when processing input".into(),
            }),
        };
        assert!(!rejected.is_retryable());
    }

    #[test]
    fn unreadable_media_is_terminal() {
        assert!(!PipelineError::unreadable("/tmp/x.mp4", "zero-length file").is_retryable());
        assert!(PipelineError::TransformTimeout {
            program: "ffmpeg".into(),
            timeout: Duration::from_secs(1),
        }
        .is_retryable());
    }

    #[test]
    fn interrupted_exit_statuses_are_retryable() {
        for code in [255, 130, 143] {
            let err = PipelineError::exit("ffmpeg", code, String::new());
            assert!(matches!(err, PipelineError::TransformCrashed { .. }), "{code}");
            assert!(err.is_retryable());
        }
        let rejected = PipelineError::exit("ffmpeg", 1, "moov atom not found".into());
        assert!(matches!(rejected, PipelineError::TransformFailed { code: 1, .. }));
        assert!(!rejected.is_retryable());
    }

    #[test]
    fn lost_claim_is_not_retried() {
        let err = PipelineError::from(StoreError::ClaimLost(Uuid::nil()));
        assert!(!err.is_retryable());
    }
}
