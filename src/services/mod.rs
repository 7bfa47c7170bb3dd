pub mod encoder;
pub mod error;
pub mod intake;
pub mod notify;
pub mod orchestrator;
pub mod poster;
pub mod preview;
pub mod prober;
pub mod retry;
pub mod runner;
pub mod storage;
pub mod sweeper;
pub mod worker_pool;

pub use error::{PipelineError, PipelineResult};
pub use notify::{LogNotifier, VideoNotifier};
pub use orchestrator::{Disposition, Orchestrator, ProcessOutcome, SkipReason};
pub use runner::{ProcessRunner, TransformRunner};
pub use worker_pool::WorkerPool;
