use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{NaiveDateTime, Utc};
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::encoder::{RenditionEncoder, RenditionSpec};
use super::error::{PipelineError, PipelineResult};
use super::notify::{LogNotifier, VideoNotifier};
use super::poster::PosterExtractor;
use super::preview::PreviewExtractor;
use super::prober::MediaProber;
use super::retry::RetryPolicy;
use super::runner::TransformRunner;
use super::storage::{remove_if_exists, StorageLayout};
use super::sweeper::{sweep_stuck, SweepReport};
use crate::config::AppConfig;
use crate::db::models::{Video, VideoArtifacts, VideoRendition};
use crate::db::status::ProcessingStatus;
use crate::db::{ClaimOutcome, StoreError, VideoStore};
use crate::queue::{Delivery, JobEnvelope, JobQueue};

const PROBED_PROGRESS: i16 = 10;
const POSTER_PROGRESS: i16 = 20;
const PREVIEW_PROGRESS: i16 = 30;
const ENCODED_PROGRESS: i16 = 90;

/// Oldest heartbeat still considered alive.
pub fn stale_cutoff(stale_after: Duration) -> NaiveDateTime {
    let window = chrono::Duration::from_std(stale_after).unwrap_or_else(|_| chrono::Duration::days(1));
    Utc::now().naive_utc() - window
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    NotFound,
    AlreadyTerminal(ProcessingStatus),
    /// Another worker holds a live claim.
    InProgress,
}

#[derive(Debug)]
pub enum ProcessOutcome {
    Ready(Video),
    Failed(Video),
    Skipped(SkipReason),
    /// The claim was taken over by another worker mid-run.
    Abandoned,
}

/// What to do with a delivery once its handler returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Ack,
    /// Leave unacknowledged so the queue hands it out again.
    Redeliver,
}

/// Runs `fut` as one named pipeline stage and logs its outcome and timing.
async fn stage<T, F>(name: &str, video_id: Uuid, fut: F) -> PipelineResult<T>
where
    F: Future<Output = PipelineResult<T>>,
{
    let started = Instant::now();
    let result = fut.await;
    let elapsed_ms = started.elapsed().as_millis();
    match &result {
        Ok(_) => log::info!(
            "stage={} video_id={} outcome=ok elapsed_ms={}",
            name,
            video_id,
            elapsed_ms
        ),
        Err(err) => log::warn!(
            "stage={} video_id={} outcome=error elapsed_ms={} error={}",
            name,
            video_id,
            elapsed_ms,
            err
        ),
    }
    result
}

fn log_transition(from: ProcessingStatus, to: ProcessingStatus, video_id: Uuid) {
    log::info!("transition={}->{} video_id={}", from, to, video_id);
}

/// Refreshes the claim while a job runs; stopped when dropped.
struct Heartbeat(JoinHandle<()>);

impl Heartbeat {
    fn start(store: Arc<dyn VideoStore>, video_id: Uuid, token: Uuid, every: Duration) -> Self {
        Heartbeat(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match store.heartbeat(video_id, token).await {
                    Ok(()) => log::debug!("heartbeat video_id={}", video_id),
                    Err(StoreError::ClaimLost(_)) => {
                        log::warn!("heartbeat stopped, claim lost video_id={}", video_id);
                        break;
                    }
                    Err(err) => log::warn!("heartbeat failed video_id={} error={}", video_id, err),
                }
            }
        }))
    }
}

impl Drop for Heartbeat {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Drives one video from `pending` to a terminal state.
pub struct Orchestrator {
    store: Arc<dyn VideoStore>,
    queue: Arc<dyn JobQueue>,
    layout: StorageLayout,
    prober: MediaProber,
    poster: PosterExtractor,
    /// `None` when previews are disabled.
    preview: Option<PreviewExtractor>,
    encoder: RenditionEncoder,
    notifier: Arc<dyn VideoNotifier>,
    renditions: Vec<RenditionSpec>,
    retry: RetryPolicy,
    stale_after: Duration,
    heartbeat_every: Duration,
    retain_source: bool,
}

impl Orchestrator {
    pub fn new(
        config: &AppConfig,
        store: Arc<dyn VideoStore>,
        queue: Arc<dyn JobQueue>,
        runner: Arc<dyn TransformRunner>,
    ) -> Self {
        let layout = StorageLayout::new(&config.storage.upload_path, &config.storage.media_root);
        let prober = MediaProber::new(
            runner.clone(),
            config.ffmpeg.ffprobe_path.clone(),
            config.ffmpeg.probe_timeout(),
        );
        let poster = PosterExtractor::new(
            runner.clone(),
            prober.clone(),
            config.ffmpeg.ffmpeg_path.clone(),
            config.ffmpeg.poster_timeout(),
            config.poster.clone(),
        );
        let preview = config.preview.enabled.then(|| {
            PreviewExtractor::new(runner.clone(), config.ffmpeg.clone(), config.preview.clone())
        });
        let encoder = RenditionEncoder::new(runner, layout.clone(), config.ffmpeg.clone());
        Self {
            store,
            queue,
            layout,
            prober,
            poster,
            preview,
            encoder,
            notifier: Arc::new(LogNotifier),
            renditions: config.renditions.clone(),
            retry: RetryPolicy::from(&config.worker),
            stale_after: config.worker.stale_after(),
            heartbeat_every: config.worker.heartbeat(),
            retain_source: config.storage.retain_source,
        }
    }

    /// Replaces the default log-only notifier.
    pub fn with_notifier(mut self, notifier: Arc<dyn VideoNotifier>) -> Self {
        self.notifier = notifier;
        self
    }

    /// Handles one delivery. Terminal outcomes and skips are acknowledged;
    /// retryable infrastructure errors leave the envelope for redelivery.
    pub async fn handle(&self, delivery: &Delivery) -> Disposition {
        log::debug!(
            "received job={} receipt={} deliveries={}",
            delivery.envelope.kind(),
            delivery.receipt,
            delivery.deliveries
        );
        let result = match &delivery.envelope {
            JobEnvelope::ProcessVideoEncoding { video_id } => {
                self.process_video(*video_id).await.map(|outcome| {
                    log::info!(
                        "job=process_video_encoding video_id={} outcome={}",
                        video_id,
                        outcome_name(&outcome)
                    );
                })
            }
            JobEnvelope::CheckStuckVideos { stale_after_secs } => self
                .sweep(Duration::from_secs(*stale_after_secs))
                .await
                .map(|report| {
                    log::info!("job=check_stuck_videos reset={}", report.reset.len());
                }),
        };

        match result {
            Ok(()) => Disposition::Ack,
            Err(err) if err.is_retryable() => {
                log::error!(
                    "job={} receipt={} failed, leaving for redelivery: {}",
                    delivery.envelope.kind(),
                    delivery.receipt,
                    err
                );
                Disposition::Redeliver
            }
            Err(err) => {
                log::error!(
                    "job={} receipt={} failed permanently: {}",
                    delivery.envelope.kind(),
                    delivery.receipt,
                    err
                );
                Disposition::Ack
            }
        }
    }

    pub async fn sweep(&self, stale_after: Duration) -> PipelineResult<SweepReport> {
        sweep_stuck(self.store.as_ref(), self.queue.as_ref(), stale_after).await
    }

    /// Claims `video_id` and runs the full pipeline with retries.
    ///
    /// `Err` is only returned when the final state could not be persisted;
    /// pipeline failures end in [`ProcessOutcome::Failed`].
    pub async fn process_video(&self, video_id: Uuid) -> PipelineResult<ProcessOutcome> {
        let Some(current) = self.store.find(video_id).await? else {
            log::warn!("video_id={} not found, skipping", video_id);
            return Ok(ProcessOutcome::Skipped(SkipReason::NotFound));
        };
        let from = current.state()?;
        if from.is_terminal() {
            log::info!("video_id={} already {}, skipping", video_id, from);
            return Ok(ProcessOutcome::Skipped(SkipReason::AlreadyTerminal(from)));
        }

        let token = Uuid::new_v4();
        let video = match self
            .store
            .claim(video_id, token, stale_cutoff(self.stale_after))
            .await?
        {
            ClaimOutcome::Claimed(video) => video,
            ClaimOutcome::NotFound => return Ok(ProcessOutcome::Skipped(SkipReason::NotFound)),
            ClaimOutcome::AlreadyTerminal(status) => {
                return Ok(ProcessOutcome::Skipped(SkipReason::AlreadyTerminal(status)))
            }
            ClaimOutcome::InProgress => {
                log::info!("video_id={} is being processed by another worker, skipping", video_id);
                return Ok(ProcessOutcome::Skipped(SkipReason::InProgress));
            }
        };
        if from == ProcessingStatus::Processing {
            log::warn!("resuming stale claim video_id={}", video_id);
        } else {
            log_transition(from, ProcessingStatus::Processing, video_id);
        }

        let _heartbeat = Heartbeat::start(self.store.clone(), video_id, token, self.heartbeat_every);
        let attempts = self.retry.attempts();
        let mut attempt = 1;
        loop {
            let err = match self.run_pipeline(&video, token).await {
                Ok(mut artifacts) => {
                    artifacts.attempts = attempt as i32;
                    return self.finish(&video, token, artifacts).await;
                }
                Err(err) => err,
            };

            if let PipelineError::Store(StoreError::ClaimLost(_)) = err {
                log::warn!("video_id={} claim lost mid-run, abandoning", video_id);
                return Ok(ProcessOutcome::Abandoned);
            }
            if !err.is_retryable() {
                return self.fail(video_id, token, &err.to_string(), attempt).await;
            }
            if attempt >= attempts {
                let reason = format!("exhausted {attempts} attempts: {err}");
                return self.fail(video_id, token, &reason, attempt).await;
            }

            let wait = self.retry.compute_delay(attempt);
            log::warn!(
                "retrying video_id={} attempt={} max_attempts={} wait_ms={} error={}",
                video_id,
                attempt + 1,
                attempts,
                wait.as_millis(),
                err
            );
            tokio::time::sleep(wait).await;
            attempt += 1;
        }
    }

    async fn run_pipeline(&self, video: &Video, token: Uuid) -> PipelineResult<VideoArtifacts> {
        let video_id = video.id;
        let source = self.source_of(video)?;

        let media = stage("probe", video_id, self.prober.probe(&source)).await?;
        self.store
            .record_progress(video_id, token, PROBED_PROGRESS)
            .await?;

        let poster_path = self.layout.poster_path(video_id);
        let poster = stage("poster", video_id, async {
            self.poster
                .extract(&source, &poster_path, None, Some(&media))
                .await?
                .ok_or_else(|| PipelineError::PosterFailed {
                    path: poster_path.clone(),
                })
        })
        .await?;
        self.store
            .record_progress(video_id, token, POSTER_PROGRESS)
            .await?;

        let preview_path = match &self.preview {
            Some(extractor) => {
                let dest = self.layout.preview_path(video_id);
                match stage("preview", video_id, extractor.extract(&source, &dest, &media)).await {
                    Ok(Some(_)) => Some(StorageLayout::preview_relative(video_id)),
                    outcome => {
                        match outcome {
                            Err(err) => log::warn!("preview skipped video_id={} error={}", video_id, err),
                            _ => log::warn!("no usable preview video_id={}, continuing without", video_id),
                        }
                        // An earlier run's clip must not outlive a null column.
                        remove_if_exists(&dest).await?;
                        None
                    }
                }
            }
            None => None,
        };
        self.store
            .record_progress(video_id, token, PREVIEW_PROGRESS)
            .await?;

        let encoded = stage(
            "encode",
            video_id,
            self.encoder.encode(video_id, &source, &media, &self.renditions),
        )
        .await?;
        self.store
            .record_progress(video_id, token, ENCODED_PROGRESS)
            .await?;

        let now = Utc::now().naive_utc();
        let primary = encoded
            .values()
            .max_by_key(|r| (r.width * r.height, r.bitrate_kbps))
            .map(|r| r.label.clone());
        let renditions = encoded
            .into_values()
            .map(|r| {
                let is_primary = primary.as_deref() == Some(r.label.as_str());
                VideoRendition {
                    id: Uuid::new_v4(),
                    video_id,
                    label: r.label,
                    file_path: r.relative_path,
                    width: r.width as i32,
                    height: r.height as i32,
                    bitrate_kbps: r.bitrate_kbps as i32,
                    container: r.container.extension().to_string(),
                    file_size: r.file_size as i64,
                    is_primary,
                    created_at: now,
                }
            })
            .collect();

        Ok(VideoArtifacts {
            duration: media.duration,
            width: media.width as i32,
            height: media.height as i32,
            video_codec: media.video_codec,
            poster_path: StorageLayout::poster_relative(video_id),
            poster_offset_secs: poster.offset_secs,
            preview_path,
            renditions,
            temp_video_file: if self.retain_source {
                video.temp_video_file.clone()
            } else {
                None
            },
            attempts: 1,
        })
    }

    fn source_of(&self, video: &Video) -> PipelineResult<PathBuf> {
        match video.temp_video_file.as_deref() {
            Some(file) => Ok(self.layout.source_path(file)),
            None => Err(PipelineError::unreadable(
                format!("video:{}", video.id),
                "no source file recorded",
            )),
        }
    }

    async fn finish(
        &self,
        video: &Video,
        token: Uuid,
        artifacts: VideoArtifacts,
    ) -> PipelineResult<ProcessOutcome> {
        let remove_source = !self.retain_source;
        let ready = match self.store.complete(video.id, token, artifacts).await {
            Ok(ready) => ready,
            Err(StoreError::ClaimLost(_)) => return Ok(ProcessOutcome::Abandoned),
            Err(err) => return Err(err.into()),
        };
        log_transition(ProcessingStatus::Processing, ProcessingStatus::Ready, video.id);
        if let Err(err) = self.notifier.video_ready(&ready).await {
            log::error!("video_id={} {}", video.id, err);
        }

        if remove_source {
            if let Ok(source) = self.source_of(video) {
                if let Err(err) = remove_if_exists(&source).await {
                    log::warn!("could not remove source video_id={} error={}", video.id, err);
                }
            }
        }
        Ok(ProcessOutcome::Ready(ready))
    }

    async fn fail(
        &self,
        video_id: Uuid,
        token: Uuid,
        reason: &str,
        attempts: u32,
    ) -> PipelineResult<ProcessOutcome> {
        match self.store.fail(video_id, token, reason, attempts as i32).await {
            Ok(failed) => {
                log_transition(ProcessingStatus::Processing, ProcessingStatus::Failed, video_id);
                log::error!("video_id={} failed after {} attempt(s): {}", video_id, attempts, reason);
                if let Err(err) = self.notifier.video_failed(&failed).await {
                    log::error!("video_id={} {}", video_id, err);
                }
                Ok(ProcessOutcome::Failed(failed))
            }
            Err(StoreError::ClaimLost(_)) => Ok(ProcessOutcome::Abandoned),
            Err(err) => Err(err.into()),
        }
    }
}

fn outcome_name(outcome: &ProcessOutcome) -> &'static str {
    match outcome {
        ProcessOutcome::Ready(_) => "ready",
        ProcessOutcome::Failed(_) => "failed",
        ProcessOutcome::Skipped(_) => "skipped",
        ProcessOutcome::Abandoned => "abandoned",
    }
}
