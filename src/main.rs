use std::path::PathBuf;
use std::sync::Arc;

use actix_web::{web, App, HttpServer};
use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use dotenv::dotenv;
use tokio::sync::watch;
use uuid::Uuid;

use video_pipeline::api::{self, AppState};
use video_pipeline::config::AppConfig;
use video_pipeline::db::{self, PgVideoStore, VideoStore};
use video_pipeline::queue::{JobEnvelope, JobQueue, PgJobQueue};
use video_pipeline::services::intake::{register_upload, UploadRequest};
use video_pipeline::services::poster::PosterExtractor;
use video_pipeline::services::prober::MediaProber;
use video_pipeline::services::storage::StorageLayout;
use video_pipeline::services::{Orchestrator, ProcessOutcome, ProcessRunner, WorkerPool};

#[derive(Parser, Debug)]
#[command(author, version, about = "Video encoding and poster extraction pipeline", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the worker pool and the HTTP API
    Serve,
    /// Run the worker pool only
    Work,
    /// Print the metadata of a media file
    Probe { file: PathBuf },
    /// Extract a poster frame from a file
    Poster {
        source: PathBuf,
        dest: PathBuf,
        /// Offset in seconds; defaults to a fraction of the duration
        #[arg(long)]
        at: Option<f64>,
    },
    /// Register an uploaded file and enqueue its encoding
    Ingest {
        file: PathBuf,
        #[arg(long)]
        title: String,
        #[arg(long)]
        creator: Uuid,
        #[arg(long)]
        description: Option<String>,
    },
    /// Enqueue an encoding job for an existing video
    Dispatch { video_id: Uuid },
    /// Run the full pipeline for a video in this process
    Process { video_id: Uuid },
    /// Reset stuck videos and re-enqueue them
    Sweep,
}

struct Services {
    store: Arc<dyn VideoStore>,
    queue: Arc<dyn JobQueue>,
    orchestrator: Arc<Orchestrator>,
}

fn connect(config: &AppConfig) -> anyhow::Result<Services> {
    let pool = db::create_pool(&config.database.url, config.database.max_connections)
        .context("failed to create database pool")?;
    let store: Arc<dyn VideoStore> = Arc::new(PgVideoStore::new(pool.clone()));
    let queue: Arc<dyn JobQueue> = Arc::new(PgJobQueue::new(
        pool,
        config.worker.visibility_timeout(),
    ));
    let orchestrator = Arc::new(Orchestrator::new(
        config,
        store.clone(),
        queue.clone(),
        Arc::new(ProcessRunner),
    ));
    Ok(Services {
        store,
        queue,
        orchestrator,
    })
}

fn prober(config: &AppConfig) -> MediaProber {
    MediaProber::new(
        Arc::new(ProcessRunner),
        config.ffmpeg.ffprobe_path.clone(),
        config.ffmpeg.probe_timeout(),
    )
}

fn shutdown_on_ctrl_c() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        if let Err(err) = tokio::signal::ctrl_c().await {
            log::error!("failed to listen for shutdown signal: {}", err);
            return;
        }
        log::info!("shutdown requested, finishing jobs in flight");
        let _ = tx.send(true);
    });
    rx
}

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    env_logger::init();

    let cli = Cli::parse();
    let config = AppConfig::new().context("failed to load configuration")?;

    tokio::fs::create_dir_all(&config.storage.upload_path)
        .await
        .context("failed to create upload directory")?;
    tokio::fs::create_dir_all(&config.storage.media_root)
        .await
        .context("failed to create media directory")?;

    match cli.command {
        Command::Serve => serve(config).await,
        Command::Work => {
            let services = connect(&config)?;
            WorkerPool::new(services.orchestrator, services.queue, config.worker.clone())
                .run(shutdown_on_ctrl_c())
                .await;
            Ok(())
        }
        Command::Probe { file } => {
            let info = prober(&config).probe(&file).await?;
            println!("{}", serde_json::to_string_pretty(&info)?);
            Ok(())
        }
        Command::Poster { source, dest, at } => {
            let extractor = PosterExtractor::new(
                Arc::new(ProcessRunner),
                prober(&config),
                config.ffmpeg.ffmpeg_path.clone(),
                config.ffmpeg.poster_timeout(),
                config.poster.clone(),
            );
            match extractor.extract(&source, &dest, at, None).await? {
                Some(poster) => {
                    println!(
                        "poster written to {} at {:.3}s",
                        poster.path.display(),
                        poster.offset_secs
                    );
                    Ok(())
                }
                None => bail!("no frame could be extracted from {}", source.display()),
            }
        }
        Command::Ingest {
            file,
            title,
            creator,
            description,
        } => {
            let layout =
                StorageLayout::new(&config.storage.upload_path, &config.storage.media_root);
            let temp_video_file = layout.source_reference(&file).await?;
            let services = connect(&config)?;
            let video = register_upload(
                services.store.as_ref(),
                services.queue.as_ref(),
                UploadRequest {
                    title,
                    description,
                    creator_id: creator,
                    temp_video_file,
                },
            )
            .await?;
            println!("{} {}", video.id, video.slug);
            Ok(())
        }
        Command::Dispatch { video_id } => {
            let services = connect(&config)?;
            if services.store.find(video_id).await?.is_none() {
                bail!("video {video_id} not found");
            }
            let receipt = services.queue.enqueue(JobEnvelope::encode(video_id)).await?;
            println!("enqueued job {receipt} for video {video_id}");
            Ok(())
        }
        Command::Process { video_id } => {
            let services = connect(&config)?;
            match services.orchestrator.process_video(video_id).await? {
                ProcessOutcome::Ready(video) => {
                    println!("video {} is ready", video.id);
                    Ok(())
                }
                ProcessOutcome::Failed(video) => bail!(
                    "video {} failed: {}",
                    video.id,
                    video.processing_error.unwrap_or_default()
                ),
                ProcessOutcome::Skipped(reason) => {
                    println!("video {video_id} skipped: {reason:?}");
                    Ok(())
                }
                ProcessOutcome::Abandoned => bail!("video {video_id} was claimed by another worker"),
            }
        }
        Command::Sweep => {
            let services = connect(&config)?;
            let report = services.orchestrator.sweep(config.worker.stale_after()).await?;
            println!("reset {} stuck video(s)", report.reset.len());
            for id in report.reset {
                println!("  {id}");
            }
            Ok(())
        }
    }
}

async fn serve(config: AppConfig) -> anyhow::Result<()> {
    let services = connect(&config)?;
    let shutdown = shutdown_on_ctrl_c();

    let pool = WorkerPool::new(
        services.orchestrator.clone(),
        services.queue.clone(),
        config.worker.clone(),
    );
    let workers = tokio::spawn(async move { pool.run(shutdown).await });

    let state = web::Data::new(AppState {
        store: services.store.clone(),
        queue: services.queue.clone(),
    });
    log::info!(
        "Starting server on {}:{}",
        config.server.host,
        config.server.port
    );
    HttpServer::new(move || {
        App::new()
            .app_data(state.clone())
            .configure(api::configure)
    })
    .bind((config.server.host.clone(), config.server.port))?
    .run()
    .await?;

    workers.await.context("worker pool panicked")?;
    Ok(())
}
