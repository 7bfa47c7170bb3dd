#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::sync::Semaphore;
use uuid::Uuid;

use video_pipeline::config::AppConfig;
use video_pipeline::db::models::Video;
use video_pipeline::db::MemoryVideoStore;
use video_pipeline::queue::MemoryJobQueue;
use video_pipeline::services::intake::{register_upload, UploadRequest};
use video_pipeline::services::runner::{Invocation, TransformOutput, TransformRunner};
use video_pipeline::services::notify::{NotifyError, VideoNotifier};
use video_pipeline::services::{Orchestrator, PipelineError, PipelineResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Failure {
    /// Non-zero exit status.
    Exit(i32),
    /// Killed by a signal.
    Crash,
    Timeout,
}

#[derive(Debug, Clone)]
struct EncodeFault {
    /// Only encodes of this label fail; `None` means every encode.
    label: Option<String>,
    failure: Failure,
    /// Failures left before encodes succeed again; `None` means forever.
    remaining: Option<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PosterBehavior {
    Write,
    WriteEmpty,
    Fail,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreviewBehavior {
    Write,
    /// Below the default `min_size_bytes`.
    WriteTiny,
    Fail,
    Crash,
}

/// Stands in for ffprobe/ffmpeg: answers probes with canned JSON and writes
/// placeholder bytes to the output path (the last argument).
pub struct ScriptedRunner {
    probe_json: Mutex<String>,
    probe_failure: Mutex<Option<Failure>>,
    poster: Mutex<PosterBehavior>,
    preview: Mutex<PreviewBehavior>,
    encode_fault: Mutex<Option<EncodeFault>>,
    encode_gate: Mutex<Option<Arc<Semaphore>>>,
    invocations: Mutex<Vec<Invocation>>,
    pub probes: AtomicUsize,
    pub posters: AtomicUsize,
    pub previews: AtomicUsize,
    pub encodes: AtomicUsize,
}

pub fn probe_json(width: u32, height: u32, duration: Option<f64>) -> String {
    let duration = duration
        .map(|d| format!("\"{d:.6}\""))
        .unwrap_or_else(|| "\"N/A\"".to_string());
    format!(
        r#"{{"streams":[{{"codec_type":"video","codec_name":"h264","width":{width},"height":{height},"r_frame_rate":"30/1"}},{{"codec_type":"audio","codec_name":"aac"}}],"format":{{"duration":{duration}}}}}"#
    )
}

fn failure(program: &str, failure: Failure) -> PipelineError {
    match failure {
        Failure::Exit(code) => PipelineError::exit(
            program,
            code,
            "Invalid data found when processing input".to_string(),
        ),
        Failure::Crash => PipelineError::TransformCrashed {
            program: program.to_string(),
            detail: "signal: 9 (SIGKILL)".to_string(),
        },
        Failure::Timeout => PipelineError::TransformTimeout {
            program: program.to_string(),
            timeout: Duration::from_secs(1),
        },
    }
}

/// `{label}.part.mp4` -> `label`
fn label_of(output: &Path) -> String {
    let name = output
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    name.split('.').next().unwrap_or_default().to_string()
}

impl ScriptedRunner {
    pub fn new(width: u32, height: u32, duration: Option<f64>) -> Arc<Self> {
        Arc::new(Self {
            probe_json: Mutex::new(probe_json(width, height, duration)),
            probe_failure: Mutex::new(None),
            poster: Mutex::new(PosterBehavior::Write),
            preview: Mutex::new(PreviewBehavior::Write),
            encode_fault: Mutex::new(None),
            encode_gate: Mutex::new(None),
            invocations: Mutex::new(Vec::new()),
            probes: AtomicUsize::new(0),
            posters: AtomicUsize::new(0),
            previews: AtomicUsize::new(0),
            encodes: AtomicUsize::new(0),
        })
    }

    pub fn fail_probe(&self, with: Failure) {
        *self.probe_failure.lock().unwrap() = Some(with);
    }

    pub fn poster_behavior(&self, behavior: PosterBehavior) {
        *self.poster.lock().unwrap() = behavior;
    }

    pub fn preview_behavior(&self, behavior: PreviewBehavior) {
        *self.preview.lock().unwrap() = behavior;
    }

    pub fn fail_encodes(&self, label: Option<&str>, with: Failure, times: Option<usize>) {
        *self.encode_fault.lock().unwrap() = Some(EncodeFault {
            label: label.map(str::to_string),
            failure: with,
            remaining: times,
        });
    }

    /// Makes every encode wait for a permit of the returned semaphore.
    pub fn gate_encodes(&self) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        *self.encode_gate.lock().unwrap() = Some(gate.clone());
        gate
    }

    pub fn invocations(&self) -> Vec<Invocation> {
        self.invocations.lock().unwrap().clone()
    }

    pub fn poster_offsets(&self) -> Vec<String> {
        self.invocations()
            .iter()
            .filter(|inv| inv.flag_value("-frames:v").is_some())
            .filter_map(|inv| inv.flag_value("-ss"))
            .map(|ss| ss.to_string_lossy().into_owned())
            .collect()
    }

    pub fn count(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }

    fn take_encode_fault(&self, label: &str) -> Option<Failure> {
        let mut fault = self.encode_fault.lock().unwrap();
        let current = fault.as_mut()?;
        if current.label.as_deref().is_some_and(|l| l != label) {
            return None;
        }
        match current.remaining.as_mut() {
            Some(0) => None,
            Some(left) => {
                *left -= 1;
                Some(current.failure)
            }
            None => Some(current.failure),
        }
    }

    async fn write_output(path: &Path, bytes: &[u8]) -> PipelineResult<()> {
        tokio::fs::write(path, bytes)
            .await
            .map_err(|source| PipelineError::io(path, source))
    }
}

#[async_trait]
impl TransformRunner for ScriptedRunner {
    async fn run(&self, invocation: &Invocation) -> PipelineResult<TransformOutput> {
        self.invocations.lock().unwrap().push(invocation.clone());
        let output = PathBuf::from(invocation.args.last().cloned().unwrap_or_default());

        if invocation.program == "ffprobe" {
            self.probes.fetch_add(1, Ordering::SeqCst);
            if let Some(with) = *self.probe_failure.lock().unwrap() {
                return Err(failure("ffprobe", with));
            }
            let stdout = self.probe_json.lock().unwrap().clone().into_bytes();
            return Ok(TransformOutput {
                stdout,
                stderr: String::new(),
            });
        }

        if invocation.flag_value("-frames:v").is_some() {
            self.posters.fetch_add(1, Ordering::SeqCst);
            let behavior = *self.poster.lock().unwrap();
            match behavior {
                PosterBehavior::Write => Self::write_output(&output, b"\xff\xd8jpeg").await?,
                PosterBehavior::WriteEmpty => Self::write_output(&output, b"").await?,
                PosterBehavior::Fail => return Err(failure("ffmpeg", Failure::Exit(1))),
            }
            return Ok(TransformOutput {
                stdout: Vec::new(),
                stderr: String::new(),
            });
        }

        let label = label_of(&output);
        if label == "preview" {
            self.previews.fetch_add(1, Ordering::SeqCst);
            let behavior = *self.preview.lock().unwrap();
            match behavior {
                PreviewBehavior::Write => Self::write_output(&output, &[0u8; 4096]).await?,
                PreviewBehavior::WriteTiny => Self::write_output(&output, b"moov").await?,
                PreviewBehavior::Fail => return Err(failure("ffmpeg", Failure::Exit(1))),
                PreviewBehavior::Crash => return Err(failure("ffmpeg", Failure::Crash)),
            }
            return Ok(TransformOutput {
                stdout: Vec::new(),
                stderr: String::new(),
            });
        }

        self.encodes.fetch_add(1, Ordering::SeqCst);
        let gate = self.encode_gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            let permit = gate.acquire().await.expect("gate closed");
            permit.forget();
        }
        if let Some(with) = self.take_encode_fault(&label) {
            return Err(failure("ffmpeg", with));
        }
        Self::write_output(&output, format!("encoded {label}").as_bytes()).await?;
        Ok(TransformOutput {
            stdout: Vec::new(),
            stderr: String::new(),
        })
    }
}

/// Terminal outcomes as `(kind, video_id)`, in the order they were reported.
#[derive(Default)]
pub struct RecordingNotifier {
    events: Mutex<Vec<(&'static str, Uuid)>>,
    fail: bool,
}

impl RecordingNotifier {
    pub fn failing() -> Self {
        Self {
            events: Mutex::new(Vec::new()),
            fail: true,
        }
    }

    pub fn events(&self) -> Vec<(&'static str, Uuid)> {
        self.events.lock().unwrap().clone()
    }

    fn record(&self, kind: &'static str, video: &Video) -> Result<(), NotifyError> {
        self.events.lock().unwrap().push((kind, video.id));
        if self.fail {
            return Err(NotifyError("mail relay unreachable".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl VideoNotifier for RecordingNotifier {
    async fn video_ready(&self, video: &Video) -> Result<(), NotifyError> {
        self.record("ready", video)
    }

    async fn video_failed(&self, video: &Video) -> Result<(), NotifyError> {
        self.record("failed", video)
    }
}

pub struct Harness {
    pub dir: TempDir,
    pub config: AppConfig,
    pub store: Arc<MemoryVideoStore>,
    pub queue: Arc<MemoryJobQueue>,
    pub runner: Arc<ScriptedRunner>,
    pub notifier: Arc<RecordingNotifier>,
    pub orchestrator: Arc<Orchestrator>,
}

pub fn test_config(root: &Path) -> AppConfig {
    let mut config = AppConfig::default();
    config.storage.upload_path = root.join("uploads");
    config.storage.media_root = root.join("media");
    config.worker.backoff_base_ms = 1;
    config.worker.backoff_max_ms = 5;
    config.worker.poll_timeout_secs = 1;
    config
}

impl Harness {
    pub fn new(runner: Arc<ScriptedRunner>) -> Self {
        Self::with_config(runner, |_| {})
    }

    pub fn with_config(runner: Arc<ScriptedRunner>, tweak: impl FnOnce(&mut AppConfig)) -> Self {
        Self::build(runner, Arc::new(RecordingNotifier::default()), tweak)
    }

    pub fn with_notifier(runner: Arc<ScriptedRunner>, notifier: Arc<RecordingNotifier>) -> Self {
        Self::build(runner, notifier, |_| {})
    }

    fn build(
        runner: Arc<ScriptedRunner>,
        notifier: Arc<RecordingNotifier>,
        tweak: impl FnOnce(&mut AppConfig),
    ) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        tweak(&mut config);
        std::fs::create_dir_all(&config.storage.upload_path).unwrap();
        std::fs::create_dir_all(&config.storage.media_root).unwrap();

        let store = Arc::new(MemoryVideoStore::new());
        let queue = Arc::new(MemoryJobQueue::new());
        let orchestrator = Arc::new(
            Orchestrator::new(&config, store.clone(), queue.clone(), runner.clone())
                .with_notifier(notifier.clone()),
        );
        Self {
            dir,
            config,
            store,
            queue,
            runner,
            notifier,
            orchestrator,
        }
    }

    pub fn media_root(&self) -> &Path {
        &self.config.storage.media_root
    }

    pub fn source_path(&self, name: &str) -> PathBuf {
        self.config.storage.upload_path.join(name)
    }

    /// Writes a fake source file and registers it like the upload handler.
    pub async fn upload(&self, title: &str) -> Uuid {
        let name = format!("{}.mp4", Uuid::new_v4().simple());
        std::fs::write(self.source_path(&name), b"not really a video").unwrap();
        let video = register_upload(
            self.store.as_ref(),
            self.queue.as_ref(),
            UploadRequest {
                title: title.to_string(),
                description: None,
                creator_id: Uuid::new_v4(),
                temp_video_file: name,
            },
        )
        .await
        .unwrap();
        video.id
    }

    /// Files (recursively) under the media root.
    pub fn media_files(&self) -> Vec<PathBuf> {
        fn walk(dir: &Path, out: &mut Vec<PathBuf>) {
            let Ok(entries) = std::fs::read_dir(dir) else {
                return;
            };
            for entry in entries.flatten() {
                let path = entry.path();
                if path.is_dir() {
                    walk(&path, out);
                } else {
                    out.push(path);
                }
            }
        }
        let mut files = Vec::new();
        walk(self.media_root(), &mut files);
        files.sort();
        files
    }
}
