use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Deserialize;

use super::error::{PipelineError, PipelineResult};
use super::prober::MediaInfo;
use super::runner::{Invocation, TransformRunner};
use super::storage::{ensure_parent_dir, remove_if_exists};
use crate::config::{FfmpegConfig, PreviewConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PreviewQuality {
    Low,
    #[default]
    Medium,
    High,
}

impl PreviewQuality {
    fn crf(self) -> u32 {
        match self {
            PreviewQuality::Low => 30,
            PreviewQuality::Medium => 26,
            PreviewQuality::High => 22,
        }
    }
}

/// How the preview clip is cut from the source.
#[derive(Debug, Clone, PartialEq)]
pub enum PreviewPlan {
    /// One clip from the start of the source.
    Single { length: f64 },
    /// Short clips spread evenly over the source, joined in order.
    Segmented { starts: Vec<f64>, length: f64 },
}

/// Sources shorter than one second per segment, or of unknown length, get a
/// single clip from the start.
pub fn plan_preview(duration: Option<f64>, settings: &PreviewConfig) -> PreviewPlan {
    let segments = settings.segments.max(1);
    let total = settings.duration_secs.max(0.1);
    match duration.filter(|d| *d > 0.0) {
        Some(duration) if segments > 1 && duration >= f64::from(segments) => {
            let length = total / f64::from(segments);
            let slot = duration / f64::from(segments);
            let starts = (0..segments)
                .map(|i| (slot * f64::from(i) + slot / 2.0 - length / 2.0).max(0.0))
                .collect();
            PreviewPlan::Segmented { starts, length }
        }
        Some(duration) => PreviewPlan::Single {
            length: total.min(duration),
        },
        None => PreviewPlan::Single { length: total },
    }
}

/// A verified preview clip on disk.
#[derive(Debug, Clone, PartialEq)]
pub struct Preview {
    pub path: PathBuf,
    pub file_size: u64,
}

#[derive(Clone)]
pub struct PreviewExtractor {
    runner: Arc<dyn TransformRunner>,
    ffmpeg: FfmpegConfig,
    settings: PreviewConfig,
}

impl PreviewExtractor {
    pub fn new(runner: Arc<dyn TransformRunner>, ffmpeg: FfmpegConfig, settings: PreviewConfig) -> Self {
        Self {
            runner,
            ffmpeg,
            settings,
        }
    }

    /// Cuts a silent preview clip of `source` to `dest`.
    ///
    /// `Ok(None)` when ffmpeg rejected the input or the clip came out smaller
    /// than `min_size_bytes`; nothing is left at `dest` in that case.
    pub async fn extract(
        &self,
        source: &Path,
        dest: &Path,
        media: &MediaInfo,
    ) -> PipelineResult<Option<Preview>> {
        ensure_parent_dir(dest).await?;
        let partial = dest.with_extension("part.mp4");
        remove_if_exists(&partial).await?;

        let plan = plan_preview(media.duration, &self.settings);
        let invocation = self.invocation(source, &plan, &partial);
        match self.runner.run(&invocation).await {
            Ok(_) => {}
            Err(PipelineError::TransformFailed { code, stderr, .. }) => {
                log::warn!(
                    "preview extraction from {} exited with {}: {}",
                    source.display(),
                    code,
                    stderr
                );
                remove_if_exists(&partial).await?;
                return Ok(None);
            }
            Err(err) => {
                remove_if_exists(&partial).await?;
                return Err(err);
            }
        }

        let size = match tokio::fs::metadata(&partial).await {
            Ok(meta) if meta.is_file() => meta.len(),
            Ok(_) => 0,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => 0,
            Err(source) => return Err(PipelineError::io(&partial, source)),
        };
        if size < self.settings.min_size_bytes {
            log::warn!(
                "preview of {} is only {} bytes, discarding",
                source.display(),
                size
            );
            remove_if_exists(&partial).await?;
            return Ok(None);
        }

        tokio::fs::rename(&partial, dest)
            .await
            .map_err(|source| PipelineError::io(dest, source))?;
        Ok(Some(Preview {
            path: dest.to_path_buf(),
            file_size: size,
        }))
    }

    fn scale_filter(&self) -> String {
        let w = self.settings.width & !1;
        let h = self.settings.height & !1;
        format!("scale={w}:{h}:force_original_aspect_ratio=decrease,pad={w}:{h}:(ow-iw)/2:(oh-ih)/2,setsar=1")
    }

    fn invocation(&self, source: &Path, plan: &PreviewPlan, output: &Path) -> Invocation {
        let mut invocation = Invocation::new(&self.ffmpeg.ffmpeg_path, self.ffmpeg.preview_timeout())
            .args(["-hide_banner", "-nostdin", "-loglevel", "error", "-y"]);
        match plan {
            PreviewPlan::Single { length } => {
                invocation = invocation
                    .arg("-i")
                    .arg(source)
                    .arg("-t")
                    .arg(format!("{length:.3}"))
                    .arg("-vf")
                    .arg(self.scale_filter());
            }
            PreviewPlan::Segmented { starts, length } => {
                for start in starts {
                    invocation = invocation
                        .arg("-ss")
                        .arg(format!("{start:.3}"))
                        .arg("-t")
                        .arg(format!("{length:.3}"))
                        .arg("-i")
                        .arg(source);
                }
                let scale = self.scale_filter();
                let mut graph: Vec<String> = (0..starts.len())
                    .map(|i| format!("[{i}:v]{scale}[v{i}]"))
                    .collect();
                let inputs: String = (0..starts.len()).map(|i| format!("[v{i}]")).collect();
                graph.push(format!("{inputs}concat=n={}:v=1:a=0[outv]", starts.len()));
                invocation = invocation
                    .arg("-filter_complex")
                    .arg(graph.join(";"))
                    .args(["-map", "[outv]"]);
            }
        }
        invocation
            .args(["-c:v", "libx264", "-preset"])
            .arg(&self.ffmpeg.preset)
            .arg("-crf")
            .arg(self.settings.quality.crf().to_string())
            .args(["-pix_fmt", "yuv420p", "-an", "-movflags", "+faststart", "-f", "mp4"])
            .arg(output)
    }
}
