use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::error::{PipelineError, PipelineResult};
use super::prober::MediaInfo;
use super::runner::{Invocation, TransformRunner};
use super::storage::{ensure_parent_dir, non_empty_file_size, remove_if_exists, StorageLayout};
use crate::config::FfmpegConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Container {
    #[default]
    Mp4,
    Mkv,
    Webm,
    Mov,
}

impl Container {
    pub fn extension(&self) -> &'static str {
        match self {
            Container::Mp4 => "mp4",
            Container::Mkv => "mkv",
            Container::Webm => "webm",
            Container::Mov => "mov",
        }
    }

    fn muxer(&self) -> &'static str {
        match self {
            Container::Mp4 => "mp4",
            Container::Mkv => "matroska",
            Container::Webm => "webm",
            Container::Mov => "mov",
        }
    }

    fn audio_codec(&self) -> &'static str {
        match self {
            Container::Webm => "libopus",
            _ => "aac",
        }
    }
}

fn default_codec() -> String {
    "h264".to_string()
}

/// One configured output of the bitrate/resolution ladder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenditionSpec {
    pub label: String,
    pub max_width: u32,
    pub max_height: u32,
    pub bitrate_kbps: u32,
    #[serde(default)]
    pub container: Container,
    #[serde(default = "default_codec")]
    pub codec: String,
}

/// A spec resolved against a concrete source.
#[derive(Debug, Clone, PartialEq)]
pub struct RenditionPlan {
    pub label: String,
    pub width: u32,
    pub height: u32,
    pub bitrate_kbps: u32,
    pub container: Container,
    pub encoder: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EncodedRendition {
    pub label: String,
    pub path: PathBuf,
    /// Path relative to the media root, as recorded on the video.
    pub relative_path: String,
    pub width: u32,
    pub height: u32,
    pub bitrate_kbps: u32,
    pub container: Container,
    pub file_size: u64,
}

fn ffmpeg_encoder(codec: &str) -> String {
    match codec.to_ascii_lowercase().as_str() {
        "h264" | "x264" | "avc" => "libx264".to_string(),
        "h265" | "x265" | "hevc" => "libx265".to_string(),
        "vp9" => "libvpx-vp9".to_string(),
        "av1" => "libaom-av1".to_string(),
        _ => codec.to_string(),
    }
}

fn even(value: u32) -> u32 {
    (value & !1).max(2)
}

/// Largest size with the source aspect ratio inside `max_w x max_h`,
/// never larger than the source itself.
fn fit_within(src_w: u32, src_h: u32, max_w: u32, max_h: u32) -> (u32, u32) {
    let scale = (f64::from(max_w) / f64::from(src_w))
        .min(f64::from(max_h) / f64::from(src_h))
        .min(1.0);
    let w = (f64::from(src_w) * scale).round() as u32;
    let h = (f64::from(src_h) * scale).round() as u32;
    (even(w), even(h))
}

/// Resolves the configured ladder against the source.
///
/// Specs taller than the source are skipped so nothing is upscaled. When no
/// spec fits, the smallest one is downgraded to the source size with its
/// bitrate scaled by the pixel ratio. Bitrates are clamped to
/// `[min_kbps, max_kbps]`.
pub fn plan_renditions(
    specs: &[RenditionSpec],
    source: &MediaInfo,
    min_kbps: u32,
    max_kbps: u32,
) -> Vec<RenditionPlan> {
    let clamp = |kbps: u32| kbps.clamp(min_kbps, max_kbps.max(min_kbps));
    let mut plans: Vec<RenditionPlan> = Vec::new();

    for spec in specs.iter().filter(|s| s.max_height <= source.height) {
        let (width, height) = fit_within(source.width, source.height, spec.max_width, spec.max_height);
        if plans.iter().any(|p| p.width == width && p.height == height) {
            continue;
        }
        plans.push(RenditionPlan {
            label: spec.label.clone(),
            width,
            height,
            bitrate_kbps: clamp(spec.bitrate_kbps),
            container: spec.container,
            encoder: ffmpeg_encoder(&spec.codec),
        });
    }

    if plans.is_empty() {
        if let Some(smallest) = specs.iter().min_by_key(|s| s.max_height) {
            let (width, height) = fit_within(
                source.width,
                source.height,
                smallest.max_width.max(source.width),
                smallest.max_height,
            );
            let spec_pixels = f64::from(smallest.max_width) * f64::from(smallest.max_height);
            let ratio = (f64::from(width) * f64::from(height) / spec_pixels).min(1.0);
            let bitrate = (f64::from(smallest.bitrate_kbps) * ratio).round() as u32;
            plans.push(RenditionPlan {
                label: smallest.label.clone(),
                width,
                height,
                bitrate_kbps: clamp(bitrate),
                container: smallest.container,
                encoder: ffmpeg_encoder(&smallest.codec),
            });
        }
    }
    plans
}

#[derive(Clone)]
pub struct RenditionEncoder {
    runner: Arc<dyn TransformRunner>,
    layout: StorageLayout,
    settings: FfmpegConfig,
}

impl RenditionEncoder {
    pub fn new(runner: Arc<dyn TransformRunner>, layout: StorageLayout, settings: FfmpegConfig) -> Self {
        Self {
            runner,
            layout,
            settings,
        }
    }

    /// Encodes every applicable rendition of `source`.
    ///
    /// All or nothing: the first failing rendition aborts the run with
    /// [`PipelineError::EncodingFailed`] and outputs already written by this
    /// run are removed. Output paths depend only on the video id and label,
    /// so a re-run overwrites earlier outputs.
    pub async fn encode(
        &self,
        video_id: Uuid,
        source: &Path,
        media: &MediaInfo,
        specs: &[RenditionSpec],
    ) -> PipelineResult<BTreeMap<String, EncodedRendition>> {
        let plans = plan_renditions(
            specs,
            media,
            self.settings.min_bitrate_kbps,
            self.settings.max_bitrate_kbps,
        );
        let mut encoded: BTreeMap<String, EncodedRendition> = BTreeMap::new();
        for plan in plans {
            log::info!(
                "encoding video_id={} label={} size={}x{} bitrate={}k",
                video_id,
                plan.label,
                plan.width,
                plan.height,
                plan.bitrate_kbps
            );
            match self.encode_one(video_id, source, &plan).await {
                Ok(rendition) => {
                    encoded.insert(plan.label.clone(), rendition);
                }
                Err(cause) => {
                    for done in encoded.values() {
                        if let Err(err) = remove_if_exists(&done.path).await {
                            log::warn!("failed to clean up {}: {}", done.path.display(), err);
                        }
                    }
                    return Err(PipelineError::EncodingFailed {
                        label: plan.label,
                        cause: Box::new(cause),
                    });
                }
            }
        }
        Ok(encoded)
    }

    fn invocation(&self, source: &Path, plan: &RenditionPlan, output: &Path) -> Invocation {
        let mut invocation = Invocation::new(&self.settings.ffmpeg_path, self.settings.encode_timeout())
            .args(["-hide_banner", "-nostdin", "-loglevel", "error", "-y", "-i"])
            .arg(source)
            .args(["-map", "0:v:0", "-map", "0:a:0?", "-sn", "-dn"])
            .arg("-vf")
            .arg(format!("scale={}:{}", plan.width, plan.height))
            .arg("-c:v")
            .arg(&plan.encoder);
        if matches!(plan.encoder.as_str(), "libx264" | "libx265") {
            invocation = invocation.arg("-preset").arg(&self.settings.preset);
        }
        invocation = invocation
            .arg("-b:v")
            .arg(format!("{}k", plan.bitrate_kbps))
            .arg("-maxrate")
            .arg(format!("{}k", plan.bitrate_kbps + plan.bitrate_kbps / 2))
            .arg("-bufsize")
            .arg(format!("{}k", plan.bitrate_kbps * 2))
            .arg("-threads")
            .arg(self.settings.thread_count.to_string())
            .arg("-c:a")
            .arg(plan.container.audio_codec())
            .arg("-b:a")
            .arg(format!("{}k", self.settings.audio_bitrate_kbps));
        if matches!(plan.container, Container::Mp4 | Container::Mov) {
            invocation = invocation.args(["-movflags", "+faststart"]);
        }
        invocation.arg("-f").arg(plan.container.muxer()).arg(output)
    }

    async fn encode_one(
        &self,
        video_id: Uuid,
        source: &Path,
        plan: &RenditionPlan,
    ) -> PipelineResult<EncodedRendition> {
        let path = self.layout.rendition_path(video_id, &plan.label, plan.container);
        ensure_parent_dir(&path).await?;
        let partial = path.with_file_name(format!(
            "{}.part.{}",
            plan.label,
            plan.container.extension()
        ));
        remove_if_exists(&partial).await?;

        if let Err(err) = self
            .runner
            .run(&self.invocation(source, plan, &partial))
            .await
        {
            remove_if_exists(&partial).await?;
            return Err(err);
        }

        let Some(file_size) = non_empty_file_size(&partial).await? else {
            remove_if_exists(&partial).await?;
            return Err(PipelineError::MissingOutput {
                program: self.settings.ffmpeg_path.clone(),
                path: partial,
            });
        };
        tokio::fs::rename(&partial, &path)
            .await
            .map_err(|source| PipelineError::io(&path, source))?;

        Ok(EncodedRendition {
            label: plan.label.clone(),
            relative_path: StorageLayout::rendition_relative(video_id, &plan.label, plan.container),
            path,
            width: plan.width,
            height: plan.height,
            bitrate_kbps: plan.bitrate_kbps,
            container: plan.container,
            file_size,
        })
    }
}
