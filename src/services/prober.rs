use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::error::{PipelineError, PipelineResult};
use super::runner::{Invocation, TransformRunner};

/// Source metadata used to drive poster and encoding decisions.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MediaInfo {
    /// Seconds; `None` when the container does not report it.
    pub duration: Option<f64>,
    pub width: u32,
    pub height: u32,
    pub video_codec: Option<String>,
    pub audio_codec: Option<String>,
    pub frame_rate: Option<f64>,
}

#[derive(Deserialize)]
struct FfprobeOutput {
    format: Option<FormatInfo>,
    streams: Option<Vec<StreamInfo>>,
}

#[derive(Deserialize)]
struct FormatInfo {
    duration: Option<String>,
}

#[derive(Deserialize)]
struct StreamInfo {
    codec_type: Option<String>,
    codec_name: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    r_frame_rate: Option<String>,
    duration: Option<String>,
}

#[derive(Clone)]
pub struct MediaProber {
    runner: Arc<dyn TransformRunner>,
    ffprobe_path: String,
    timeout: Duration,
}

impl MediaProber {
    pub fn new(runner: Arc<dyn TransformRunner>, ffprobe_path: String, timeout: Duration) -> Self {
        Self {
            runner,
            ffprobe_path,
            timeout,
        }
    }

    /// Inspects `path` with ffprobe. Missing, empty or undecodable files are
    /// reported as [`PipelineError::UnreadableMedia`].
    pub async fn probe(&self, path: &Path) -> PipelineResult<MediaInfo> {
        ensure_readable(path).await?;

        let invocation = Invocation::new(&self.ffprobe_path, self.timeout)
            .args([
                "-v",
                "error",
                "-print_format",
                "json",
                "-show_format",
                "-show_streams",
            ])
            .arg(path);

        let output = match self.runner.run(&invocation).await {
            Ok(output) => output,
            Err(PipelineError::TransformFailed { stderr, .. }) => {
                return Err(PipelineError::unreadable(path, stderr));
            }
            Err(err) => return Err(err),
        };

        parse_probe_output(&output.stdout).map_err(|reason| PipelineError::unreadable(path, reason))
    }
}

/// Fails unless `path` is an existing, non-empty regular file.
pub async fn ensure_readable(path: &Path) -> PipelineResult<()> {
    match tokio::fs::metadata(path).await {
        Ok(meta) if !meta.is_file() => Err(PipelineError::unreadable(path, "not a regular file")),
        Ok(meta) if meta.len() == 0 => Err(PipelineError::unreadable(path, "zero-length file")),
        Ok(_) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            Err(PipelineError::unreadable(path, "file does not exist"))
        }
        Err(err) if err.kind() == std::io::ErrorKind::PermissionDenied => {
            Err(PipelineError::unreadable(path, "permission denied"))
        }
        Err(source) => Err(PipelineError::io(path, source)),
    }
}

pub fn parse_probe_output(stdout: &[u8]) -> Result<MediaInfo, String> {
    let probe: FfprobeOutput =
        serde_json::from_slice(stdout).map_err(|e| format!("invalid ffprobe output: {e}"))?;

    let streams = probe.streams.unwrap_or_default();
    let video = streams
        .iter()
        .find(|s| s.codec_type.as_deref() == Some("video"))
        .ok_or_else(|| "no video stream".to_string())?;
    let audio = streams
        .iter()
        .find(|s| s.codec_type.as_deref() == Some("audio"));

    let (width, height) = match (video.width, video.height) {
        (Some(w), Some(h)) if w > 0 && h > 0 => (w, h),
        _ => return Err("video stream has no dimensions".to_string()),
    };

    // Container duration first, stream duration as fallback.
    let duration = probe
        .format
        .as_ref()
        .and_then(|f| f.duration.as_deref())
        .and_then(parse_seconds)
        .or_else(|| video.duration.as_deref().and_then(parse_seconds));

    Ok(MediaInfo {
        duration,
        width,
        height,
        video_codec: video.codec_name.clone(),
        audio_codec: audio.and_then(|a| a.codec_name.clone()),
        frame_rate: video.r_frame_rate.as_deref().and_then(parse_frame_rate),
    })
}

fn parse_seconds(value: &str) -> Option<f64> {
    value
        .trim()
        .parse::<f64>()
        .ok()
        .filter(|d| d.is_finite() && *d >= 0.0)
}

/// Parses "30/1", "30000/1001" or a plain decimal.
fn parse_frame_rate(rate: &str) -> Option<f64> {
    if let Some((num, den)) = rate.split_once('/') {
        let num: f64 = num.parse().ok()?;
        let den: f64 = den.parse().ok()?;
        if den > 0.0 {
            return Some(num / den);
        }
        return None;
    }
    rate.parse().ok()
}
