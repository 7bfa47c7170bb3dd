use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use super::error::{PipelineError, PipelineResult};
use super::prober::{ensure_readable, MediaInfo, MediaProber};
use super::runner::{Invocation, TransformRunner};
use super::storage::{ensure_parent_dir, non_empty_file_size, remove_if_exists};
use crate::config::PosterConfig;

/// A verified poster image on disk.
#[derive(Debug, Clone, PartialEq)]
pub struct Poster {
    pub path: PathBuf,
    pub offset_secs: f64,
}

#[derive(Clone)]
pub struct PosterExtractor {
    runner: Arc<dyn TransformRunner>,
    prober: MediaProber,
    ffmpeg_path: String,
    timeout: Duration,
    settings: PosterConfig,
}

/// Picks the timestamp the poster frame is taken from.
///
/// With a known duration the offset always lies in `[0, duration)`: a
/// requested offset outside that range falls back to 0, and without a request
/// `offset_ratio` of the duration is used. With an unknown or zero duration
/// the request (or `fallback_offset_secs`) is used as is.
pub fn select_offset(duration: Option<f64>, requested: Option<f64>, settings: &PosterConfig) -> f64 {
    match duration.filter(|d| *d > 0.0) {
        Some(duration) => match requested {
            Some(at) if at >= 0.0 && at < duration => at,
            Some(_) => 0.0,
            None => {
                let at = duration * settings.offset_ratio.clamp(0.0, 1.0);
                if at < duration {
                    at
                } else {
                    0.0
                }
            }
        },
        None => requested
            .unwrap_or(settings.fallback_offset_secs)
            .max(0.0),
    }
}

/// ffmpeg `-q:v` for a 0-100 JPEG quality setting.
fn jpeg_qscale(quality: u32) -> u32 {
    let q = 31.0 - f64::from(quality.min(100)) * 0.29;
    q.round().max(2.0) as u32
}

impl PosterExtractor {
    pub fn new(
        runner: Arc<dyn TransformRunner>,
        prober: MediaProber,
        ffmpeg_path: String,
        timeout: Duration,
        settings: PosterConfig,
    ) -> Self {
        Self {
            runner,
            prober,
            ffmpeg_path,
            timeout,
            settings,
        }
    }

    /// Extracts one frame of `source` to `dest`; true iff `dest` then exists
    /// with a non-zero size.
    pub async fn extract_poster(&self, source: &Path, dest: &Path) -> PipelineResult<bool> {
        Ok(self.extract(source, dest, None, None).await?.is_some())
    }

    /// Like [`extract_poster`](Self::extract_poster) with an explicit offset
    /// request and, when available, already probed metadata.
    ///
    /// Expected failures (undecodable stream, no frame at the offset) return
    /// `Ok(None)`; a missing source, I/O trouble, timeouts and crashed
    /// processes are errors.
    pub async fn extract(
        &self,
        source: &Path,
        dest: &Path,
        requested: Option<f64>,
        media: Option<&MediaInfo>,
    ) -> PipelineResult<Option<Poster>> {
        ensure_readable(source).await?;

        let duration = match media {
            Some(info) => info.duration,
            None => match self.prober.probe(source).await {
                Ok(info) => info.duration,
                Err(PipelineError::UnreadableMedia { reason, .. }) => {
                    log::warn!(
                        "probe of {} failed ({}), using fallback poster offset",
                        source.display(),
                        reason
                    );
                    None
                }
                Err(err) => return Err(err),
            },
        };

        ensure_parent_dir(dest).await?;
        let offset = select_offset(duration, requested, &self.settings);
        if let Some(poster) = self.grab_frame(source, dest, offset).await? {
            return Ok(Some(poster));
        }
        // Nothing decoded at the offset (often past the real end of stream).
        if offset > 0.0 {
            log::info!(
                "no frame at {:.3}s in {}, retrying at 0s",
                offset,
                source.display()
            );
            return self.grab_frame(source, dest, 0.0).await;
        }
        Ok(None)
    }

    async fn grab_frame(
        &self,
        source: &Path,
        dest: &Path,
        offset: f64,
    ) -> PipelineResult<Option<Poster>> {
        let (w, h) = (self.settings.width, self.settings.height);
        let filter = format!(
            "scale={w}:{h}:force_original_aspect_ratio=decrease,pad={w}:{h}:(ow-iw)/2:(oh-ih)/2"
        );
        let invocation = Invocation::new(&self.ffmpeg_path, self.timeout)
            .args(["-hide_banner", "-nostdin", "-loglevel", "error"])
            .arg("-ss")
            .arg(format!("{offset:.3}"))
            .arg("-i")
            .arg(source)
            .args(["-frames:v", "1", "-an", "-vf"])
            .arg(filter)
            .arg("-q:v")
            .arg(jpeg_qscale(self.settings.quality).to_string())
            .arg("-y")
            .arg(dest);

        match self.runner.run(&invocation).await {
            Ok(_) => {}
            Err(PipelineError::TransformFailed { code, stderr, .. }) => {
                log::warn!(
                    "poster extraction from {} exited with {}: {}",
                    source.display(),
                    code,
                    stderr
                );
                remove_if_exists(dest).await?;
                return Ok(None);
            }
            Err(err) => {
                remove_if_exists(dest).await?;
                return Err(err);
            }
        }

        match non_empty_file_size(dest).await? {
            Some(_) => Ok(Some(Poster {
                path: dest.to_path_buf(),
                offset_secs: offset,
            })),
            None => {
                remove_if_exists(dest).await?;
                Ok(None)
            }
        }
    }
}
