use std::path::{Path, PathBuf};

use uuid::Uuid;

use super::encoder::Container;
use super::error::{PipelineError, PipelineResult};
use super::prober::ensure_readable;

pub const POSTER_FILE_NAME: &str = "poster.jpg";
pub const PREVIEW_FILE_NAME: &str = "preview.mp4";

/// Deterministic on-disk layout for a video's inputs and outputs.
///
/// Outputs live at `{media_root}/{video_id}/{label}.{ext}`, next to
/// `poster.jpg` and `preview.mp4`; paths recorded on the video row are
/// relative to `media_root`.
#[derive(Debug, Clone)]
pub struct StorageLayout {
    upload_root: PathBuf,
    media_root: PathBuf,
}

impl StorageLayout {
    pub fn new(upload_root: impl Into<PathBuf>, media_root: impl Into<PathBuf>) -> Self {
        Self {
            upload_root: upload_root.into(),
            media_root: media_root.into(),
        }
    }

    pub fn rendition_relative(video_id: Uuid, label: &str, container: Container) -> String {
        format!("{}/{}.{}", video_id, label, container.extension())
    }

    pub fn rendition_path(&self, video_id: Uuid, label: &str, container: Container) -> PathBuf {
        self.media_root
            .join(Self::rendition_relative(video_id, label, container))
    }

    pub fn poster_relative(video_id: Uuid) -> String {
        format!("{}/{}", video_id, POSTER_FILE_NAME)
    }

    pub fn poster_path(&self, video_id: Uuid) -> PathBuf {
        self.media_root.join(Self::poster_relative(video_id))
    }

    pub fn preview_relative(video_id: Uuid) -> String {
        format!("{}/{}", video_id, PREVIEW_FILE_NAME)
    }

    pub fn preview_path(&self, video_id: Uuid) -> PathBuf {
        self.media_root.join(Self::preview_relative(video_id))
    }

    /// Resolves the `temp_video_file` column against the upload root.
    /// Absolute values are used as they are.
    pub fn source_path(&self, temp_video_file: &str) -> PathBuf {
        let path = Path::new(temp_video_file);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.upload_root.join(path)
        }
    }

    /// Value to record in `temp_video_file` for a file named by an operator.
    ///
    /// The file must exist. It is recorded relative to the upload root when
    /// it lives below it, and as its canonical absolute path otherwise, so
    /// [`source_path`](Self::source_path) resolves it regardless of the
    /// working directory it was named from.
    pub async fn source_reference(&self, file: &Path) -> PipelineResult<String> {
        ensure_readable(file).await?;
        let canonical = tokio::fs::canonicalize(file)
            .await
            .map_err(|source| PipelineError::io(file, source))?;
        if let Ok(root) = tokio::fs::canonicalize(&self.upload_root).await {
            if let Ok(relative) = canonical.strip_prefix(&root) {
                return Ok(relative.to_string_lossy().into_owned());
            }
        }
        Ok(canonical.to_string_lossy().into_owned())
    }
}

/// Size of `path` when it is a regular non-empty file.
pub async fn non_empty_file_size(path: &Path) -> PipelineResult<Option<u64>> {
    match tokio::fs::metadata(path).await {
        Ok(meta) if meta.is_file() && meta.len() > 0 => Ok(Some(meta.len())),
        Ok(_) => Ok(None),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(source) => Err(PipelineError::io(path, source)),
    }
}

/// Removes a file, ignoring one that is already gone.
pub async fn remove_if_exists(path: &Path) -> PipelineResult<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(PipelineError::io(path, source)),
    }
}

pub async fn ensure_parent_dir(path: &Path) -> PipelineResult<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|source| PipelineError::io(parent, source))?;
    }
    Ok(())
}
