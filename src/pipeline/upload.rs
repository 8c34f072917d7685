use std::path::{Path, PathBuf};

use tempfile::TempDir;
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::{debug, warn};

use crate::pipeline::error::{PipelineError, PipelineResult};

/// Extensions accepted even when the client sends no usable content type.
pub const AUDIO_EXTENSIONS: [&str; 13] = [
    "webm", "weba", "wav", "wave", "mp3", "ogg", "oga", "opus", "flac", "m4a", "aac", "mka", "mp4",
];

/// Container assumed for uploads whose name carries no recognized extension.
pub const DEFAULT_EXTENSION: &str = "webm";

const WORKSPACE_PREFIX: &str = "transcription-";
const INPUT_STEM: &str = "input";
const SEGMENTS_DIR: &str = "segments";

/// What the client told us about an uploaded file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MediaFile {
    pub filename: Option<String>,
    pub content_type: Option<String>,
    pub size: u64,
}

impl MediaFile {
    pub fn new(filename: Option<String>, content_type: Option<String>) -> Self {
        Self {
            filename,
            content_type,
            size: 0,
        }
    }

    /// The filename's extension, if it is one of [`AUDIO_EXTENSIONS`].
    pub fn audio_extension(&self) -> Option<&'static str> {
        let (_, extension) = self.filename.as_deref()?.rsplit_once('.')?;
        let extension = extension.to_ascii_lowercase();
        AUDIO_EXTENSIONS
            .iter()
            .find(|known| **known == extension)
            .copied()
    }

    pub fn stored_extension(&self) -> &'static str {
        self.audio_extension().unwrap_or(DEFAULT_EXTENSION)
    }

    fn has_audio_content_type(&self) -> bool {
        self.content_type.as_deref().is_some_and(|content_type| {
            content_type
                .get(..6)
                .is_some_and(|family| family.eq_ignore_ascii_case("audio/"))
        })
    }

    pub fn validate(&self) -> PipelineResult<()> {
        if self.has_audio_content_type() || self.audio_extension().is_some() {
            return Ok(());
        }
        Err(PipelineError::UnsupportedMediaType(format!(
            "only audio files (preferably WebM) are supported, got {} ({})",
            self.content_type.as_deref().unwrap_or("no content type"),
            self.filename.as_deref().unwrap_or("unnamed upload"),
        )))
    }
}

/// Request-scoped scratch directory, removed with everything in it on [`Workspace::release`]
/// or drop. Removal runs on the blocking pool whenever a runtime is available.
#[derive(Debug)]
pub struct Workspace {
    path: PathBuf,
    dir: Option<TempDir>,
}

impl Workspace {
    pub async fn create_in(root: &Path) -> PipelineResult<Self> {
        let root = root.to_path_buf();
        let dir = tokio::task::spawn_blocking(move || {
            std::fs::create_dir_all(&root)?;
            tempfile::Builder::new()
                .prefix(WORKSPACE_PREFIX)
                .tempdir_in(&root)
        })
        .await
        .map_err(|err| PipelineError::Processing(format!("workspace setup aborted: {err}")))??;

        debug!(path = %dir.path().display(), "Created request workspace");
        Ok(Self {
            path: dir.path().to_path_buf(),
            dir: Some(dir),
        })
    }

    pub fn input_path(&self, extension: &str) -> PathBuf {
        self.path.join(format!("{INPUT_STEM}.{extension}"))
    }

    pub fn segments_dir(&self) -> PathBuf {
        self.path.join(SEGMENTS_DIR)
    }

    /// Removes the workspace now, logging instead of failing if the removal is incomplete.
    pub async fn release(mut self) {
        let Some(dir) = self.dir.take() else {
            return;
        };
        match tokio::task::spawn_blocking(move || dir.close()).await {
            Ok(Ok(())) => debug!(path = %self.path.display(), "Removed request workspace"),
            Ok(Err(err)) => {
                warn!(path = %self.path.display(), error = %err, "Failed to remove request workspace")
            }
            Err(err) => {
                warn!(path = %self.path.display(), error = %err, "Workspace removal aborted")
            }
        }
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        let Some(dir) = self.dir.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(move || drop(dir));
            }
            Err(_) => drop(dir),
        }
    }
}

/// An accepted upload being materialized inside its own [`Workspace`].
#[derive(Debug)]
pub struct Upload {
    media: MediaFile,
    workspace: Workspace,
    input: PathBuf,
    sink: Option<BufWriter<File>>,
}

impl Upload {
    /// Validates `media` and prepares an empty input file for it. Nothing is written to disk
    /// for uploads that fail validation.
    pub async fn create(root: &Path, media: MediaFile) -> PipelineResult<Self> {
        media.validate()?;
        let workspace = Workspace::create_in(root).await?;
        let input = workspace.input_path(media.stored_extension());
        let file = File::create(&input).await.map_err(save_error)?;
        Ok(Self {
            media,
            workspace,
            input,
            sink: Some(BufWriter::new(file)),
        })
    }

    pub async fn append(&mut self, chunk: &[u8]) -> PipelineResult<()> {
        let sink = self
            .sink
            .as_mut()
            .ok_or_else(|| PipelineError::Processing("upload already finished".into()))?;
        sink.write_all(chunk).await.map_err(save_error)?;
        self.media.size += chunk.len() as u64;
        Ok(())
    }

    /// Flushes and closes the input file.
    pub async fn finish(&mut self) -> PipelineResult<()> {
        if let Some(mut sink) = self.sink.take() {
            sink.flush().await.map_err(save_error)?;
            sink.into_inner().sync_all().await.map_err(save_error)?;
        }
        debug!(size = self.media.size, path = %self.input.display(), "Saved upload");
        Ok(())
    }

    pub fn media(&self) -> &MediaFile {
        &self.media
    }

    pub fn input_path(&self) -> &Path {
        &self.input
    }

    pub(crate) fn into_parts(self) -> (MediaFile, Workspace, PathBuf) {
        (self.media, self.workspace, self.input)
    }
}

fn save_error(err: std::io::Error) -> PipelineError {
    PipelineError::Processing(format!("Error saving file: {err}"))
}
