use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info};

use crate::media::command::CommandRunner;
use crate::pipeline::error::{PipelineError, PipelineResult};

const SEGMENT_PREFIX: &str = "segment_";
const DEFAULT_EXTENSION: &str = "webm";

/// Losslessly cuts a recording into fixed-length pieces with ffmpeg's segment muxer.
#[derive(Clone)]
pub struct Segmenter {
    runner: Arc<dyn CommandRunner>,
    ffmpeg: String,
}

impl Segmenter {
    pub fn new(runner: Arc<dyn CommandRunner>, ffmpeg: impl Into<String>) -> Self {
        Self {
            runner,
            ffmpeg: ffmpeg.into(),
        }
    }

    /// Splits `source` into pieces of at most `max_segment_secs` written to `out_dir`, and
    /// returns them in playback order. An empty list is a legal outcome.
    #[tracing::instrument(level = "info", skip(self))]
    pub async fn split(
        &self,
        source: &Path,
        max_segment_secs: u32,
        out_dir: &Path,
    ) -> PipelineResult<Vec<PathBuf>> {
        let extension = source
            .extension()
            .and_then(|ext| ext.to_str())
            .unwrap_or(DEFAULT_EXTENSION);
        let pattern = out_dir.join(format!("{SEGMENT_PREFIX}%03d.{extension}"));
        let segment_time = max_segment_secs.to_string();

        let mut args: Vec<OsString> = vec!["-nostdin".into(), "-hide_banner".into(), "-y".into()];
        args.push("-i".into());
        args.push(source.as_os_str().to_owned());
        args.extend(
            [
                "-f",
                "segment",
                "-segment_time",
                segment_time.as_str(),
                "-c",
                "copy",
                "-reset_timestamps",
                "1",
            ]
            .map(OsString::from),
        );
        args.push(pattern.into_os_string());

        let output = self
            .runner
            .run(&self.ffmpeg, &args)
            .await
            .map_err(|err| PipelineError::Split(format!("could not run {}: {err}", self.ffmpeg)))?;
        if !output.success {
            return Err(PipelineError::Split(output.describe_failure()));
        }

        let segments = list_segments(out_dir, extension).await?;
        info!(count = segments.len(), "Split audio into segments");
        Ok(segments)
    }
}

async fn list_segments(out_dir: &Path, extension: &str) -> PipelineResult<Vec<PathBuf>> {
    let mut entries = tokio::fs::read_dir(out_dir)
        .await
        .map_err(|err| listing_error(out_dir, err))?;

    let mut indexed = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|err| listing_error(out_dir, err))?
    {
        let path = entry.path();
        match segment_index(&path, extension) {
            Some(index) => indexed.push((index, path)),
            None => debug!(path = %path.display(), "Ignoring non-segment file"),
        }
    }
    indexed.sort_by_key(|(index, _)| *index);
    Ok(indexed.into_iter().map(|(_, path)| path).collect())
}

fn listing_error(out_dir: &Path, err: std::io::Error) -> PipelineError {
    PipelineError::Split(format!("cannot list {}: {err}", out_dir.display()))
}

/// Parses the numeric suffix of `segment_NNN.<extension>`. Ordering by the parsed number
/// keeps playback order even once the counter outgrows its zero padding.
fn segment_index(path: &Path, extension: &str) -> Option<u64> {
    if path.extension()?.to_str()? != extension {
        return None;
    }
    path.file_stem()?
        .to_str()?
        .strip_prefix(SEGMENT_PREFIX)?
        .parse()
        .ok()
}
