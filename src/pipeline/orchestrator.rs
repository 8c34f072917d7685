use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Serialize, Serializer};
use tracing::{info, warn};

use crate::media::{DurationProber, Segmenter};
use crate::pipeline::error::{PipelineError, PipelineResult};
use crate::pipeline::upload::{MediaFile, Upload, Workspace};
use crate::transcription::TranscriptionDispatcher;

/// Duration as reported back to the client.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ReportedDuration {
    Seconds(f64),
    /// No strategy could measure the file, but a single engine call handled it.
    Unknown,
    /// No strategy could measure the file and it had to be split blindly.
    UnknownSegmented,
}

impl Serialize for ReportedDuration {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            ReportedDuration::Seconds(secs) => serializer.serialize_f64(*secs),
            ReportedDuration::Unknown => serializer.serialize_str("unknown"),
            ReportedDuration::UnknownSegmented => serializer.serialize_str("unknown (segmented)"),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TranscriptionResult {
    pub filename: Option<String>,
    pub duration: ReportedDuration,
    pub transcription: String,
}

#[derive(Debug, Clone, Copy)]
pub struct SegmentPolicy {
    /// Files up to this length are transcribed in one call; longer ones are cut to this length.
    pub max_segment_secs: u32,
    /// Segment length used when the duration could not be determined.
    pub fallback_segment_secs: u32,
}

impl Default for SegmentPolicy {
    fn default() -> Self {
        Self {
            max_segment_secs: 20,
            fallback_segment_secs: 20,
        }
    }
}

/// Drives one upload from validation to assembled text.
pub struct TranscriptionPipeline {
    prober: DurationProber,
    segmenter: Segmenter,
    dispatcher: Arc<TranscriptionDispatcher>,
    policy: SegmentPolicy,
    work_root: PathBuf,
}

impl TranscriptionPipeline {
    pub fn new(
        prober: DurationProber,
        segmenter: Segmenter,
        dispatcher: Arc<TranscriptionDispatcher>,
        policy: SegmentPolicy,
        work_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            prober,
            segmenter,
            dispatcher,
            policy,
            work_root: work_root.into(),
        }
    }

    pub fn dispatcher(&self) -> &TranscriptionDispatcher {
        &self.dispatcher
    }

    /// Validates an incoming file and opens its workspace. Rejected files never touch disk.
    pub async fn accept(&self, media: MediaFile) -> PipelineResult<Upload> {
        Upload::create(&self.work_root, media).await
    }

    /// Transcribes a fully received upload. The upload's workspace is removed before this
    /// returns, whatever the outcome.
    #[tracing::instrument(level = "info", skip_all, fields(filename = ?upload.media().filename))]
    pub async fn run(&self, upload: Upload) -> PipelineResult<TranscriptionResult> {
        let (media, workspace, input) = upload.into_parts();
        let outcome = self.transcribe_input(&input, &workspace).await;
        workspace.release().await;

        let (duration, transcription) = outcome?;
        info!(?duration, chars = transcription.len(), "Transcription complete");
        Ok(TranscriptionResult {
            filename: media.filename,
            duration,
            transcription,
        })
    }

    async fn transcribe_input(
        &self,
        input: &Path,
        workspace: &Workspace,
    ) -> PipelineResult<(ReportedDuration, String)> {
        self.dispatcher.ensure_available()?;
        let max_segment_secs = self.policy.max_segment_secs;

        match self.prober.probe(input).await {
            Ok(duration) if duration.as_secs() <= f64::from(max_segment_secs) => {
                info!(
                    duration = duration.as_secs(),
                    "Audio fits in one segment, transcribing directly"
                );
                let text = self.dispatcher.transcribe(input).await?;
                Ok((ReportedDuration::Seconds(duration.as_secs()), text))
            }
            Ok(duration) => {
                info!(
                    duration = duration.as_secs(),
                    max_segment_secs, "Audio exceeds segment length, splitting"
                );
                let text = self
                    .transcribe_segments(input, max_segment_secs, workspace)
                    .await?;
                Ok((ReportedDuration::Seconds(duration.as_secs()), text))
            }
            Err(PipelineError::DurationUnknown(reason)) => {
                warn!(%reason, "Duration unknown, attempting direct transcription");
                match self.dispatcher.transcribe(input).await {
                    Ok(text) => Ok((ReportedDuration::Unknown, text)),
                    Err(PipelineError::Transcription(cause)) => {
                        let fallback = self.policy.fallback_segment_secs;
                        warn!(%cause, fallback, "Direct transcription failed, splitting blindly");
                        let text = self.transcribe_segments(input, fallback, workspace).await?;
                        Ok((ReportedDuration::UnknownSegmented, text))
                    }
                    Err(err) => Err(err),
                }
            }
            Err(err) => Err(err),
        }
    }

    async fn transcribe_segments(
        &self,
        input: &Path,
        segment_secs: u32,
        workspace: &Workspace,
    ) -> PipelineResult<String> {
        let out_dir = workspace.segments_dir();
        tokio::fs::create_dir_all(&out_dir).await?;

        let segments = self.segmenter.split(input, segment_secs, &out_dir).await?;
        if segments.is_empty() {
            return Err(PipelineError::Split(format!(
                "ffmpeg produced no segments for {}",
                input.display()
            )));
        }

        let total = segments.len();
        let mut texts = Vec::with_capacity(total);
        for (index, segment) in segments.iter().enumerate() {
            info!("Transcribing segment {}/{}", index + 1, total);
            texts.push(self.dispatcher.transcribe(segment).await?);
        }
        Ok(texts.join(" "))
    }
}
