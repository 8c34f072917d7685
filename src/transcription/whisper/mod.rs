use std::path::{Path, PathBuf};

use anyhow::Result;
use hf_hub::api::sync::Api;
use hf_hub::{Repo, RepoType};
use rand::SeedableRng;

use crate::transcription::engine::{ModelBase, SpeechEngine};
use crate::transcription::whisper::pcm_decode::pcm_decode;
use crate::transcription::whisper::pipeline::WhisperPipeline;

mod pcm_decode;
mod pipeline;

/// Files the Whisper engine pulls from its model repository, plus the local mel filter bank.
#[derive(Debug, Clone)]
pub struct WhisperFiles {
    pub config: String,
    pub tokenizer: String,
    pub weights: String,
    pub mel_filters: PathBuf,
}

/// Quantized Whisper running on the CPU through candle.
///
/// Audio is decoded and resampled by ffmpeg, so any container it reads is accepted. Each call
/// works on its own copy of the decoder state, so concurrent calls never observe each other's
/// key/value caches.
pub struct WhisperEngine {
    pipeline: WhisperPipeline,
    language: String,
    ffmpeg: String,
}

impl WhisperEngine {
    #[tracing::instrument(level = "info", skip(api))]
    pub fn new(
        api: &Api,
        base: &ModelBase,
        files: &WhisperFiles,
        language: &str,
        ffmpeg: &str,
    ) -> Result<Self> {
        let repo = api.repo(Repo::with_revision(
            base.repo_id.clone(),
            RepoType::Model,
            base.repo_revision.clone(),
        ));
        let pipeline = WhisperPipeline::with_gguf_model(
            &repo,
            &files.config,
            &files.tokenizer,
            &files.weights,
            &files.mel_filters,
            rand::rngs::StdRng::from_seed([0; 32]),
        )?;

        Ok(Self {
            pipeline,
            language: language.to_owned(),
            ffmpeg: ffmpeg.to_owned(),
        })
    }
}

impl SpeechEngine for WhisperEngine {
    #[tracing::instrument(level = "info", skip(self))]
    fn transcribe(&self, audio: &Path) -> Result<String> {
        let pcm = pcm_decode(&self.ffmpeg, audio)?;
        let windows = self.pipeline.clone().transcribe(&pcm, &self.language)?;

        Ok(windows
            .iter()
            .map(|text| text.trim())
            .filter(|text| !text.is_empty())
            .collect::<Vec<_>>()
            .join(" "))
    }
}
