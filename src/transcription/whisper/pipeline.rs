#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_possible_truncation)]

use std::path::Path;

use anyhow::{anyhow, bail, Result};
use candle_core::{Device, IndexOp, Tensor, D};
use candle_nn::ops::softmax;
use candle_transformers::models::whisper;
use candle_transformers::models::whisper::quantized_model::Whisper;
use candle_transformers::models::whisper::{
    audio, Config, COMPRESSION_RATIO_THRESHOLD, EOT_TOKEN, HOP_LENGTH, LOGPROB_THRESHOLD,
    NO_SPEECH_THRESHOLD, NO_SPEECH_TOKENS, NO_TIMESTAMPS_TOKEN, SAMPLE_RATE, SOT_TOKEN,
    TEMPERATURES, TRANSCRIBE_TOKEN,
};
use candle_transformers::quantized_var_builder::VarBuilder;
use hf_hub::api::sync::ApiRepo;
use rand::distributions::Distribution;
use rand::rngs::StdRng;
use tokenizers::Tokenizer;
use tracing::{debug, warn};

// Based on https://github.com/huggingface/candle/blob/main/candle-examples/examples/whisper/main.rs
#[derive(Clone)]
pub struct WhisperPipeline {
    model: Whisper,
    tokenizer: Tokenizer,
    config: Config,
    mel_filters: Vec<f32>,
    suppress_tokens: Tensor,
    sot_token: u32,
    transcribe_token: u32,
    eot_token: u32,
    no_speech_token: u32,
    no_timestamps_token: u32,
    rng: StdRng,
}

#[derive(Debug, Clone)]
struct DecodingResult {
    text: String,
    avg_logprob: f64,
    no_speech_prob: f64,
    compression_ratio: f64,
}

impl WhisperPipeline {
    pub fn with_gguf_model(
        repo: &ApiRepo,
        config_filename: &str,
        tokenizer_filename: &str,
        gguf_filename: &str,
        mel_filters_path: &Path,
        rng: StdRng,
    ) -> Result<Self> {
        let config_path = repo.get(config_filename)?;
        let tokenizer_path = repo.get(tokenizer_filename)?;
        let model_path = repo.get(gguf_filename)?;

        let config: Config = serde_json::from_str(&std::fs::read_to_string(config_path)?)?;
        let tokenizer = Tokenizer::from_file(tokenizer_path)
            .map_err(|err| anyhow!("failed to load tokenizer: {err}"))?;

        let vb = VarBuilder::from_gguf(model_path, &Device::Cpu)?;
        let model = Whisper::load(&vb, config.clone())?;

        let mel_bytes = std::fs::read(mel_filters_path).map_err(|err| {
            anyhow!(
                "failed to read mel filters {}: {err}",
                mel_filters_path.display()
            )
        })?;
        let mut mel_filters = vec![0f32; mel_bytes.len() / 4];
        <byteorder::LittleEndian as byteorder::ByteOrder>::read_f32_into(
            &mel_bytes,
            &mut mel_filters,
        );

        let no_timestamps_token = token_id(&tokenizer, NO_TIMESTAMPS_TOKEN)?;
        let suppress_tokens: Vec<f32> = (0..model.config.vocab_size as u32)
            .map(|i| {
                if model.config.suppress_tokens.contains(&i) {
                    f32::NEG_INFINITY
                } else {
                    0f32
                }
            })
            .collect();
        let suppress_tokens = Tensor::new(suppress_tokens.as_slice(), &Device::Cpu)?;
        let Some(no_speech_token) = NO_SPEECH_TOKENS
            .iter()
            .find_map(|token| token_id(&tokenizer, token).ok())
        else {
            bail!("Unable to find any non-speech token")
        };

        Ok(Self {
            sot_token: token_id(&tokenizer, SOT_TOKEN)?,
            transcribe_token: token_id(&tokenizer, TRANSCRIBE_TOKEN)?,
            eot_token: token_id(&tokenizer, EOT_TOKEN)?,
            no_speech_token,
            no_timestamps_token,
            model,
            tokenizer,
            config,
            mel_filters,
            suppress_tokens,
            rng,
        })
    }

    /// Transcribes mono 16 kHz PCM in 30 second mel windows, returning the text of every
    /// window not judged silent.
    pub fn transcribe(&mut self, pcm: &[f32], language: &str) -> Result<Vec<String>> {
        let mel = self.load_mel(pcm)?;
        let (_, _, content_frames) = mel.dims3()?;
        let Ok(language_token) = token_id(&self.tokenizer, &format!("<|{language}|>")) else {
            bail!("language {language} is not supported")
        };

        let mut seek = 0;
        let mut windows = vec![];
        while seek < content_frames {
            let start = (seek * HOP_LENGTH) as f64 / SAMPLE_RATE as f64;
            let window_size = usize::min(content_frames - seek, whisper::N_FRAMES);
            let mel_window = mel.narrow(2, seek, window_size)?;
            let duration = (window_size * HOP_LENGTH) as f64 / SAMPLE_RATE as f64;
            let dr = self.decode_with_fallback(&mel_window, language_token)?;
            seek += window_size;

            if dr.no_speech_prob > NO_SPEECH_THRESHOLD && dr.avg_logprob < LOGPROB_THRESHOLD {
                debug!(start, "No speech detected, skipping window");
                continue;
            }
            debug!("{:.1}s -- {:.1}s: {}", start, start + duration, dr.text);
            windows.push(dr.text);
        }
        Ok(windows)
    }

    fn decode_with_fallback(&mut self, mel: &Tensor, language_token: u32) -> Result<DecodingResult> {
        let (last, retries) = TEMPERATURES
            .split_last()
            .ok_or_else(|| anyhow!("no decoding temperatures configured"))?;
        for &t in retries {
            // On errors or poor output, try again with a higher temperature.
            match self.decode(mel, t, language_token) {
                Ok(dr) => {
                    let needs_fallback = dr.compression_ratio > COMPRESSION_RATIO_THRESHOLD
                        || dr.avg_logprob < LOGPROB_THRESHOLD;
                    if !needs_fallback || dr.no_speech_prob > NO_SPEECH_THRESHOLD {
                        return Ok(dr);
                    }
                }
                Err(err) => warn!("Error decoding at temperature {t}: {err}"),
            }
        }
        self.decode(mel, *last, language_token)
    }

    fn decode(&mut self, mel: &Tensor, t: f64, language_token: u32) -> Result<DecodingResult> {
        let model = &mut self.model;
        let audio_features = model.encoder.forward(mel, true)?;

        let sample_len = model.config.max_target_positions / 2;
        let mut sum_logprob = 0f64;
        let mut no_speech_prob = f64::NAN;
        let mut tokens = vec![
            self.sot_token,
            language_token,
            self.transcribe_token,
            self.no_timestamps_token,
        ];

        for i in 0..sample_len {
            // The decoder expects a batch dimension.
            let tokens_t = Tensor::new(tokens.as_slice(), mel.device())?.unsqueeze(0)?;
            let ys = model.decoder.forward(&tokens_t, &audio_features, i == 0)?;

            if i == 0 {
                let logits = model.decoder.final_linear(&ys.i(..1)?)?.i(0)?.i(0)?;
                no_speech_prob = f64::from(
                    softmax(&logits, 0)?
                        .i(self.no_speech_token as usize)?
                        .to_scalar::<f32>()?,
                );
            }

            let (_, seq_len, _) = ys.dims3()?;
            let logits = model
                .decoder
                .final_linear(&ys.i((..1, seq_len - 1..))?)?
                .i(0)?
                .i(0)?
                .broadcast_add(&self.suppress_tokens)?;
            let next_token = if t > 0f64 {
                let prs: Vec<f32> = softmax(&(&logits / t)?, 0)?.to_vec1()?;
                let distr = rand::distributions::WeightedIndex::new(&prs)?;
                u32::try_from(distr.sample(&mut self.rng))?
            } else {
                let logits_v: Vec<f32> = logits.to_vec1()?;
                logits_v
                    .iter()
                    .enumerate()
                    .max_by(|(_, u), (_, v)| u.total_cmp(v))
                    .map(|(i, _)| i as u32)
                    .ok_or_else(|| anyhow!("empty logits"))?
            };
            tokens.push(next_token);
            let prob = f64::from(
                softmax(&logits, D::Minus1)?
                    .i(next_token as usize)?
                    .to_scalar::<f32>()?,
            );
            if next_token == self.eot_token || tokens.len() > model.config.max_target_positions {
                break;
            }
            sum_logprob += prob.ln();
        }

        let text = self
            .tokenizer
            .decode(&tokens, true)
            .map_err(|err| anyhow!("failed to decode tokens: {err}"))?;
        Ok(DecodingResult {
            text,
            avg_logprob: sum_logprob / tokens.len() as f64,
            no_speech_prob,
            compression_ratio: f64::NAN,
        })
    }

    fn load_mel(&self, pcm: &[f32]) -> Result<Tensor> {
        let mel = audio::pcm_to_mel(&self.config, pcm, &self.mel_filters);
        let mel_len = mel.len();
        let mel = Tensor::from_vec(
            mel,
            (
                1,
                self.config.num_mel_bins,
                mel_len / self.config.num_mel_bins,
            ),
            &Device::Cpu,
        )?;
        Ok(mel)
    }
}

fn token_id(tokenizer: &Tokenizer, token: &str) -> Result<u32> {
    tokenizer
        .token_to_id(token)
        .ok_or_else(|| anyhow!("no token-id for {token}"))
}
