use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Result};
use clap_serde_derive::ClapSerde;

use crate::media::MediaTools;
use crate::pipeline::SegmentPolicy;
use crate::transcription::{ModelBase, WhisperFiles};

pub const DEFAULT_CONFIG_FILE: &str = "TranscriptionRunner.toml";

#[derive(ClapSerde, Debug, Clone)]
pub struct Config {
    /// The address the listener binds to
    #[default(String::from("0.0.0.0"))]
    #[arg(short, long, env)]
    pub address: String,

    /// The port the listener binds to
    #[default(4443)]
    #[arg(short, long, env)]
    pub port: u16,

    /// Recordings up to this many seconds are transcribed in one call, longer ones are split
    #[default(20)]
    #[arg(long, env)]
    pub max_segment_secs: u32,

    /// Segment length used when the duration of a recording cannot be determined
    #[default(20)]
    #[arg(long, env)]
    pub fallback_segment_secs: u32,

    /// Maximum number of engine calls running at the same time
    #[default(4)]
    #[arg(long, env)]
    pub max_concurrent_transcriptions: usize,

    /// Exit at startup if the engine fails to load instead of serving in degraded mode
    #[default(false)]
    #[arg(long, env)]
    pub require_engine: bool,

    /// Upper bound on the time spent answering a single request
    #[default(300)]
    #[arg(long, env)]
    pub request_timeout_secs: u64,

    /// Largest accepted request body in bytes
    #[default(104_857_600)]
    #[arg(long, env)]
    pub max_upload_bytes: usize,

    /// Serve plain HTTP instead of HTTPS
    #[default(false)]
    #[arg(long, env)]
    pub dev_mode: bool,

    /// PEM certificate chain used for HTTPS
    #[default(String::from("/app/certs/fullchain.pem"))]
    #[arg(long, env = "SSL_CERT_PATH")]
    pub tls_cert_path: String,

    /// PEM private key used for HTTPS
    #[default(String::from("/app/certs/privkey.pem"))]
    #[arg(long, env = "SSL_KEY_PATH")]
    pub tls_key_path: String,

    /// Directory holding per-request workspaces, the system temp dir when empty
    #[default(String::new())]
    #[arg(long, env)]
    pub work_dir: String,

    #[default(String::from("ffprobe"))]
    #[arg(long, env)]
    pub ffprobe_path: String,

    #[default(String::from("ffmpeg"))]
    #[arg(long, env)]
    pub ffmpeg_path: String,

    #[default(String::from("mediainfo"))]
    #[arg(long, env)]
    pub mediainfo_path: String,

    /// The name of the model, reported by the health endpoint
    #[default(String::from("Candle Whisper"))]
    #[arg(long, env)]
    pub model_name: String,

    #[default(String::from("lmz/candle-whisper"))]
    #[arg(long, env)]
    pub model_repo: String,

    #[default(String::from("main"))]
    #[arg(long, env)]
    pub model_revision: String,

    #[default(String::from("config-tiny.json"))]
    #[arg(long, env)]
    pub model_config_file: String,

    #[default(String::from("tokenizer-tiny.json"))]
    #[arg(long, env)]
    pub model_tokenizer_file: String,

    #[default(String::from("model-tiny-q4k.gguf"))]
    #[arg(long, env)]
    pub model_weights_file: String,

    /// Local path of the mel filter bank matching the model
    #[default(String::from("melfilters.bytes"))]
    #[arg(long, env)]
    pub mel_filters_file: String,

    /// Language token passed to the engine
    #[default(String::from("en"))]
    #[arg(long, env)]
    pub language: String,

    /// OpenTelemetry collector endpoint, tracing is exported only when set
    #[default(String::new())]
    #[arg(long, env)]
    pub otlp_endpoint: String,

    /// Also log to stdout when exporting to a collector
    #[default(true)]
    #[arg(long, env)]
    pub console_log: bool,
}

impl Config {
    pub fn from_toml(path: &str) -> Result<Self> {
        let str = std::fs::read_to_string(path)?;
        let opt: <Config as ClapSerde>::Opt = toml::from_str(&str)?;
        Ok(Config::from(opt))
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_segment_secs == 0 {
            bail!("max_segment_secs must be greater than zero")
        }
        if self.fallback_segment_secs == 0 {
            bail!("fallback_segment_secs must be greater than zero")
        }
        if self.max_concurrent_transcriptions == 0 {
            bail!("max_concurrent_transcriptions must be greater than zero")
        }
        Ok(())
    }

    pub fn segment_policy(&self) -> SegmentPolicy {
        SegmentPolicy {
            max_segment_secs: self.max_segment_secs,
            fallback_segment_secs: self.fallback_segment_secs,
        }
    }

    pub fn media_tools(&self) -> MediaTools {
        MediaTools {
            ffprobe: self.ffprobe_path.clone(),
            ffmpeg: self.ffmpeg_path.clone(),
            mediainfo: self.mediainfo_path.clone(),
        }
    }

    pub fn model_base(&self) -> ModelBase {
        ModelBase {
            name: self.model_name.clone(),
            license: "MIT".into(),
            repo_id: self.model_repo.clone(),
            repo_revision: self.model_revision.clone(),
        }
    }

    pub fn whisper_files(&self) -> WhisperFiles {
        WhisperFiles {
            config: self.model_config_file.clone(),
            tokenizer: self.model_tokenizer_file.clone(),
            weights: self.model_weights_file.clone(),
            mel_filters: PathBuf::from(&self.mel_filters_file),
        }
    }

    pub fn work_root(&self) -> PathBuf {
        if self.work_dir.is_empty() {
            std::env::temp_dir()
        } else {
            PathBuf::from(&self.work_dir)
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn otlp_endpoint(&self) -> Option<&str> {
        Some(self.otlp_endpoint.as_str()).filter(|endpoint| !endpoint.is_empty())
    }
}
