use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use axum_server::tls_rustls::RustlsConfig;
use axum_server::Handle;
use clap::Parser;
use clap_serde_derive::ClapSerde;
use hf_hub::api::sync::Api;
use tracing::{error, info, warn};

use transcription_runner::api::{self, AppState, ShellLimits};
use transcription_runner::config::{Config, DEFAULT_CONFIG_FILE};
use transcription_runner::media::{DurationProber, Segmenter, SystemCommandRunner};
use transcription_runner::pipeline::TranscriptionPipeline;
use transcription_runner::telemetry::init_telemetry;
use transcription_runner::transcription::{EngineState, TranscriptionDispatcher, WhisperEngine};

#[cfg(unix)]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file
    #[arg(short, long, env, default_value = DEFAULT_CONFIG_FILE)]
    config_file: String,

    /// Configuration options
    #[command(flatten)]
    pub opt_config: <Config as ClapSerde>::Opt,
}

macro_rules! exit_err {
    ($code:expr, $fmt:expr $(, $arg:expr)*) => {
        {
            error!($fmt $(, $arg)*);
            std::process::exit($code);
        }
    };
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = match Config::from_toml(&args.config_file) {
        Ok(conf) => conf.merge(args.opt_config),
        Err(err) => {
            if args.config_file == DEFAULT_CONFIG_FILE {
                Config::default().merge(args.opt_config)
            } else {
                eprintln!(
                    "Failed to read configuration file {} with error: {err:#}",
                    args.config_file
                );
                std::process::exit(1);
            }
        }
    };

    init_telemetry(config.otlp_endpoint(), config.console_log)?;
    if let Err(err) = config.validate() {
        exit_err!(1, "Invalid configuration: {}", err);
    }

    info!(
        "Supported features: avx: {}, neon: {}, simd128: {}, f16c: {}",
        candle_core::utils::with_avx(),
        candle_core::utils::with_neon(),
        candle_core::utils::with_simd128(),
        candle_core::utils::with_f16c()
    );

    let engine = load_engine(&config).await;
    if let Some(reason) = engine.load_error() {
        if config.require_engine {
            exit_err!(1, "Failed to load transcription engine: {}", reason);
        }
        warn!(%reason, "Transcription engine unavailable, serving in degraded mode");
    }

    let runner = Arc::new(SystemCommandRunner);
    let tools = config.media_tools();
    let pipeline = TranscriptionPipeline::new(
        DurationProber::new(runner.clone(), tools.clone()),
        Segmenter::new(runner, tools.ffmpeg),
        Arc::new(TranscriptionDispatcher::new(
            engine,
            config.model_name.clone(),
            config.max_concurrent_transcriptions,
        )),
        config.segment_policy(),
        config.work_root(),
    );
    let router = api::router(
        AppState {
            pipeline: Arc::new(pipeline),
        },
        ShellLimits {
            max_upload_bytes: config.max_upload_bytes,
            request_timeout: config.request_timeout(),
        },
    );

    let addr: SocketAddr = match format!("{}:{}", config.address, config.port).parse() {
        Ok(addr) => addr,
        Err(err) => exit_err!(1, "Invalid listen address {}: {}", config.address, err),
    };
    let handle = Handle::new();
    tokio::spawn(shutdown_signal(handle.clone()));

    if config.dev_mode {
        warn!("Development mode enabled, serving plain HTTP");
        info!("Listening on http://{}", addr);
        axum_server::bind(addr)
            .handle(handle)
            .serve(router.into_make_service())
            .await?;
    } else {
        for path in [&config.tls_cert_path, &config.tls_key_path] {
            if !Path::new(path).exists() {
                exit_err!(1, "TLS file {} not found, HTTPS is required outside dev mode", path);
            }
        }
        let tls = RustlsConfig::from_pem_file(&config.tls_cert_path, &config.tls_key_path).await?;
        info!("Listening on https://{}", addr);
        axum_server::bind_rustls(addr, tls)
            .handle(handle)
            .serve(router.into_make_service())
            .await?;
    }
    Ok(())
}

/// Loads the engine on the blocking pool. Failures leave the service running without it.
async fn load_engine(config: &Config) -> EngineState {
    let base = config.model_base();
    let files = config.whisper_files();
    let language = config.language.clone();
    let ffmpeg = config.ffmpeg_path.clone();

    let loaded = tokio::task::spawn_blocking(move || -> Result<WhisperEngine> {
        let api = Api::new()?;
        WhisperEngine::new(&api, &base, &files, &language, &ffmpeg)
    })
    .await;

    match loaded {
        Ok(Ok(engine)) => {
            info!("Transcription engine loaded");
            EngineState::Ready(Arc::new(engine))
        }
        Ok(Err(err)) => EngineState::Unavailable(format!("{err:#}")),
        Err(err) => EngineState::Unavailable(format!("engine loader aborted: {err}")),
    }
}

async fn shutdown_signal(handle: Handle) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for shutdown signal: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
    info!("Shutting down...");
    handle.graceful_shutdown(Some(SHUTDOWN_GRACE));
}
