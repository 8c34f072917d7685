use std::path::Path;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tracing::debug;

use crate::pipeline::error::{PipelineError, PipelineResult};
use crate::transcription::engine::SpeechEngine;

/// Outcome of loading the engine at startup. Never changes afterwards.
#[derive(Clone)]
pub enum EngineState {
    Ready(Arc<dyn SpeechEngine>),
    Unavailable(String),
}

impl EngineState {
    pub fn load_error(&self) -> Option<&str> {
        match self {
            EngineState::Ready(_) => None,
            EngineState::Unavailable(reason) => Some(reason.as_str()),
        }
    }
}

/// Funnels every engine call through a process-wide counting gate and runs it on the
/// blocking pool so slow transcriptions never stall the async workers.
pub struct TranscriptionDispatcher {
    engine: EngineState,
    model: String,
    gate: Arc<Semaphore>,
    capacity: usize,
}

impl TranscriptionDispatcher {
    pub fn new(engine: EngineState, model: impl Into<String>, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            engine,
            model: model.into(),
            gate: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn engine_state(&self) -> &EngineState {
        &self.engine
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Gate units not currently held by an engine call.
    pub fn idle_slots(&self) -> usize {
        self.gate.available_permits()
    }

    pub fn ensure_available(&self) -> PipelineResult<Arc<dyn SpeechEngine>> {
        match &self.engine {
            EngineState::Ready(engine) => Ok(engine.clone()),
            EngineState::Unavailable(reason) => {
                Err(PipelineError::EngineUnavailable(reason.clone()))
            }
        }
    }

    /// Transcribes one file. The gate unit moves into the blocking task, so it is held until
    /// the engine returns even if the caller stops waiting.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn transcribe(&self, audio: &Path) -> PipelineResult<String> {
        let engine = self.ensure_available()?;
        let permit = self
            .gate
            .clone()
            .acquire_owned()
            .await
            .map_err(|err| PipelineError::EngineUnavailable(err.to_string()))?;
        debug!(idle = self.gate.available_permits(), "Acquired transcription slot");

        let audio = audio.to_path_buf();
        let call = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            engine.transcribe(&audio)
        });

        match call.await {
            Ok(Ok(text)) => Ok(text),
            Ok(Err(err)) => Err(PipelineError::Transcription(format!("{err:#}"))),
            Err(err) => Err(PipelineError::Transcription(format!(
                "engine call aborted: {err}"
            ))),
        }
    }
}
