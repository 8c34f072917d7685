pub mod dispatcher;
pub mod engine;
pub mod whisper;

pub use dispatcher::{EngineState, TranscriptionDispatcher};
pub use engine::{ModelBase, SpeechEngine};
pub use whisper::{WhisperEngine, WhisperFiles};
