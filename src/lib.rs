pub mod api;
pub mod config;
pub mod error;
pub mod media;
pub mod pipeline;
pub mod telemetry;
pub mod transcription;
