pub mod error;
pub mod orchestrator;
pub mod upload;

pub use error::{PipelineError, PipelineResult};
pub use orchestrator::{ReportedDuration, SegmentPolicy, TranscriptionPipeline, TranscriptionResult};
pub use upload::{MediaFile, Upload, Workspace};
