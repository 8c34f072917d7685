use std::path::Path;

use anyhow::Result;
use serde::{Deserialize, Serialize};

/// A speech-to-text backend.
///
/// Calls are blocking and may take seconds to minutes. Implementations must tolerate as many
/// concurrent calls as the dispatcher's gate allows.
pub trait SpeechEngine: Send + Sync {
    fn transcribe(&self, audio: &Path) -> Result<String>;
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct ModelBase {
    /// The name of the model, reported by the health endpoint
    pub name: String,

    /// The license of the model
    pub license: String,

    /// The id of the model repository
    pub repo_id: String,

    /// The revision of the model repository
    pub repo_revision: String,
}
