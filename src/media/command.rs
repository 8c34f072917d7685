use std::ffi::OsString;
use std::io;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;

/// What an external media tool left behind: exit status and captured text.
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub success: bool,
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn describe_failure(&self) -> String {
        let status = match self.code {
            Some(code) => format!("exit status {code}"),
            None => "terminated by signal".to_string(),
        };
        let stderr = self.stderr.trim();
        if stderr.is_empty() {
            status
        } else {
            format!("{status}: {}", tail(stderr, 2000))
        }
    }
}

fn tail(text: &str, max_chars: usize) -> &str {
    let count = text.chars().count();
    if count <= max_chars {
        return text;
    }
    let skip = text
        .char_indices()
        .nth(count - max_chars)
        .map_or(0, |(idx, _)| idx);
    &text[skip..]
}

/// Runs an external program to completion and captures its output.
///
/// `Err` means the program could not be run at all (missing executable, spawn failure),
/// a non-zero exit is reported through [`CommandOutput::success`].
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, program: &str, args: &[OsString]) -> io::Result<CommandOutput>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemCommandRunner;

#[async_trait]
impl CommandRunner for SystemCommandRunner {
    #[tracing::instrument(level = "debug", skip(self, args))]
    async fn run(&self, program: &str, args: &[OsString]) -> io::Result<CommandOutput> {
        let output = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await?;

        Ok(CommandOutput {
            success: output.status.success(),
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// External tools the prober and segmenter shell out to.
#[derive(Debug, Clone)]
pub struct MediaTools {
    pub ffprobe: String,
    pub ffmpeg: String,
    pub mediainfo: String,
}

impl Default for MediaTools {
    fn default() -> Self {
        Self {
            ffprobe: "ffprobe".into(),
            ffmpeg: "ffmpeg".into(),
            mediainfo: "mediainfo".into(),
        }
    }
}
