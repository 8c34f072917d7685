#![allow(dead_code)]

use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;

use transcription_runner::media::{
    CommandOutput, CommandRunner, DurationProber, MediaTools, Segmenter,
};
use transcription_runner::pipeline::{MediaFile, SegmentPolicy, TranscriptionPipeline, Upload};
use transcription_runner::transcription::{EngineState, SpeechEngine, TranscriptionDispatcher};

/// How the fake media tools behave for one test.
#[derive(Debug, Clone, Default)]
pub struct MediaScript {
    /// Container duration reported by ffprobe. `None` makes every strategy come up empty.
    pub duration: Option<f64>,
    /// Number of files the fake ffmpeg segment muxer writes.
    pub segments: usize,
    pub split_fails: bool,
    /// ffprobe cannot be started at all.
    pub ffprobe_missing: bool,
}

#[derive(Debug, Clone)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
}

impl Invocation {
    pub fn is_split(&self) -> bool {
        self.program == "ffmpeg" && self.args.iter().any(|arg| arg == "segment")
    }

    pub fn value_after(&self, flag: &str) -> Option<&str> {
        let at = self.args.iter().position(|arg| arg == flag)?;
        self.args.get(at + 1).map(String::as_str)
    }
}

/// Stands in for ffprobe, ffmpeg and mediainfo, recording every invocation.
#[derive(Default)]
pub struct ScriptedRunner {
    script: MediaScript,
    invocations: Mutex<Vec<Invocation>>,
}

impl ScriptedRunner {
    pub fn new(script: MediaScript) -> Self {
        Self {
            script,
            invocations: Mutex::default(),
        }
    }

    pub fn invocations(&self) -> Vec<Invocation> {
        self.invocations.lock().unwrap().clone()
    }

    pub fn splits(&self) -> Vec<Invocation> {
        self.invocations()
            .into_iter()
            .filter(Invocation::is_split)
            .collect()
    }

    fn ffprobe(&self, args: &[String]) -> io::Result<CommandOutput> {
        if self.script.ffprobe_missing {
            return Err(io::Error::new(io::ErrorKind::NotFound, "ffprobe not found"));
        }
        let stdout = match self.script.duration {
            Some(duration) if args.iter().any(|arg| arg == "format=duration") => {
                format!("{duration}\n")
            }
            Some(_) => String::new(),
            None if args.iter().any(|arg| arg == "json") => "{}".to_string(),
            None => "N/A\n".to_string(),
        };
        Ok(succeeded(stdout, String::new()))
    }

    fn ffmpeg(&self, args: &[String]) -> io::Result<CommandOutput> {
        if !args.iter().any(|arg| arg == "segment") {
            return Ok(succeeded(
                String::new(),
                "Input #0, matroska,webm, from 'input.webm':\n  Duration: N/A, start: 0.000000\n"
                    .to_string(),
            ));
        }

        let pattern = args.last().cloned().unwrap_or_default();
        for index in 0..self.script.segments {
            std::fs::write(pattern.replace("%03d", &format!("{index:03}")), b"segment")?;
        }
        if self.script.split_fails {
            return Ok(CommandOutput {
                success: false,
                code: Some(1),
                stdout: String::new(),
                stderr: "Invalid data found when processing input".into(),
            });
        }
        Ok(succeeded(String::new(), String::new()))
    }
}

fn succeeded(stdout: String, stderr: String) -> CommandOutput {
    CommandOutput {
        success: true,
        code: Some(0),
        stdout,
        stderr,
    }
}

#[async_trait]
impl CommandRunner for ScriptedRunner {
    async fn run(&self, program: &str, args: &[OsString]) -> io::Result<CommandOutput> {
        let args: Vec<String> = args
            .iter()
            .map(|arg| arg.to_string_lossy().into_owned())
            .collect();
        self.invocations.lock().unwrap().push(Invocation {
            program: program.to_string(),
            args: args.clone(),
        });

        match program {
            "ffprobe" => self.ffprobe(&args),
            "ffmpeg" => self.ffmpeg(&args),
            _ => Err(io::Error::new(io::ErrorKind::NotFound, format!("{program} not found"))),
        }
    }
}

/// Answers `segment_NNN.*` with "part N+1" and the whole upload with `whole_text`.
pub struct StubEngine {
    pub whole_text: String,
    pub reject_whole_input: bool,
    pub fail_segment: Option<usize>,
    /// Blocks every call this long before answering, like a slow model.
    pub delay: Option<Duration>,
    calls: Mutex<Vec<PathBuf>>,
}

impl StubEngine {
    pub fn new(whole_text: &str) -> Self {
        Self {
            whole_text: whole_text.to_string(),
            reject_whole_input: false,
            fail_segment: None,
            delay: None,
            calls: Mutex::default(),
        }
    }

    pub fn calls(&self) -> Vec<PathBuf> {
        self.calls.lock().unwrap().clone()
    }

    pub fn called_files(&self) -> Vec<String> {
        self.calls()
            .iter()
            .map(|path| path.file_name().unwrap().to_string_lossy().into_owned())
            .collect()
    }
}

fn segment_number(path: &Path) -> Option<usize> {
    path.file_stem()?
        .to_str()?
        .strip_prefix("segment_")?
        .parse()
        .ok()
}

impl SpeechEngine for StubEngine {
    fn transcribe(&self, audio: &Path) -> Result<String> {
        self.calls.lock().unwrap().push(audio.to_path_buf());
        assert!(audio.exists(), "engine called with missing file {audio:?}");
        if let Some(delay) = self.delay {
            std::thread::sleep(delay);
        }

        match segment_number(audio) {
            Some(index) if Some(index) == self.fail_segment => {
                bail!("decoder failed on segment {index}")
            }
            Some(index) => Ok(format!("part {}", index + 1)),
            None if self.reject_whole_input => bail!("input too long for a single pass"),
            None => Ok(self.whole_text.clone()),
        }
    }
}

pub struct Harness {
    pub runner: Arc<ScriptedRunner>,
    pub engine: Arc<StubEngine>,
    pub pipeline: Arc<TranscriptionPipeline>,
    pub work_root: tempfile::TempDir,
}

impl Harness {
    pub fn new(script: MediaScript, engine: StubEngine) -> Self {
        let engine = Arc::new(engine);
        Self::with_state(script, EngineState::Ready(engine.clone()), engine)
    }

    pub fn without_engine(script: MediaScript, reason: &str) -> Self {
        Self::with_state(
            script,
            EngineState::Unavailable(reason.to_string()),
            Arc::new(StubEngine::new("")),
        )
    }

    fn with_state(script: MediaScript, state: EngineState, engine: Arc<StubEngine>) -> Self {
        let runner = Arc::new(ScriptedRunner::new(script));
        let work_root = tempfile::tempdir().unwrap();
        let pipeline = TranscriptionPipeline::new(
            DurationProber::new(runner.clone(), MediaTools::default()),
            Segmenter::new(runner.clone(), "ffmpeg"),
            Arc::new(TranscriptionDispatcher::new(state, "Stub Whisper", 2)),
            SegmentPolicy {
                max_segment_secs: 20,
                fallback_segment_secs: 15,
            },
            work_root.path(),
        );
        Self {
            runner,
            engine,
            pipeline: Arc::new(pipeline),
            work_root,
        }
    }

    pub async fn upload(&self, filename: &str, content_type: &str) -> Upload {
        let mut upload = self
            .pipeline
            .accept(MediaFile::new(
                Some(filename.to_string()),
                Some(content_type.to_string()),
            ))
            .await
            .unwrap();
        upload.append(b"\x1a\x45\xdf\xa3 webm bytes").await.unwrap();
        upload.finish().await.unwrap();
        upload
    }

    /// Entries left under the work root, i.e. leaked request workspaces.
    pub fn leftovers(&self) -> usize {
        std::fs::read_dir(self.work_root.path()).unwrap().count()
    }
}
