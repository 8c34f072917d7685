use std::ffi::OsString;
use std::io;
use std::path::Path;
use std::sync::Arc;

use lazy_static::lazy_static;
use regex::{Captures, Regex};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::media::command::{CommandOutput, CommandRunner, MediaTools};
use crate::pipeline::error::{PipelineError, PipelineResult};

/// Length of a media file in seconds. Always finite and strictly positive.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd)]
pub struct MediaDuration(f64);

impl MediaDuration {
    pub fn from_secs(secs: f64) -> Option<Self> {
        (secs.is_finite() && secs > 0.0).then_some(Self(secs))
    }

    pub fn as_secs(self) -> f64 {
        self.0
    }
}

/// The ordered fallback chain used to find a duration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeStrategy {
    /// Container level `format=duration` from ffprobe.
    FormatMetadata,
    /// Per-stream durations from ffprobe, longest wins.
    StreamMetadata,
    /// ffprobe JSON report, container first, then streams.
    StructuredProbe,
    /// `Duration:` line in the banner of an ffmpeg decode-to-null pass.
    DecodeBanner,
    /// Last `time=` progress stamp of the same decode pass.
    DecodeProgress,
    /// A verbose decode pass matched against alternate timestamp layouts.
    VerboseDecode,
    /// The optional `mediainfo` tool.
    MediaInfo,
}

impl ProbeStrategy {
    pub const CHAIN: [ProbeStrategy; 7] = [
        ProbeStrategy::FormatMetadata,
        ProbeStrategy::StreamMetadata,
        ProbeStrategy::StructuredProbe,
        ProbeStrategy::DecodeBanner,
        ProbeStrategy::DecodeProgress,
        ProbeStrategy::VerboseDecode,
        ProbeStrategy::MediaInfo,
    ];
}

#[derive(Clone)]
pub struct DurationProber {
    runner: Arc<dyn CommandRunner>,
    tools: MediaTools,
}

impl DurationProber {
    pub fn new(runner: Arc<dyn CommandRunner>, tools: MediaTools) -> Self {
        Self { runner, tools }
    }

    /// Determines the duration of `path`.
    ///
    /// Fails with [`PipelineError::ProbeExecution`] when an analysis tool cannot be run or
    /// ffprobe rejects the file, and with [`PipelineError::DurationUnknown`] when every
    /// strategy ran but none produced a usable value.
    #[tracing::instrument(level = "info", skip(self))]
    pub async fn probe(&self, path: &Path) -> PipelineResult<MediaDuration> {
        let mut decode_log = None;

        for strategy in ProbeStrategy::CHAIN {
            let found = match strategy {
                ProbeStrategy::FormatMetadata => {
                    let stdout = self
                        .ffprobe(path, &["-show_entries", "format=duration", "-of", "csv=p=0"])
                        .await?;
                    let first = csv_durations(&stdout).next();
                    first
                }
                ProbeStrategy::StreamMetadata => {
                    let stdout = self
                        .ffprobe(path, &["-show_entries", "stream=duration", "-of", "csv=p=0"])
                        .await?;
                    longest(csv_durations(&stdout))
                }
                ProbeStrategy::StructuredProbe => {
                    let stdout = self
                        .ffprobe(
                            path,
                            &["-print_format", "json", "-show_format", "-show_streams"],
                        )
                        .await?;
                    structured_duration(&stdout)
                }
                ProbeStrategy::DecodeBanner => {
                    banner_duration(self.decode_log(path, &mut decode_log).await?)
                }
                ProbeStrategy::DecodeProgress => {
                    progress_duration(self.decode_log(path, &mut decode_log).await?)
                }
                ProbeStrategy::VerboseDecode => {
                    let output = self.decode(path, true).await?;
                    alternate_pattern_duration(&output.stderr)
                }
                ProbeStrategy::MediaInfo => self.mediainfo(path).await,
            };

            match found {
                Some(duration) => {
                    info!(
                        ?strategy,
                        duration = duration.as_secs(),
                        "Determined audio duration"
                    );
                    return Ok(duration);
                }
                None => debug!(?strategy, "No usable duration, trying next strategy"),
            }
        }

        Err(PipelineError::DurationUnknown(format!(
            "{} may be corrupted or in an unsupported format",
            path.display()
        )))
    }

    async fn ffprobe(&self, path: &Path, selection: &[&str]) -> PipelineResult<String> {
        let mut args: Vec<OsString> = vec!["-v".into(), "quiet".into()];
        args.extend(selection.iter().map(OsString::from));
        args.push(path.as_os_str().to_owned());

        let output = self
            .runner
            .run(&self.tools.ffprobe, &args)
            .await
            .map_err(|err| spawn_error(&self.tools.ffprobe, &err))?;
        if !output.success {
            return Err(PipelineError::ProbeExecution(format!(
                "{} failed on {}: {}",
                self.tools.ffprobe,
                path.display(),
                output.describe_failure()
            )));
        }
        Ok(output.stdout)
    }

    async fn decode_log<'a>(
        &self,
        path: &Path,
        cache: &'a mut Option<String>,
    ) -> PipelineResult<&'a str> {
        if cache.is_none() {
            warn!(
                path = %path.display(),
                "Could not get duration from metadata, parsing ffmpeg decode output"
            );
            *cache = Some(self.decode(path, false).await?.stderr);
        }
        Ok(cache.as_deref().unwrap_or_default())
    }

    /// Decodes `path` to the null muxer. The exit status is not checked: a truncated stream
    /// still reports useful progress before ffmpeg gives up on it.
    async fn decode(&self, path: &Path, verbose: bool) -> PipelineResult<CommandOutput> {
        let mut args: Vec<OsString> = vec!["-nostdin".into()];
        if verbose {
            args.extend(["-hide_banner", "-v", "verbose"].map(OsString::from));
        }
        args.push("-i".into());
        args.push(path.as_os_str().to_owned());
        args.extend(["-f", "null", "-"].map(OsString::from));

        self.runner
            .run(&self.tools.ffmpeg, &args)
            .await
            .map_err(|err| spawn_error(&self.tools.ffmpeg, &err))
    }

    async fn mediainfo(&self, path: &Path) -> Option<MediaDuration> {
        let args: Vec<OsString> = vec![
            "--Output=General;%Duration%".into(),
            path.as_os_str().to_owned(),
        ];
        match self.runner.run(&self.tools.mediainfo, &args).await {
            Ok(output) if output.success => mediainfo_duration(&output.stdout),
            Ok(output) => {
                debug!(failure = %output.describe_failure(), "mediainfo failed");
                None
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                debug!("mediainfo is not installed, skipping");
                None
            }
            Err(err) => {
                warn!(error = %err, "Could not run mediainfo, skipping");
                None
            }
        }
    }
}

fn spawn_error(program: &str, err: &io::Error) -> PipelineError {
    PipelineError::ProbeExecution(format!("could not run {program}: {err}"))
}

lazy_static! {
    static ref BANNER_DURATION: Regex =
        Regex::new(r"Duration: (\d{2}):(\d{2}):(\d{2})\.(\d{2})").unwrap();
    static ref PROGRESS_TIME: Regex = Regex::new(r"time=(\d{2}):(\d{2}):(\d{2})\.(\d{2})").unwrap();
    static ref ALTERNATE_PATTERNS: Vec<(Regex, Occurrence)> = vec![
        (BANNER_DURATION.clone(), Occurrence::First),
        (
            Regex::new(r"Duration: (\d{2}):(\d{2}):(\d{2})[.,](\d{3})").unwrap(),
            Occurrence::First
        ),
        (
            Regex::new(r"Duration: (\d+):(\d{2}):(\d{2})").unwrap(),
            Occurrence::First
        ),
        (PROGRESS_TIME.clone(), Occurrence::Last),
    ];
}

#[derive(Debug, Clone, Copy)]
enum Occurrence {
    First,
    Last,
}

fn csv_durations(stdout: &str) -> impl Iterator<Item = MediaDuration> + '_ {
    stdout
        .lines()
        .map(|line| line.trim().trim_end_matches(','))
        .filter_map(|line| line.parse::<f64>().ok())
        .filter_map(MediaDuration::from_secs)
}

fn longest(durations: impl Iterator<Item = MediaDuration>) -> Option<MediaDuration> {
    durations.reduce(|longest, next| if next > longest { next } else { longest })
}

#[derive(Deserialize, Debug, Default)]
struct ProbeReport {
    #[serde(default)]
    format: Option<ProbeSection>,
    #[serde(default)]
    streams: Vec<ProbeSection>,
}

#[derive(Deserialize, Debug, Default)]
struct ProbeSection {
    #[serde(default)]
    duration: Option<Value>,
}

impl ProbeSection {
    fn duration(&self) -> Option<MediaDuration> {
        let secs = match self.duration.as_ref()? {
            Value::String(text) => text.trim().parse::<f64>().ok()?,
            Value::Number(number) => number.as_f64()?,
            _ => return None,
        };
        MediaDuration::from_secs(secs)
    }
}

fn structured_duration(stdout: &str) -> Option<MediaDuration> {
    let report: ProbeReport = match serde_json::from_str(stdout) {
        Ok(report) => report,
        Err(err) => {
            debug!(error = %err, "Malformed ffprobe JSON output");
            return None;
        }
    };
    report
        .format
        .as_ref()
        .and_then(ProbeSection::duration)
        .or_else(|| longest(report.streams.iter().filter_map(ProbeSection::duration)))
}

fn captured_secs(captures: &Captures) -> Option<MediaDuration> {
    let field = |idx: usize| captures.get(idx)?.as_str().parse::<f64>().ok();
    let hours = field(1)?;
    let minutes = field(2)?;
    let seconds = field(3)?;
    let fraction = match captures.get(4) {
        Some(digits) => {
            let digits = digits.as_str();
            digits.parse::<f64>().ok()? / 10f64.powi(i32::try_from(digits.len()).ok()?)
        }
        None => 0.0,
    };
    MediaDuration::from_secs(hours * 3600.0 + minutes * 60.0 + seconds + fraction)
}

fn banner_duration(log: &str) -> Option<MediaDuration> {
    BANNER_DURATION
        .captures(log)
        .and_then(|captures| captured_secs(&captures))
}

fn progress_duration(log: &str) -> Option<MediaDuration> {
    PROGRESS_TIME
        .captures_iter(log)
        .last()
        .and_then(|captures| captured_secs(&captures))
}

fn alternate_pattern_duration(log: &str) -> Option<MediaDuration> {
    ALTERNATE_PATTERNS.iter().find_map(|(pattern, occurrence)| {
        let captures = match occurrence {
            Occurrence::First => pattern.captures(log),
            Occurrence::Last => pattern.captures_iter(log).last(),
        };
        let duration = captures.and_then(|captures| captured_secs(&captures))?;
        debug!(pattern = pattern.as_str(), "Matched alternate duration pattern");
        Some(duration)
    })
}

/// mediainfo reports the general duration in milliseconds.
fn mediainfo_duration(stdout: &str) -> Option<MediaDuration> {
    let millis = stdout.trim().parse::<f64>().ok()?;
    MediaDuration::from_secs(millis / 1000.0)
}
