use std::ffi::OsString;
use std::path::Path;
use std::process::{Command, Stdio};

use anyhow::{bail, Context, Result};
use byteorder::{ByteOrder, LittleEndian};
use tracing::debug;

use crate::media::CommandOutput;

/// Rate the Whisper mel front end expects.
pub(crate) const PCM_SAMPLE_RATE: u32 = 16_000;

/// Decodes anything ffmpeg can read into mono f32 PCM at [`PCM_SAMPLE_RATE`].
///
/// Blocking: callers are already on the blocking pool.
pub(crate) fn pcm_decode(ffmpeg: &str, audio: &Path) -> Result<Vec<f32>> {
    let output = Command::new(ffmpeg)
        .args(resample_args(audio))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .with_context(|| format!("could not run {ffmpeg}"))?;

    if !output.status.success() {
        let failure = CommandOutput {
            success: false,
            code: output.status.code(),
            stdout: String::new(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };
        bail!(
            "{ffmpeg} could not decode {}: {}",
            audio.display(),
            failure.describe_failure()
        )
    }

    let samples = f32le_samples(&output.stdout);
    if samples.is_empty() {
        bail!("no audio samples decoded from {}", audio.display())
    }
    debug!(samples = samples.len(), "Decoded pcm data");
    Ok(samples)
}

fn resample_args(audio: &Path) -> Vec<OsString> {
    let mut args: Vec<OsString> = ["-nostdin", "-hide_banner", "-v", "error", "-i"]
        .map(OsString::from)
        .to_vec();
    args.push(audio.as_os_str().to_owned());
    let rate = PCM_SAMPLE_RATE.to_string();
    args.extend(["-ac", "1", "-ar", rate.as_str(), "-f", "f32le", "-"].map(OsString::from));
    args
}

/// Reinterprets raw little-endian f32 bytes, dropping a trailing partial sample.
fn f32le_samples(bytes: &[u8]) -> Vec<f32> {
    let usable = bytes.len() - bytes.len() % 4;
    let mut samples = vec![0f32; usable / 4];
    LittleEndian::read_f32_into(&bytes[..usable], &mut samples);
    samples
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ffmpeg_is_asked_for_mono_16khz_floats() {
        let args: Vec<String> = resample_args(Path::new("/work/input.webm"))
            .iter()
            .map(|arg| arg.to_string_lossy().into_owned())
            .collect();
        let at = |flag: &str| args.iter().position(|arg| arg == flag).unwrap() + 1;
        assert_eq!(args[at("-i")], "/work/input.webm");
        assert_eq!(args[at("-ac")], "1");
        assert_eq!(args[at("-ar")], "16000");
        assert_eq!(args[at("-f")], "f32le");
        assert_eq!(args.last().unwrap(), "-");
    }

    #[test]
    fn raw_bytes_become_samples() {
        let mut bytes = Vec::new();
        for sample in [0.5f32, -1.0, 0.25] {
            bytes.extend_from_slice(&sample.to_le_bytes());
        }
        bytes.push(0x7f);
        assert_eq!(f32le_samples(&bytes), vec![0.5, -1.0, 0.25]);
    }

    /// Writes a 48 kHz stereo WAV header followed by silence.
    #[cfg(unix)]
    fn write_48khz_wav(path: &Path) {
        let data_len: u32 = 48_000 * 2 * 2 / 10;
        let mut wav = Vec::new();
        wav.extend_from_slice(b"RIFF");
        wav.extend_from_slice(&(36 + data_len).to_le_bytes());
        wav.extend_from_slice(b"WAVEfmt ");
        wav.extend_from_slice(&16u32.to_le_bytes());
        wav.extend_from_slice(&1u16.to_le_bytes());
        wav.extend_from_slice(&2u16.to_le_bytes());
        wav.extend_from_slice(&48_000u32.to_le_bytes());
        wav.extend_from_slice(&(48_000u32 * 4).to_le_bytes());
        wav.extend_from_slice(&4u16.to_le_bytes());
        wav.extend_from_slice(&16u16.to_le_bytes());
        wav.extend_from_slice(b"data");
        wav.extend_from_slice(&data_len.to_le_bytes());
        wav.resize(wav.len() + data_len as usize, 0);
        std::fs::write(path, wav).unwrap();
    }

    /// Installs a stand-in ffmpeg that only answers resampling requests, emitting two
    /// samples (1.0, -2.0) to stdout.
    #[cfg(unix)]
    fn fake_ffmpeg(dir: &Path) -> String {
        use std::os::unix::fs::PermissionsExt;

        let path = dir.join("ffmpeg");
        std::fs::write(
            &path,
            "#!/bin/sh\n\
             case \"$*\" in\n\
             *\"-ac 1 -ar 16000 -f f32le -\"*) printf '\\000\\000\\200\\077\\000\\000\\000\\300' ;;\n\
             *) echo \"unexpected arguments: $*\" >&2; exit 1 ;;\n\
             esac\n",
        )
        .unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path.to_string_lossy().into_owned()
    }

    #[cfg(unix)]
    #[test]
    fn high_rate_input_is_resampled_by_ffmpeg() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("input.wav");
        write_48khz_wav(&input);

        let samples = pcm_decode(&fake_ffmpeg(dir.path()), &input).unwrap();

        assert_eq!(samples, vec![1.0, -2.0]);
    }

    #[cfg(unix)]
    #[test]
    fn ffmpeg_failure_carries_its_diagnostics() {
        let dir = tempfile::tempdir().unwrap();
        let ffmpeg = dir.path().join("ffmpeg");
        std::fs::write(&ffmpeg, "#!/bin/sh\necho 'Invalid data found' >&2\nexit 1\n").unwrap();
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&ffmpeg, std::fs::Permissions::from_mode(0o755)).unwrap();
        }

        let err = pcm_decode(ffmpeg.to_str().unwrap(), &dir.path().join("input.webm"))
            .unwrap_err()
            .to_string();

        assert!(err.contains("Invalid data found"), "{err}");
        assert!(err.contains("exit status 1"), "{err}");
    }

    #[test]
    fn missing_ffmpeg_is_reported() {
        let err = pcm_decode("/nonexistent/ffmpeg", Path::new("input.webm")).unwrap_err();
        assert!(err.to_string().contains("could not run"));
    }
}
