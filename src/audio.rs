//! Audio track pipeline: extract a window of the source's audio, normalize its
//! loudness and compress it for the container's audio section.
//!
//! Every stage may fail without failing the job. The pipeline reports what
//! actually happened as an [`AudioOutcome`].

use std::ffi::OsString;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::container::AudioCodec;
use crate::ffmpeg::{self, ToolError};

/// Integrated loudness target in LUFS.
pub const LOUDNESS_TARGET: f64 = -18.0;
/// True-peak ceiling in dBTP.
pub const TRUE_PEAK: f64 = -1.0;
pub const LOUDNESS_RANGE: f64 = 11.0;

const SAMPLE_RATE: &str = "44100";

#[derive(Debug, Error)]
pub enum AudioError {
    #[error("source has no audio stream")]
    NoAudioStream,
    #[error("audio tool produced an empty file at '{}'", .0.display())]
    EmptyOutput(PathBuf),
    #[error(transparent)]
    Tool(#[from] ToolError),
    #[error("I/O error on '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Optional trim window in seconds from the start of the source.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TimeWindow {
    pub start: Option<f64>,
    pub end: Option<f64>,
}

impl TimeWindow {
    pub fn new(start: Option<f64>, end: Option<f64>) -> Self {
        Self { start, end }
    }

    pub fn is_full(&self) -> bool {
        self.start.is_none() && self.end.is_none()
    }

    /// Length of the window, when it has an end.
    pub fn duration(&self) -> Option<f64> {
        self.end
            .map(|end| (end - self.start.unwrap_or(0.0)).max(0.0))
    }

    /// Window length clamped to a source of `total` seconds.
    pub fn span_within(&self, total: f64) -> f64 {
        let start = self.start.unwrap_or(0.0).max(0.0);
        let end = self.end.unwrap_or(total).min(total.max(start));
        (end - start).max(0.0)
    }
}

/// External tooling the audio pipeline drives. Intermediates are written to
/// `work_dir`, which the caller owns.
pub trait AudioTool {
    /// Decodes the source's audio within `window` to an uncompressed file.
    fn extract(
        &self,
        source: &Path,
        window: TimeWindow,
        work_dir: &Path,
    ) -> Result<PathBuf, AudioError>;

    /// Single-pass loudness normalization of an extracted track.
    fn normalize(&self, raw: &Path, work_dir: &Path) -> Result<PathBuf, AudioError>;

    fn compress(&self, raw: &Path, work_dir: &Path) -> Result<(Vec<u8>, AudioCodec), AudioError>;
}

/// Result of the audio pipeline for one job.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AudioOutcome {
    /// Audio was turned off for the job.
    Disabled,
    Normalized {
        codec: AudioCodec,
        bytes: usize,
    },
    /// Normalization failed; the raw extraction was compressed instead.
    Unnormalized {
        codec: AudioCodec,
        bytes: usize,
        reason: String,
    },
    Absent {
        reason: String,
    },
}

impl AudioOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Disabled => "disabled",
            Self::Normalized { .. } => "normalized",
            Self::Unnormalized { .. } => "unnormalized",
            Self::Absent { .. } => "absent",
        }
    }

    pub fn has_audio(&self) -> bool {
        matches!(self, Self::Normalized { .. } | Self::Unnormalized { .. })
    }
}

impl fmt::Display for AudioOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disabled => f.write_str("disabled"),
            Self::Normalized { codec, bytes } => write!(f, "normalized {codec} ({bytes} bytes)"),
            Self::Unnormalized { codec, bytes, .. } => {
                write!(f, "unnormalized {codec} ({bytes} bytes)")
            }
            Self::Absent { reason } => write!(f, "absent ({reason})"),
        }
    }
}

/// Compressed audio ready for the container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioTrack {
    pub codec: AudioCodec,
    pub data: Vec<u8>,
}

/// Runs extract, normalize and compress, degrading instead of failing.
pub fn process_audio(
    tool: &dyn AudioTool,
    source: &Path,
    window: TimeWindow,
    work_dir: &Path,
) -> (AudioOutcome, Option<AudioTrack>) {
    let raw = match tool.extract(source, window, work_dir) {
        Ok(raw) => raw,
        Err(err) => {
            warn!(error = %err, "Audio extraction failed; continuing without audio");
            return (
                AudioOutcome::Absent {
                    reason: err.to_string(),
                },
                None,
            );
        }
    };

    let (input, normalize_failure) = match tool.normalize(&raw, work_dir) {
        Ok(normalized) => (normalized, None),
        Err(err) => {
            warn!(error = %err, "Loudness normalization failed; using the raw track");
            (raw, Some(err.to_string()))
        }
    };

    match tool.compress(&input, work_dir) {
        Ok((data, _)) if data.is_empty() => {
            warn!("Audio compression produced no data; continuing without audio");
            (
                AudioOutcome::Absent {
                    reason: "compressed track is empty".into(),
                },
                None,
            )
        }
        Ok((data, codec)) => {
            let bytes = data.len();
            let outcome = match normalize_failure {
                None => AudioOutcome::Normalized { codec, bytes },
                Some(reason) => AudioOutcome::Unnormalized {
                    codec,
                    bytes,
                    reason,
                },
            };
            debug!(outcome = %outcome, "Audio pipeline finished");
            (outcome, Some(AudioTrack { codec, data }))
        }
        Err(err) => {
            warn!(error = %err, "Audio compression failed; continuing without audio");
            (
                AudioOutcome::Absent {
                    reason: err.to_string(),
                },
                None,
            )
        }
    }
}

/// Codec the ffmpeg tool compresses to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum AudioFormat {
    #[default]
    Mp3,
    Opus,
    Aac,
}

impl AudioFormat {
    pub fn codec(self) -> AudioCodec {
        match self {
            Self::Mp3 => AudioCodec::Mp3,
            Self::Opus => AudioCodec::Opus,
            Self::Aac => AudioCodec::Aac,
        }
    }

    fn encoder_args(self) -> &'static [&'static str] {
        match self {
            Self::Mp3 => &["-c:a", "libmp3lame", "-q:a", "4"],
            Self::Opus => &["-c:a", "libopus", "-b:a", "64k"],
            Self::Aac => &["-c:a", "aac", "-b:a", "128k"],
        }
    }
}

/// [`AudioTool`] backed by the ffmpeg binary.
#[derive(Debug, Clone, Copy, Default)]
pub struct FfmpegAudioTool {
    format: AudioFormat,
}

impl FfmpegAudioTool {
    pub fn new(format: AudioFormat) -> Self {
        Self { format }
    }

    fn extract_args(source: &Path, window: TimeWindow, out: &Path) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec!["-v".into(), "error".into(), "-y".into()];
        if let Some(start) = window.start.filter(|s| *s > 0.0) {
            args.push("-ss".into());
            args.push(format!("{start:.3}").into());
        }
        if let Some(duration) = window.duration() {
            args.push("-t".into());
            args.push(format!("{duration:.3}").into());
        }
        args.push("-i".into());
        args.push(source.into());
        for arg in ["-vn", "-acodec", "pcm_s16le", "-ac", "2", "-ar"] {
            args.push(arg.into());
        }
        args.push(SAMPLE_RATE.into());
        args.push(out.into());
        args
    }

    fn normalize_args(raw: &Path, out: &Path) -> Vec<OsString> {
        let filter = format!("loudnorm=I={LOUDNESS_TARGET}:TP={TRUE_PEAK}:LRA={LOUDNESS_RANGE}");
        vec![
            "-v".into(),
            "error".into(),
            "-y".into(),
            "-i".into(),
            raw.into(),
            "-af".into(),
            filter.into(),
            "-ar".into(),
            SAMPLE_RATE.into(),
            out.into(),
        ]
    }

    fn compress_args(&self, raw: &Path, out: &Path) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec![
            "-v".into(),
            "error".into(),
            "-y".into(),
            "-i".into(),
            raw.into(),
        ];
        for arg in self.format.encoder_args() {
            args.push(OsString::from(*arg));
        }
        args.push(out.into());
        args
    }
}

impl AudioTool for FfmpegAudioTool {
    fn extract(
        &self,
        source: &Path,
        window: TimeWindow,
        work_dir: &Path,
    ) -> Result<PathBuf, AudioError> {
        let out = work_dir.join("audio_raw.wav");
        let mut cmd = ffmpeg::ffmpeg_command();
        cmd.args(Self::extract_args(source, window, &out));
        ffmpeg::run("ffmpeg", &mut cmd).map_err(|err| match err.stderr() {
            Some(stderr) if stderr.contains("does not contain any stream") => {
                AudioError::NoAudioStream
            }
            _ => AudioError::Tool(err),
        })?;
        ensure_non_empty(&out)?;
        Ok(out)
    }

    fn normalize(&self, raw: &Path, work_dir: &Path) -> Result<PathBuf, AudioError> {
        let out = work_dir.join("audio_normalized.wav");
        let mut cmd = ffmpeg::ffmpeg_command();
        cmd.args(Self::normalize_args(raw, &out));
        ffmpeg::run("ffmpeg", &mut cmd)?;
        ensure_non_empty(&out)?;
        Ok(out)
    }

    fn compress(&self, raw: &Path, work_dir: &Path) -> Result<(Vec<u8>, AudioCodec), AudioError> {
        let codec = self.format.codec();
        let out = work_dir.join(format!("audio_compressed.{}", codec.extension()));
        let mut cmd = ffmpeg::ffmpeg_command();
        cmd.args(self.compress_args(raw, &out));
        ffmpeg::run("ffmpeg", &mut cmd)?;
        let data = fs::read(&out).map_err(|source| AudioError::Io {
            path: out.clone(),
            source,
        })?;
        Ok((data, codec))
    }
}

fn ensure_non_empty(path: &Path) -> Result<(), AudioError> {
    let meta = fs::metadata(path).map_err(|source| AudioError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    if meta.len() == 0 {
        return Err(AudioError::EmptyOutput(path.to_path_buf()));
    }
    Ok(())
}
