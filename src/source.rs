//! Source frame adapters: anything that can describe a video and hand out
//! decoded frames one at a time.

use std::ffi::OsString;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdout, Stdio};
use std::thread::{self, JoinHandle};

use image::{DynamicImage, RgbImage};
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, warn};

use crate::ffmpeg::{self, ToolError};

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("source file not found: {}", .0.display())]
    NotFound(PathBuf),
    #[error("no video stream found in '{}'", .0.display())]
    NoVideoStream(PathBuf),
    #[error("invalid source: {0}")]
    Invalid(String),
    #[error(transparent)]
    Tool(#[from] ToolError),
}

/// Display rotation stored alongside the coded frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Rotation {
    #[default]
    None,
    Cw90,
    Cw180,
    Cw270,
}

impl Rotation {
    /// Snaps an arbitrary clockwise angle to the nearest quarter turn.
    pub fn from_degrees(degrees: i64) -> Self {
        let quarter = ((degrees.rem_euclid(360) + 45) / 90) % 4;
        match quarter {
            1 => Self::Cw90,
            2 => Self::Cw180,
            3 => Self::Cw270,
            _ => Self::None,
        }
    }

    pub fn degrees(self) -> u16 {
        match self {
            Self::None => 0,
            Self::Cw90 => 90,
            Self::Cw180 => 180,
            Self::Cw270 => 270,
        }
    }

    pub fn swaps_dimensions(self) -> bool {
        matches!(self, Self::Cw90 | Self::Cw270)
    }

    /// Turns a coded frame upright.
    pub fn apply(self, image: DynamicImage) -> DynamicImage {
        match self {
            Self::None => image,
            Self::Cw90 => image.rotate90(),
            Self::Cw180 => image.rotate180(),
            Self::Cw270 => image.rotate270(),
        }
    }
}

/// Native properties of a source video. `width`/`height` are the coded
/// dimensions, before rotation.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceInfo {
    pub width: u32,
    pub height: u32,
    pub fps: f64,
    pub frame_count: u64,
    pub duration: f64,
    pub rotation: Rotation,
    pub has_audio: bool,
}

impl SourceInfo {
    /// Dimensions once the rotation hint has been applied.
    pub fn display_dimensions(&self) -> (u32, u32) {
        if self.rotation.swaps_dimensions() {
            (self.height, self.width)
        } else {
            (self.width, self.height)
        }
    }
}

#[derive(Debug, Clone)]
pub struct SourceFrame {
    /// Position of the frame counted from the last seek point.
    pub index: u64,
    /// Presentation time in seconds from the start of the source.
    pub timestamp: f64,
    pub image: DynamicImage,
}

pub trait FrameSource {
    fn info(&self) -> &SourceInfo;

    /// Repositions the stream near `seconds`. Not frame exact.
    fn seek(&mut self, seconds: f64) -> Result<(), SourceError>;

    /// Next decoded frame, `None` once the source is exhausted.
    fn next_frame(&mut self) -> Result<Option<SourceFrame>, SourceError>;
}

#[derive(Debug, Deserialize)]
struct ProbeOutput {
    #[serde(default)]
    streams: Vec<ProbeStream>,
    format: Option<ProbeFormat>,
}

#[derive(Debug, Deserialize)]
struct ProbeStream {
    codec_type: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    r_frame_rate: Option<String>,
    avg_frame_rate: Option<String>,
    nb_frames: Option<String>,
    duration: Option<String>,
    #[serde(default)]
    tags: ProbeTags,
    #[serde(default)]
    side_data_list: Vec<ProbeSideData>,
}

#[derive(Debug, Default, Deserialize)]
struct ProbeTags {
    rotate: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ProbeSideData {
    rotation: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct ProbeFormat {
    duration: Option<String>,
}

/// Runs `ffprobe` on `path` and extracts the first video stream's
/// properties.
pub fn probe(path: &Path) -> Result<SourceInfo, SourceError> {
    if !path.exists() {
        return Err(SourceError::NotFound(path.to_path_buf()));
    }
    let output = ffmpeg::run(
        "ffprobe",
        ffmpeg::ffprobe_command()
            .args([
                "-v",
                "error",
                "-print_format",
                "json",
                "-show_streams",
                "-show_format",
            ])
            .arg(path),
    )?;
    let parsed: ProbeOutput = serde_json::from_slice(&output.stdout)
        .map_err(|err| ToolError::Probe(format!("ffprobe JSON parse failed: {err}")))?;
    source_info_from_probe(path, &parsed)
}

fn source_info_from_probe(path: &Path, parsed: &ProbeOutput) -> Result<SourceInfo, SourceError> {
    let video = parsed
        .streams
        .iter()
        .find(|s| s.codec_type.as_deref() == Some("video"))
        .ok_or_else(|| SourceError::NoVideoStream(path.to_path_buf()))?;
    let width = video
        .width
        .filter(|w| *w > 0)
        .ok_or_else(|| SourceError::Invalid("missing video width".into()))?;
    let height = video
        .height
        .filter(|h| *h > 0)
        .ok_or_else(|| SourceError::Invalid("missing video height".into()))?;
    let fps = [
        video.avg_frame_rate.as_deref(),
        video.r_frame_rate.as_deref(),
    ]
    .into_iter()
    .flatten()
    .find_map(parse_ff_ratio)
    .ok_or_else(|| SourceError::Invalid("missing or zero frame rate".into()))?;

    let duration = video
        .duration
        .as_deref()
        .or_else(|| parsed.format.as_ref().and_then(|f| f.duration.as_deref()))
        .and_then(|d| d.parse::<f64>().ok())
        .unwrap_or(0.0);
    let frame_count = video
        .nb_frames
        .as_deref()
        .and_then(|n| n.parse::<u64>().ok())
        .filter(|n| *n > 0)
        .unwrap_or_else(|| (duration * fps).round() as u64);

    // Legacy `rotate` tags are clockwise; display-matrix side data is
    // counter-clockwise.
    let rotation = if let Some(tag) = video.tags.rotate.as_deref() {
        Rotation::from_degrees(tag.trim().parse::<i64>().unwrap_or(0))
    } else {
        video
            .side_data_list
            .iter()
            .find_map(|side| side.rotation)
            .map(|ccw| Rotation::from_degrees(-(ccw.round() as i64)))
            .unwrap_or_default()
    };

    let has_audio = parsed
        .streams
        .iter()
        .any(|s| s.codec_type.as_deref() == Some("audio"));

    Ok(SourceInfo {
        width,
        height,
        fps,
        frame_count,
        duration,
        rotation,
        has_audio,
    })
}

fn parse_ff_ratio(value: &str) -> Option<f64> {
    let (num, den) = value.split_once('/').unwrap_or((value, "1"));
    let num = num.trim().parse::<f64>().ok()?;
    let den = den.trim().parse::<f64>().ok()?;
    if den == 0.0 || num <= 0.0 {
        return None;
    }
    Some(num / den)
}

struct RawFrameStream {
    child: Child,
    stdout: ChildStdout,
    stderr: Option<JoinHandle<String>>,
}

impl RawFrameStream {
    fn finish(mut self) -> Result<(), ToolError> {
        drop(self.stdout);
        let status = self.child.wait().map_err(|source| ToolError::Io {
            tool: "ffmpeg".into(),
            source,
        })?;
        let stderr = self
            .stderr
            .take()
            .and_then(|handle| handle.join().ok())
            .unwrap_or_default();
        if status.success() {
            Ok(())
        } else {
            Err(ToolError::Failed {
                tool: "ffmpeg".into(),
                status,
                stderr: stderr.trim().to_string(),
            })
        }
    }

    fn abort(mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

/// Decodes a video file by piping raw RGB frames out of `ffmpeg`.
///
/// Frames are produced in coded orientation (`-noautorotate`); callers apply
/// the rotation hint themselves.
pub struct FfmpegSource {
    path: PathBuf,
    info: SourceInfo,
    start: f64,
    end: Option<f64>,
    produced: u64,
    stream: Option<RawFrameStream>,
    exhausted: bool,
}

impl FfmpegSource {
    pub fn open(path: &Path) -> Result<Self, SourceError> {
        let info = probe(path)?;
        debug!(
            path = %path.display(),
            width = info.width,
            height = info.height,
            fps = info.fps,
            frames = info.frame_count,
            rotation = info.rotation.degrees(),
            "Probed source"
        );
        Ok(Self {
            path: path.to_path_buf(),
            info,
            start: 0.0,
            end: None,
            produced: 0,
            stream: None,
            exhausted: false,
        })
    }

    /// Stops decoding shortly after `end` seconds instead of running to the
    /// end of the file.
    pub fn with_end(mut self, end: Option<f64>) -> Self {
        self.end = end;
        self
    }

    fn frame_len(&self) -> usize {
        self.info.width as usize * self.info.height as usize * 3
    }

    fn decode_args(&self) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec!["-v".into(), "error".into(), "-nostdin".into()];
        if self.start > 0.0 {
            args.push("-ss".into());
            args.push(format!("{:.6}", self.start).into());
        }
        if let Some(end) = self.end {
            // One frame past `end` so the frame stamped exactly at `end` is
            // still delivered.
            let span = (end - self.start).max(0.0) + 1.0 / self.info.fps;
            args.push("-t".into());
            args.push(format!("{span:.6}").into());
        }
        args.push("-noautorotate".into());
        args.push("-i".into());
        args.push(self.path.clone().into());
        for arg in ["-an", "-f", "rawvideo", "-pix_fmt", "rgb24", "pipe:1"] {
            args.push(arg.into());
        }
        args
    }

    fn spawn(&self) -> Result<RawFrameStream, SourceError> {
        let mut cmd = ffmpeg::ffmpeg_command();
        cmd.args(self.decode_args())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = cmd.spawn().map_err(|source| ToolError::Spawn {
            tool: "ffmpeg".into(),
            source,
        })?;
        let stdout = child.stdout.take().ok_or_else(|| ToolError::Io {
            tool: "ffmpeg".into(),
            source: io::Error::other("stdout was not captured"),
        })?;
        // Drained on its own thread so a chatty ffmpeg never blocks on a full pipe.
        let stderr = child.stderr.take().map(|mut pipe| {
            thread::spawn(move || {
                let mut text = String::new();
                let _ = pipe.read_to_string(&mut text);
                text
            })
        });
        Ok(RawFrameStream {
            child,
            stdout,
            stderr,
        })
    }
}

impl FrameSource for FfmpegSource {
    fn info(&self) -> &SourceInfo {
        &self.info
    }

    fn seek(&mut self, seconds: f64) -> Result<(), SourceError> {
        if let Some(stream) = self.stream.take() {
            stream.abort();
        }
        self.start = seconds.max(0.0);
        self.produced = 0;
        self.exhausted = false;
        Ok(())
    }

    fn next_frame(&mut self) -> Result<Option<SourceFrame>, SourceError> {
        if self.exhausted {
            return Ok(None);
        }
        if self.stream.is_none() {
            self.stream = Some(self.spawn()?);
        }

        let frame_len = self.frame_len();
        let mut buf = vec![0u8; frame_len];
        let filled = match self.stream.as_mut() {
            Some(stream) => read_full(&mut stream.stdout, &mut buf).map_err(|source| {
                ToolError::Io {
                    tool: "ffmpeg".into(),
                    source,
                }
            })?,
            None => 0,
        };

        if filled < frame_len {
            self.exhausted = true;
            if filled > 0 {
                warn!(
                    filled,
                    expected = frame_len,
                    "Dropping incomplete trailing frame from ffmpeg"
                );
            }
            if let Some(stream) = self.stream.take() {
                let result = stream.finish();
                if self.produced == 0 {
                    result?;
                } else if let Err(err) = result {
                    warn!(error = %err, frames = self.produced, "ffmpeg stopped early");
                }
            }
            return Ok(None);
        }

        let image = RgbImage::from_raw(self.info.width, self.info.height, buf)
            .ok_or_else(|| SourceError::Invalid("raw frame size mismatch".into()))?;
        let index = self.produced;
        self.produced += 1;
        Ok(Some(SourceFrame {
            index,
            timestamp: self.start + index as f64 / self.info.fps,
            image: DynamicImage::ImageRgb8(image),
        }))
    }
}

impl Drop for FfmpegSource {
    fn drop(&mut self) {
        if let Some(stream) = self.stream.take() {
            stream.abort();
        }
    }
}

fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        }
    }
    Ok(filled)
}
