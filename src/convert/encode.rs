use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Instant;

use chrono::{SecondsFormat, Utc};
use image::DynamicImage;
use image::imageops::FilterType as ResizeFilter;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::audio::{self, AudioFormat, AudioOutcome, AudioTool, FfmpegAudioTool, TimeWindow};
use crate::codec::{CodecError, FrameCodec, WebpCodec};
use crate::container::{ContainerError, ContainerWriter, Metadata};
use crate::ffmpeg::{self, ToolError};
use crate::observability::{MetricsCollector, MetricsSnapshot, stage};
use crate::presets;
use crate::progress::{ProgressMeter, ProgressSink, ProgressUpdate};
use crate::source::{FfmpegSource, FrameSource, SourceError, SourceInfo};

pub const DEFAULT_WIDTH: u32 = 480;
pub const DEFAULT_FPS: u32 = 15;
pub const DEFAULT_QUALITY: u8 = 75;

#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("unknown preset '{name}' (available: {})", presets::preset_names().join(", "))]
    UnknownPreset { name: String },
    #[error("invalid encode settings: {0}")]
    InvalidSettings(String),
    #[error(transparent)]
    Source(#[from] SourceError),
    #[error("failed to compress frame {index}: {source}")]
    Compression {
        index: u64,
        #[source]
        source: CodecError,
    },
    #[error("source produced no frames in the requested window")]
    NoFrames,
    #[error("failed to create job working directory: {0}")]
    WorkDir(#[source] io::Error),
    #[error("I/O error on '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    Container(#[from] ContainerError),
    #[error(transparent)]
    Tool(#[from] ToolError),
}

/// Caller-facing encode options. A preset, when named, overrides fps, width,
/// quality, loop count and audio.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EncodeOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preset: Option<String>,
    pub width: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
    pub fps: u32,
    pub quality: u8,
    pub loop_count: u8,
    pub audio: bool,
    pub audio_format: AudioFormat,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end: Option<f64>,
    #[serde(skip_serializing_if = "Metadata::is_empty")]
    pub metadata: Metadata,
}

impl Default for EncodeOptions {
    fn default() -> Self {
        Self {
            preset: None,
            width: DEFAULT_WIDTH,
            height: None,
            fps: DEFAULT_FPS,
            quality: DEFAULT_QUALITY,
            loop_count: 0,
            audio: true,
            audio_format: AudioFormat::default(),
            start: None,
            end: None,
            metadata: Metadata::new(),
        }
    }
}

impl EncodeOptions {
    /// Applies the preset and range-checks everything that does not depend
    /// on the source.
    pub fn resolve(&self) -> Result<EncodeSettings, EncodeError> {
        let (fps, width, quality, loop_count, audio) = match self.preset.as_deref() {
            Some(name) => {
                let preset = presets::preset(name).ok_or_else(|| EncodeError::UnknownPreset {
                    name: name.to_string(),
                })?;
                (
                    u32::from(preset.fps),
                    preset.width,
                    preset.quality,
                    preset.loop_count,
                    preset.audio,
                )
            }
            None => (
                self.fps,
                self.width,
                self.quality,
                self.loop_count,
                self.audio,
            ),
        };

        let fps = u8::try_from(fps)
            .ok()
            .filter(|f| *f > 0)
            .ok_or_else(|| EncodeError::InvalidSettings(format!("fps {fps} is outside 1..=255")))?;
        if width == 0 || width > u32::from(u16::MAX) {
            return Err(EncodeError::InvalidSettings(format!(
                "width {width} is outside 1..={}",
                u16::MAX
            )));
        }
        if let Some(height) = self.height
            && (height == 0 || height > u32::from(u16::MAX))
        {
            return Err(EncodeError::InvalidSettings(format!(
                "height {height} is outside 1..={}",
                u16::MAX
            )));
        }
        if quality > 100 {
            return Err(EncodeError::InvalidSettings(format!(
                "quality {quality} is above 100"
            )));
        }
        for (label, value) in [("start", self.start), ("end", self.end)] {
            if let Some(value) = value
                && (!value.is_finite() || value < 0.0)
            {
                return Err(EncodeError::InvalidSettings(format!(
                    "{label} time {value} must be a non-negative number of seconds"
                )));
            }
        }
        if let (Some(start), Some(end)) = (self.start, self.end)
            && start >= end
        {
            return Err(EncodeError::InvalidSettings(format!(
                "start {start}s must be before end {end}s"
            )));
        }

        Ok(EncodeSettings {
            width,
            height: self.height,
            fps,
            quality,
            loop_count,
            audio,
            window: TimeWindow::new(self.start, self.end),
            metadata: self.metadata.clone(),
        })
    }
}

/// Fully resolved settings for one job.
#[derive(Debug, Clone, PartialEq)]
pub struct EncodeSettings {
    pub width: u32,
    pub height: Option<u32>,
    pub fps: u8,
    pub quality: u8,
    pub loop_count: u8,
    pub audio: bool,
    pub window: TimeWindow,
    pub metadata: Metadata,
}

impl EncodeSettings {
    /// Output dimensions for a source, honouring its rotation hint.
    pub fn output_dimensions(&self, info: &SourceInfo) -> Result<(u16, u16), EncodeError> {
        let (src_w, src_h) = info.display_dimensions();
        if src_w == 0 || src_h == 0 {
            return Err(EncodeError::InvalidSettings(format!(
                "source has degenerate dimensions {src_w}x{src_h}"
            )));
        }
        let height = match self.height {
            Some(height) => u64::from(height),
            None => (u64::from(src_h) * u64::from(self.width) / u64::from(src_w)).max(1),
        };
        let width = u16::try_from(self.width)
            .map_err(|_| EncodeError::InvalidSettings(format!("width {} overflows", self.width)))?;
        let height = u16::try_from(height).map_err(|_| {
            EncodeError::InvalidSettings(format!(
                "derived height {height} exceeds {}; lower the width",
                u16::MAX
            ))
        })?;
        Ok((width, height))
    }

    /// Keep every n-th source frame.
    pub fn decimation_interval(&self, native_fps: f64) -> u64 {
        let ratio = (native_fps / f64::from(self.fps)).floor();
        if ratio.is_finite() && ratio >= 1.0 {
            ratio as u64
        } else {
            1
        }
    }

    /// Estimated number of frames the job keeps, never below one.
    pub fn expected_frames(&self, info: &SourceInfo) -> u64 {
        let window_frames = if self.window.is_full() {
            info.frame_count
        } else {
            let span = if info.duration > 0.0 {
                self.window.span_within(info.duration)
            } else {
                self.window.duration().unwrap_or(0.0)
            };
            (span * info.fps).round() as u64
        };
        (window_frames / self.decimation_interval(info.fps)).max(1)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct EncodeReport {
    pub job_id: String,
    pub output: PathBuf,
    pub frames: usize,
    pub width: u16,
    pub height: u16,
    pub fps: u8,
    pub loop_count: u8,
    pub audio: AudioOutcome,
    pub metrics: MetricsSnapshot,
}

/// Runs the encode pipeline against pluggable collaborators.
pub struct Encoder<'a> {
    codec: &'a dyn FrameCodec,
    audio_tool: &'a dyn AudioTool,
    progress: Option<&'a dyn ProgressSink>,
    metrics: MetricsCollector,
}

impl<'a> Encoder<'a> {
    pub fn new(codec: &'a dyn FrameCodec, audio_tool: &'a dyn AudioTool) -> Self {
        Self {
            codec,
            audio_tool,
            progress: None,
            metrics: MetricsCollector::new(),
        }
    }

    pub fn with_progress(mut self, sink: &'a dyn ProgressSink) -> Self {
        self.progress = Some(sink);
        self
    }

    pub fn with_metrics(mut self, metrics: MetricsCollector) -> Self {
        self.metrics = metrics;
        self
    }

    #[instrument(skip_all, fields(job = job_id, input = %source_path.display()))]
    pub fn encode(
        &self,
        job_id: &str,
        source: &mut dyn FrameSource,
        source_path: &Path,
        output: &Path,
        settings: &EncodeSettings,
    ) -> Result<EncodeReport, EncodeError> {
        let started = Instant::now();
        let info = source.info().clone();
        let (width, height) = settings.output_dimensions(&info)?;
        let interval = settings.decimation_interval(info.fps);
        let expected = settings.expected_frames(&info);
        info!(
            width,
            height,
            fps = settings.fps,
            source_fps = info.fps,
            interval,
            expected,
            "Encoding clip"
        );

        let work_dir = tempfile::Builder::new()
            .prefix("mpgif-encode-")
            .tempdir()
            .map_err(EncodeError::WorkDir)?;

        let mut writer = ContainerWriter::new(width, height, settings.fps, settings.loop_count);
        if let Some(start) = settings.window.start
            && let Err(err) = source.seek(start)
        {
            warn!(start, error = %err, "Seek failed; reading from the beginning");
        }

        let mut meter = ProgressMeter::started_at(started, expected);
        let frames_timer = self.metrics.start_stage(stage::FRAMES);
        while let Some(frame) = source.next_frame()? {
            if let Some(end) = settings.window.end
                && frame.timestamp > end
            {
                debug!(timestamp = frame.timestamp, end, "Reached end of window");
                break;
            }
            if frame.index % interval != 0 {
                self.metrics.record_frame_skipped();
                continue;
            }

            let kept = writer.frame_count() as u64;
            let image = prepare_frame(frame.image, &info, width, height);
            let bytes = self
                .codec
                .compress(&image, settings.quality)
                .map_err(|source| EncodeError::Compression {
                    index: kept,
                    source,
                })?;
            writer.add_frame(bytes);
            self.metrics.record_frame_kept();

            let update = meter.advance();
            self.report(job_id, &update);
        }
        frames_timer.stop();

        if writer.frame_count() == 0 {
            return Err(EncodeError::NoFrames);
        }

        let audio_outcome = if !settings.audio {
            AudioOutcome::Disabled
        } else if !info.has_audio {
            AudioOutcome::Absent {
                reason: "source has no audio stream".into(),
            }
        } else {
            let _timer = self.metrics.start_stage(stage::AUDIO);
            let (outcome, track) = audio::process_audio(
                self.audio_tool,
                source_path,
                settings.window,
                work_dir.path(),
            );
            if let Some(track) = track {
                writer.set_audio(track.data, track.codec);
            }
            outcome
        };
        info!(audio = %audio_outcome, "Audio stage finished");

        writer.extend_metadata(settings.metadata.clone());
        if !writer.metadata().contains_key("timestamp") {
            writer.set_metadata(
                "timestamp",
                Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
            );
        }

        {
            let _timer = self.metrics.start_stage(stage::WRITE);
            if let Some(parent) = output.parent().filter(|p| !p.as_os_str().is_empty()) {
                fs::create_dir_all(parent).map_err(|source| EncodeError::Io {
                    path: parent.to_path_buf(),
                    source,
                })?;
            }
            writer.write(output)?;
        }
        let written = fs::metadata(output).map(|m| m.len()).unwrap_or(0);
        self.metrics.record_bytes_written(written);
        self.metrics.record_total_duration(started.elapsed());

        self.report(job_id, &meter.finish());
        info!(
            frames = writer.frame_count(),
            size_bytes = written,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Encode finished"
        );

        Ok(EncodeReport {
            job_id: job_id.to_string(),
            output: output.to_path_buf(),
            frames: writer.frame_count(),
            width,
            height,
            fps: settings.fps,
            loop_count: settings.loop_count,
            audio: audio_outcome,
            metrics: self.metrics.snapshot(),
        })
    }

    fn report(&self, job_id: &str, update: &ProgressUpdate) {
        if let Some(sink) = self.progress {
            sink.report(job_id, update);
        }
    }
}

/// Rotates upright, resizes and drops alpha.
fn prepare_frame(image: DynamicImage, info: &SourceInfo, width: u16, height: u16) -> DynamicImage {
    let upright = info.rotation.apply(image);
    let (width, height) = (u32::from(width), u32::from(height));
    let resized = if upright.width() == width && upright.height() == height {
        upright
    } else {
        upright.resize_exact(width, height, ResizeFilter::Triangle)
    };
    match resized {
        DynamicImage::ImageRgb8(_) => resized,
        other => DynamicImage::ImageRgb8(other.to_rgb8()),
    }
}

/// Encodes a video file with the ffmpeg-backed source and audio tool and the
/// WebP frame codec.
pub fn encode_file(
    job_id: &str,
    input: &Path,
    output: &Path,
    options: &EncodeOptions,
    progress: Option<&dyn ProgressSink>,
) -> Result<EncodeReport, EncodeError> {
    let settings = options.resolve()?;
    ffmpeg::ensure_ffmpeg()?;

    let metrics = MetricsCollector::new();
    let mut source = {
        let _timer = metrics.start_stage(stage::PROBE);
        FfmpegSource::open(input)?.with_end(settings.window.end)
    };

    let codec = WebpCodec::new();
    let audio_tool = FfmpegAudioTool::new(options.audio_format);
    let mut encoder = Encoder::new(&codec, &audio_tool).with_metrics(metrics);
    if let Some(sink) = progress {
        encoder = encoder.with_progress(sink);
    }
    encoder.encode(job_id, &mut source, input, output, &settings)
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::source::Rotation;

    fn info(width: u32, height: u32, fps: f64, frames: u64) -> SourceInfo {
        SourceInfo {
            width,
            height,
            fps,
            frame_count: frames,
            duration: frames as f64 / fps,
            rotation: Rotation::None,
            has_audio: false,
        }
    }

    #[test]
    fn preset_overrides_explicit_fields() {
        let options = EncodeOptions {
            preset: Some("hq".into()),
            fps: 5,
            width: 100,
            audio: false,
            ..EncodeOptions::default()
        };
        let settings = options.resolve().unwrap();
        assert_eq!(
            (settings.fps, settings.width, settings.quality, settings.audio),
            (24, 720, 90, true)
        );
    }

    #[test]
    fn unknown_preset_and_bad_ranges_are_rejected() {
        let unknown = EncodeOptions {
            preset: Some("ultra".into()),
            ..EncodeOptions::default()
        };
        assert!(matches!(unknown.resolve(), Err(EncodeError::UnknownPreset { .. })));

        let invalid = [
            EncodeOptions {
                fps: 0,
                ..EncodeOptions::default()
            },
            EncodeOptions {
                fps: 256,
                ..EncodeOptions::default()
            },
            EncodeOptions {
                width: 70_000,
                ..EncodeOptions::default()
            },
            EncodeOptions {
                quality: 101,
                ..EncodeOptions::default()
            },
            EncodeOptions {
                start: Some(4.0),
                end: Some(2.0),
                ..EncodeOptions::default()
            },
            EncodeOptions {
                start: Some(-1.0),
                ..EncodeOptions::default()
            },
        ];
        for options in invalid {
            assert!(matches!(options.resolve(), Err(EncodeError::InvalidSettings(_))));
        }
    }

    #[test]
    fn dimensions_follow_aspect_ratio_and_rotation() {
        let settings = EncodeOptions::default().resolve().unwrap();
        assert_eq!(
            settings.output_dimensions(&info(1920, 1080, 30.0, 1)).unwrap(),
            (480, 270)
        );

        let mut portrait = info(1920, 1080, 30.0, 1);
        portrait.rotation = Rotation::Cw90;
        assert_eq!(settings.output_dimensions(&portrait).unwrap(), (480, 853));

        let sliver = info(10_000, 1, 30.0, 1);
        assert_eq!(settings.output_dimensions(&sliver).unwrap(), (480, 1));
    }

    #[test]
    fn decimation_and_expected_count() {
        let settings = EncodeOptions::default().resolve().unwrap();
        assert_eq!(settings.decimation_interval(30.0), 2);
        assert_eq!(settings.decimation_interval(29.97), 1);
        assert_eq!(settings.decimation_interval(10.0), 1);
        assert_eq!(settings.expected_frames(&info(64, 48, 30.0, 300)), 150);
        assert_eq!(settings.expected_frames(&info(64, 48, 30.0, 0)), 1);

        let windowed = EncodeOptions {
            start: Some(2.0),
            end: Some(4.0),
            ..EncodeOptions::default()
        }
        .resolve()
        .unwrap();
        assert_eq!(windowed.expected_frames(&info(64, 48, 30.0, 300)), 30);
    }
}
