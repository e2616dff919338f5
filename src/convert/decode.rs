use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Instant;

use image::ImageFormat;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, instrument};

use crate::assembler::{self, AssembleRequest, FfmpegAssembler, VideoAssembler};
use crate::codec::{CodecError, FrameCodec, WebpCodec};
use crate::container::{AudioCodec, ContainerError, ContainerReader};
use crate::ffmpeg::{self, ToolError};
use crate::observability::{MetricsCollector, MetricsSnapshot, stage};

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error(transparent)]
    Container(#[from] ContainerError),
    #[error("container has no frames to decode")]
    NoFrames,
    #[error("unsupported frame extension '{0}'")]
    UnsupportedFrameFormat(String),
    #[error("failed to convert frame {index}: {reason}")]
    FrameConversion { index: usize, reason: String },
    #[error("failed to create job working directory: {0}")]
    WorkDir(#[source] io::Error),
    #[error("I/O error on '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("video assembly failed: {0}")]
    Assemble(#[from] ToolError),
}

impl DecodeError {
    /// Diagnostic output of a failed assembler run.
    pub fn assembler_stderr(&self) -> Option<&str> {
        match self {
            Self::Assemble(err) => err.stderr(),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DecodeOptions {
    /// Extension of the spilled frame files. Anything other than the frame
    /// codec's own extension makes frames go through a decode/re-encode.
    pub frame_extension: String,
}

impl Default for DecodeOptions {
    fn default() -> Self {
        Self {
            frame_extension: "webp".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DecodeReport {
    pub job_id: String,
    pub output: PathBuf,
    pub frames: usize,
    pub fps: u8,
    pub audio_codec: AudioCodec,
    pub metrics: MetricsSnapshot,
}

/// Turns a container back into a regular video through a [`VideoAssembler`].
pub struct Decoder<'a> {
    codec: &'a dyn FrameCodec,
    assembler: &'a dyn VideoAssembler,
    metrics: MetricsCollector,
}

impl<'a> Decoder<'a> {
    pub fn new(codec: &'a dyn FrameCodec, assembler: &'a dyn VideoAssembler) -> Self {
        Self {
            codec,
            assembler,
            metrics: MetricsCollector::new(),
        }
    }

    #[instrument(skip_all, fields(job = job_id, input = %input.display()))]
    pub fn decode(
        &self,
        job_id: &str,
        input: &Path,
        output: &Path,
        options: &DecodeOptions,
    ) -> Result<DecodeReport, DecodeError> {
        let started = Instant::now();
        let extension = options
            .frame_extension
            .trim_start_matches('.')
            .to_ascii_lowercase();
        let transcode_to = if extension == self.codec.extension() {
            None
        } else {
            Some(
                spill_format(&extension)
                    .ok_or_else(|| DecodeError::UnsupportedFrameFormat(extension.clone()))?,
            )
        };

        let container = ContainerReader::new(input).read()?;
        if container.frames().is_empty() {
            return Err(DecodeError::NoFrames);
        }

        let work_dir = tempfile::Builder::new()
            .prefix("mpgif-decode-")
            .tempdir()
            .map_err(DecodeError::WorkDir)?;

        let extract_timer = self.metrics.start_stage(stage::EXTRACT);
        let mut frame_files = Vec::with_capacity(container.frames().len());
        for (index, frame) in container.frames().iter().enumerate() {
            let path = work_dir
                .path()
                .join(assembler::frame_file_name(index, &extension));
            match transcode_to {
                None => write_file(&path, frame)?,
                Some(format) => self.transcode_frame(index, frame, &path, format)?,
            }
            frame_files.push(path);
        }

        let audio = match container.audio() {
            Some((codec, data)) => {
                let path = work_dir.path().join(format!("audio.{}", codec.extension()));
                write_file(&path, data)?;
                Some(path)
            }
            None => None,
        };
        extract_timer.stop();
        debug!(
            frames = frame_files.len(),
            audio = audio.is_some(),
            dir = %work_dir.path().display(),
            "Spilled container to working directory"
        );

        if let Some(parent) = output.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|source| DecodeError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let request = AssembleRequest {
            frame_pattern: assembler::frame_pattern(work_dir.path(), &extension),
            frame_files,
            fps: container.fps().max(1),
            audio,
            output: output.to_path_buf(),
        };
        {
            let _timer = self.metrics.start_stage(stage::ASSEMBLE);
            self.assembler.assemble(&request)?;
        }

        if let Ok(meta) = fs::metadata(output) {
            self.metrics.record_bytes_written(meta.len());
        }
        self.metrics.record_total_duration(started.elapsed());
        info!(
            frames = request.frame_files.len(),
            output = %output.display(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Decode finished"
        );

        Ok(DecodeReport {
            job_id: job_id.to_string(),
            output: output.to_path_buf(),
            frames: request.frame_files.len(),
            fps: request.fps,
            audio_codec: container
                .audio()
                .map_or(AudioCodec::None, |(codec, _)| codec),
            metrics: self.metrics.snapshot(),
        })
    }

    fn transcode_frame(
        &self,
        index: usize,
        frame: &[u8],
        path: &Path,
        format: ImageFormat,
    ) -> Result<(), DecodeError> {
        let conversion = |reason: String| DecodeError::FrameConversion { index, reason };
        let image = self
            .codec
            .decompress(frame)
            .map_err(|err: CodecError| conversion(err.to_string()))?;
        let image = match format {
            // JPEG has no alpha channel.
            ImageFormat::Jpeg => image::DynamicImage::ImageRgb8(image.to_rgb8()),
            _ => image,
        };
        image
            .save_with_format(path, format)
            .map_err(|err| conversion(err.to_string()))
    }
}

/// Still formats frames can be re-encoded to before muxing.
fn spill_format(extension: &str) -> Option<ImageFormat> {
    match extension {
        "png" => Some(ImageFormat::Png),
        "jpg" | "jpeg" => Some(ImageFormat::Jpeg),
        "bmp" => Some(ImageFormat::Bmp),
        _ => None,
    }
}

fn write_file(path: &Path, data: &[u8]) -> Result<(), DecodeError> {
    fs::write(path, data).map_err(|source| DecodeError::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// Decodes with the WebP frame codec and the ffmpeg assembler.
pub fn decode_file(
    job_id: &str,
    input: &Path,
    output: &Path,
    options: &DecodeOptions,
) -> Result<DecodeReport, DecodeError> {
    ffmpeg::ensure_ffmpeg()?;
    let codec = WebpCodec::new();
    let assembler = FfmpegAssembler::new();
    Decoder::new(&codec, &assembler).decode(job_id, input, output, options)
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::cell::RefCell;

    use crate::container::ContainerWriter;

    #[derive(Default)]
    struct RecordingAssembler {
        requests: RefCell<Vec<AssembleRequest>>,
    }

    impl VideoAssembler for RecordingAssembler {
        fn assemble(&self, request: &AssembleRequest) -> Result<(), ToolError> {
            self.requests.borrow_mut().push(request.clone());
            Ok(())
        }
    }

    #[test]
    fn unwritable_frame_extension_is_rejected_before_reading() {
        let assembler = RecordingAssembler::default();
        let options = DecodeOptions {
            frame_extension: "xyz".into(),
        };
        let err = Decoder::new(&WebpCodec::new(), &assembler)
            .decode(
                "job",
                Path::new("missing.mpgif"),
                Path::new("out.mp4"),
                &options,
            )
            .unwrap_err();
        assert!(matches!(err, DecodeError::UnsupportedFrameFormat(ext) if ext == "xyz"));
    }

    #[test]
    fn empty_container_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("empty.mpgif");
        ContainerWriter::new(2, 2, 10, 0).write(&input).unwrap();
        let assembler = RecordingAssembler::default();
        let err = Decoder::new(&WebpCodec::new(), &assembler)
            .decode(
                "job",
                &input,
                &dir.path().join("out.mp4"),
                &DecodeOptions::default(),
            )
            .unwrap_err();
        assert!(matches!(err, DecodeError::NoFrames));
        assert!(assembler.requests.borrow().is_empty());
    }
}
