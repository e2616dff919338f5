//! Muxing numbered frame files and an optional audio file into a standard
//! video.

use std::ffi::OsString;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::ffmpeg::{self, ToolError};

/// Everything an assembler needs to produce one output video.
#[derive(Debug, Clone, PartialEq)]
pub struct AssembleRequest {
    /// printf-style pattern, e.g. `/tmp/x/frame_%06d.webp`.
    pub frame_pattern: PathBuf,
    /// Frame files in presentation order, matching `frame_pattern`.
    pub frame_files: Vec<PathBuf>,
    pub fps: u8,
    pub audio: Option<PathBuf>,
    pub output: PathBuf,
}

pub trait VideoAssembler {
    fn assemble(&self, request: &AssembleRequest) -> Result<(), ToolError>;
}

/// H.264/AAC MP4 via the ffmpeg binary.
#[derive(Debug, Clone)]
pub struct FfmpegAssembler {
    crf: u8,
    audio_bitrate: String,
}

impl Default for FfmpegAssembler {
    fn default() -> Self {
        Self {
            crf: 20,
            audio_bitrate: "128k".into(),
        }
    }
}

impl FfmpegAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    fn args(&self, request: &AssembleRequest) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec![
            "-v".into(),
            "error".into(),
            "-y".into(),
            "-framerate".into(),
            request.fps.to_string().into(),
            "-i".into(),
            request.frame_pattern.clone().into(),
        ];
        if let Some(audio) = &request.audio {
            args.push("-i".into());
            args.push(audio.clone().into());
        }
        // libx264 with yuv420p rejects odd dimensions.
        args.extend(
            [
                "-vf",
                "scale=trunc(iw/2)*2:trunc(ih/2)*2",
                "-c:v",
                "libx264",
                "-pix_fmt",
                "yuv420p",
                "-crf",
            ]
            .into_iter()
            .map(OsString::from),
        );
        args.push(self.crf.to_string().into());
        if request.audio.is_some() {
            args.extend(["-c:a", "aac", "-b:a"].into_iter().map(OsString::from));
            args.push(self.audio_bitrate.clone().into());
            args.push("-shortest".into());
        }
        args.extend(["-movflags", "+faststart"].into_iter().map(OsString::from));
        args.push(request.output.clone().into());
        args
    }
}

impl VideoAssembler for FfmpegAssembler {
    fn assemble(&self, request: &AssembleRequest) -> Result<(), ToolError> {
        debug!(
            frames = request.frame_files.len(),
            fps = request.fps,
            audio = request.audio.is_some(),
            output = %request.output.display(),
            "Assembling video"
        );
        let mut cmd = ffmpeg::ffmpeg_command();
        cmd.args(self.args(request));
        ffmpeg::run("ffmpeg", &mut cmd)?;
        Ok(())
    }
}

/// Conventional frame file name for index `index`.
pub fn frame_file_name(index: usize, extension: &str) -> String {
    format!("frame_{index:06}.{extension}")
}

pub fn frame_pattern(dir: &Path, extension: &str) -> PathBuf {
    dir.join(format!("frame_%06d.{extension}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_names_are_zero_padded() {
        assert_eq!(frame_file_name(7, "webp"), "frame_000007.webp");
        assert_eq!(
            frame_pattern(Path::new("/w"), "png"),
            PathBuf::from("/w/frame_%06d.png")
        );
    }

    #[test]
    fn ffmpeg_args_include_audio_only_when_present() {
        let mut request = AssembleRequest {
            frame_pattern: PathBuf::from("f_%06d.webp"),
            frame_files: vec![],
            fps: 12,
            audio: None,
            output: PathBuf::from("out.mp4"),
        };
        let assembler = FfmpegAssembler::new();
        let silent: Vec<String> = assembler
            .args(&request)
            .iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert!(silent.contains(&"libx264".to_string()));
        assert!(silent.contains(&"+faststart".to_string()));
        assert!(!silent.contains(&"aac".to_string()));
        assert_eq!(silent.last().map(String::as_str), Some("out.mp4"));

        request.audio = Some(PathBuf::from("audio.mp3"));
        let with_audio: Vec<String> = assembler
            .args(&request)
            .iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert!(with_audio.contains(&"aac".to_string()));
        assert!(with_audio.contains(&"128k".to_string()));
    }
}
