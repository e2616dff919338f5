#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use image::{DynamicImage, ImageBuffer, Rgb};
use mpgif::audio::{AudioError, AudioTool, TimeWindow};
use mpgif::codec::{CodecError, FrameCodec, WebpCodec};
use mpgif::container::AudioCodec;
use mpgif::source::{FrameSource, Rotation, SourceError, SourceFrame, SourceInfo};

/// In-memory video: frame `n` is a gradient whose red channel encodes `n`.
pub struct SyntheticSource {
    info: SourceInfo,
    cursor: u64,
    base: u64,
}

impl SyntheticSource {
    pub fn new(width: u32, height: u32, fps: f64, frames: u64) -> Self {
        Self {
            info: SourceInfo {
                width,
                height,
                fps,
                frame_count: frames,
                duration: frames as f64 / fps,
                rotation: Rotation::None,
                has_audio: true,
            },
            cursor: 0,
            base: 0,
        }
    }

    pub fn rotated(mut self, rotation: Rotation) -> Self {
        self.info.rotation = rotation;
        self
    }

    pub fn silent(mut self) -> Self {
        self.info.has_audio = false;
        self
    }
}

impl FrameSource for SyntheticSource {
    fn info(&self) -> &SourceInfo {
        &self.info
    }

    fn seek(&mut self, seconds: f64) -> Result<(), SourceError> {
        self.cursor = (seconds * self.info.fps).round() as u64;
        self.base = self.cursor;
        Ok(())
    }

    fn next_frame(&mut self) -> Result<Option<SourceFrame>, SourceError> {
        if self.cursor >= self.info.frame_count {
            return Ok(None);
        }
        let n = self.cursor;
        self.cursor += 1;
        let image = ImageBuffer::from_fn(self.info.width, self.info.height, |x, y| {
            Rgb([(n % 256) as u8, (x * 4) as u8, (y * 4) as u8])
        });
        Ok(Some(SourceFrame {
            index: n - self.base,
            timestamp: n as f64 / self.info.fps,
            image: DynamicImage::ImageRgb8(image),
        }))
    }
}

/// Audio tool whose stages can be told to fail.
#[derive(Default)]
pub struct FakeAudioTool {
    pub fail_extract: bool,
    pub fail_normalize: bool,
    pub fail_compress: bool,
    pub windows: Mutex<Vec<TimeWindow>>,
}

pub const FAKE_AUDIO: &[u8] = b"ID3-fake-mp3";

impl AudioTool for FakeAudioTool {
    fn extract(&self, _: &Path, window: TimeWindow, dir: &Path) -> Result<PathBuf, AudioError> {
        self.windows.lock().unwrap().push(window);
        if self.fail_extract {
            return Err(AudioError::NoAudioStream);
        }
        Ok(dir.join("raw.wav"))
    }

    fn normalize(&self, raw: &Path, dir: &Path) -> Result<PathBuf, AudioError> {
        if self.fail_normalize {
            return Err(AudioError::EmptyOutput(raw.to_path_buf()));
        }
        Ok(dir.join("normalized.wav"))
    }

    fn compress(&self, raw: &Path, _: &Path) -> Result<(Vec<u8>, AudioCodec), AudioError> {
        if self.fail_compress {
            return Err(AudioError::EmptyOutput(raw.to_path_buf()));
        }
        Ok((FAKE_AUDIO.to_vec(), AudioCodec::Mp3))
    }
}

/// WebP codec that refuses the frame with index `fail_at`.
pub struct FailingCodec {
    pub fail_at: usize,
    calls: AtomicUsize,
}

impl FailingCodec {
    pub fn new(fail_at: usize) -> Self {
        Self {
            fail_at,
            calls: AtomicUsize::new(0),
        }
    }
}

impl FrameCodec for FailingCodec {
    fn name(&self) -> &'static str {
        "failing"
    }

    fn extension(&self) -> &'static str {
        "webp"
    }

    fn compress(&self, image: &DynamicImage, quality: u8) -> Result<Vec<u8>, CodecError> {
        if self.calls.fetch_add(1, Ordering::SeqCst) == self.fail_at {
            return Err(CodecError::Prepare {
                codec: "failing",
                reason: "synthetic failure".into(),
            });
        }
        WebpCodec::new().compress(image, quality)
    }

    fn decompress(&self, data: &[u8]) -> Result<DynamicImage, CodecError> {
        WebpCodec::new().decompress(data)
    }
}

pub fn webp_frame(width: u32, height: u32, shade: u8) -> Vec<u8> {
    let pixels = ImageBuffer::from_pixel(width, height, Rgb([shade, 64, 128]));
    let image = DynamicImage::ImageRgb8(pixels);
    WebpCodec::new().compress(&image, 80).expect("webp encode")
}

/// Deterministic filler bytes.
pub fn pseudo_random_bytes(seed: u64, len: usize) -> Vec<u8> {
    let mut state = seed
        .wrapping_mul(6364136223846793005)
        .wrapping_add(1442695040888963407);
    (0..len)
        .map(|_| {
            state = state
                .wrapping_mul(6364136223846793005)
                .wrapping_add(1442695040888963407);
            (state >> 33) as u8
        })
        .collect()
}
