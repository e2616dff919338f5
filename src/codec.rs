//! Still-image codecs for frame records.
//!
//! The container never records which codec produced its frames; encoder and
//! decoder agree on it out of band. WebP is what every MPGIF producer uses.

use image::{DynamicImage, ImageFormat};
use thiserror::Error;
use webp::Encoder as WebpEncoder;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("failed to prepare {codec} encoder: {reason}")]
    Prepare { codec: &'static str, reason: String },
    #[error("failed to decode {codec} frame: {source}")]
    Decode {
        codec: &'static str,
        #[source]
        source: image::ImageError,
    },
}

pub trait FrameCodec: Send + Sync {
    fn name(&self) -> &'static str;

    /// Extension used when frames are spilled to numbered files.
    fn extension(&self) -> &'static str;

    /// `quality` is on a 0..=100 scale.
    fn compress(&self, image: &DynamicImage, quality: u8) -> Result<Vec<u8>, CodecError>;

    fn decompress(&self, data: &[u8]) -> Result<DynamicImage, CodecError>;
}

/// Lossy WebP at the job's quality setting.
#[derive(Debug, Clone, Copy, Default)]
pub struct WebpCodec;

impl WebpCodec {
    pub fn new() -> Self {
        Self
    }
}

impl FrameCodec for WebpCodec {
    fn name(&self) -> &'static str {
        "webp"
    }

    fn extension(&self) -> &'static str {
        "webp"
    }

    fn compress(&self, image: &DynamicImage, quality: u8) -> Result<Vec<u8>, CodecError> {
        let encoder = WebpEncoder::from_image(image).map_err(|reason| CodecError::Prepare {
            codec: "WebP",
            reason: reason.to_string(),
        })?;
        Ok(encoder.encode(f32::from(quality.min(100))).to_vec())
    }

    fn decompress(&self, data: &[u8]) -> Result<DynamicImage, CodecError> {
        let decoded = image::load_from_memory_with_format(data, ImageFormat::WebP);
        decoded.map_err(|source| CodecError::Decode {
            codec: "WebP",
            source,
        })
    }
}
