//! Conversion jobs between source videos and MPGIF containers.

pub mod batch;
pub mod decode;
pub mod encode;

pub use batch::{BatchJob, BatchSummary, run_batch};
pub use decode::{DecodeError, DecodeOptions, DecodeReport, Decoder, decode_file};
pub use encode::{
    EncodeError, EncodeOptions, EncodeReport, EncodeSettings, Encoder, encode_file,
};

pub const CONTAINER_EXTENSION: &str = "mpgif";
pub const DECODED_EXTENSION: &str = "mp4";

/// Source formats picked up when encoding a whole directory.
pub const VIDEO_EXTENSIONS: [&str; 4] = ["mp4", "webm", "gif", "mov"];
