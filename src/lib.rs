pub mod assembler;
pub mod audio;
pub mod codec;
pub mod container;
pub mod convert;
pub mod ffmpeg;
pub mod observability;
pub mod presets;
pub mod progress;
pub mod recipe;
pub mod source;
pub mod validation;

pub use container::{AudioCodec, Container, ContainerInfo, ContainerReader, ContainerWriter};
pub use convert::{DecodeOptions, EncodeOptions, decode_file, encode_file};
pub use recipe::Recipe;
