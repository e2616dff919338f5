//! The MPGIF container: a fixed header followed by length-prefixed frame
//! records, an audio section and (from version 2) a JSON metadata section.
//!
//! ```text
//! Header (16 bytes): magic[5]="MPGIF" | version:u8 | width:u16 | height:u16 | fps:u8 | frame_count:u32 | loop_count:u8
//! Frame[frame_count]: length:u32 | bytes[length]
//! AudioSection:       codec_id:u8 | length:u32 | bytes[length]
//! MetadataSection:    (version >= 2) length:u32 | utf8_json_bytes[length]
//! ```
//!
//! All integers are big-endian. Frame and audio payloads are opaque; which
//! image codec produced the frames is agreed out of band.

pub mod reader;
pub mod writer;

use std::fmt;
use std::io;
use std::num::NonZeroU8;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

pub use reader::{Container, ContainerInfo, ContainerReader};
pub use writer::ContainerWriter;

pub const MAGIC: [u8; 5] = *b"MPGIF";
pub const CURRENT_VERSION: u8 = 2;
/// First version carrying a metadata section.
pub const METADATA_VERSION: u8 = 2;
pub const HEADER_LEN: usize = 16;
pub const FRAME_PREFIX_LEN: usize = 4;
pub const AUDIO_PREFIX_LEN: usize = 5;
pub const METADATA_PREFIX_LEN: usize = 4;

#[derive(Debug, Error)]
pub enum ContainerError {
    #[error("file is too short for an MPGIF header ({len} bytes, need {})", HEADER_LEN)]
    HeaderTooShort { len: usize },
    #[error("invalid signature {found:?}, expected \"MPGIF\"")]
    BadMagic { found: [u8; 5] },
    #[error("corrupted frame record {index}: {reason}")]
    Corruption { index: u32, reason: String },
    #[error("frame {index} is {len} bytes and does not fit a frame record")]
    FrameTooLarge { index: usize, len: usize },
    #[error("{count} frames do not fit the header frame counter")]
    TooManyFrames { count: usize },
    #[error("audio track is {len} bytes and does not fit the audio section")]
    AudioTooLarge { len: usize },
    #[error("metadata is {len} bytes of JSON and does not fit the metadata section")]
    MetadataTooLarge { len: usize },
    #[error("failed to serialize metadata: {0}")]
    Metadata(#[from] serde_json::Error),
    #[error("I/O error on '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl ContainerError {
    /// Bad magic or a header shorter than the fixed size.
    pub fn is_format_error(&self) -> bool {
        matches!(self, Self::HeaderTooShort { .. } | Self::BadMagic { .. })
    }

    pub fn is_corruption(&self) -> bool {
        matches!(self, Self::Corruption { .. })
    }
}

/// Fixed-size header at the start of every container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Header {
    pub version: u8,
    pub width: u16,
    pub height: u16,
    pub fps: u8,
    pub frame_count: u32,
    pub loop_count: u8,
}

impl Header {
    pub fn to_bytes(&self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out[..5].copy_from_slice(&MAGIC);
        out[5] = self.version;
        out[6..8].copy_from_slice(&self.width.to_be_bytes());
        out[8..10].copy_from_slice(&self.height.to_be_bytes());
        out[10] = self.fps;
        out[11..15].copy_from_slice(&self.frame_count.to_be_bytes());
        out[15] = self.loop_count;
        out
    }

    pub fn parse(data: &[u8]) -> Result<Self, ContainerError> {
        if data.len() >= MAGIC.len() && data[..MAGIC.len()] != MAGIC {
            let mut found = [0u8; 5];
            found.copy_from_slice(&data[..MAGIC.len()]);
            return Err(ContainerError::BadMagic { found });
        }
        if data.len() < HEADER_LEN {
            return Err(ContainerError::HeaderTooShort { len: data.len() });
        }
        Ok(Self {
            version: data[5],
            width: u16::from_be_bytes([data[6], data[7]]),
            height: u16::from_be_bytes([data[8], data[9]]),
            fps: data[10],
            frame_count: u32::from_be_bytes([data[11], data[12], data[13], data[14]]),
            loop_count: data[15],
        })
    }
}

/// Codec of the audio section. Id 0 marks an absent track.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioCodec {
    #[default]
    None,
    Opus,
    Aac,
    Mp3,
    /// An id this version does not know; kept so the bytes survive a rewrite.
    Unknown(u8),
}

impl AudioCodec {
    pub fn from_id(id: u8) -> Self {
        match id {
            0 => Self::None,
            1 => Self::Opus,
            2 => Self::Aac,
            3 => Self::Mp3,
            other => Self::Unknown(other),
        }
    }

    pub fn id(self) -> u8 {
        match self {
            Self::None => 0,
            Self::Opus => 1,
            Self::Aac => 2,
            Self::Mp3 => 3,
            Self::Unknown(id) => id,
        }
    }

    /// File extension used when the track is spilled to disk for muxing.
    pub fn extension(self) -> &'static str {
        match self {
            Self::Opus => "opus",
            Self::Aac => "aac",
            Self::Mp3 => "mp3",
            Self::None | Self::Unknown(_) => "bin",
        }
    }
}

impl fmt::Display for AudioCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => f.write_str("none"),
            Self::Opus => f.write_str("opus"),
            Self::Aac => f.write_str("aac"),
            Self::Mp3 => f.write_str("mp3"),
            Self::Unknown(id) => write!(f, "unknown({id})"),
        }
    }
}

/// How many times a player shows the clip. `loop_count = N > 0` means N
/// plays in total, not N repeats after the first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LoopMode {
    Infinite,
    Times(NonZeroU8),
}

impl LoopMode {
    pub fn from_count(loop_count: u8) -> Self {
        match NonZeroU8::new(loop_count) {
            Some(count) => Self::Times(count),
            None => Self::Infinite,
        }
    }

    pub fn count(self) -> u8 {
        match self {
            Self::Infinite => 0,
            Self::Times(count) => count.get(),
        }
    }

    pub fn is_infinite(self) -> bool {
        matches!(self, Self::Infinite)
    }
}

impl fmt::Display for LoopMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Infinite => f.write_str("infinite"),
            Self::Times(count) if count.get() == 1 => f.write_str("play once"),
            Self::Times(count) => write!(f, "play {count} times"),
        }
    }
}

/// Free-form string metadata, kept in insertion order and stored as a JSON
/// object.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Metadata {
    #[serde(deserialize_with = "deserialize_entries")]
    entries: Map<String, Value>,
}

impl Metadata {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces `key`, keeping the original position on replace.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) -> Option<String> {
        self.entries
            .insert(key.into(), Value::String(value.into()))
            .map(value_to_string)
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).and_then(Value::as_str)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries
            .iter()
            .map(|(key, value)| (key.as_str(), value.as_str().unwrap_or_default()))
    }

    /// Upserts every entry of `other`.
    pub fn extend(&mut self, other: Metadata) {
        for (key, value) in other.entries {
            self.entries.insert(key, value);
        }
    }

    pub fn to_json_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(&self.entries)
    }

    /// Parses a metadata section payload. The payload must be a UTF-8 JSON
    /// object; scalar values that are not strings keep their JSON text.
    pub fn from_json_bytes(bytes: &[u8]) -> Result<Self, MetadataError> {
        let text = std::str::from_utf8(bytes).map_err(MetadataError::Utf8)?;
        let value: Value = serde_json::from_str(text).map_err(MetadataError::Json)?;
        match value {
            Value::Object(map) => Ok(Self::from(map)),
            other => Err(MetadataError::NotAnObject(json_kind(&other))),
        }
    }
}

impl From<Map<String, Value>> for Metadata {
    fn from(map: Map<String, Value>) -> Self {
        let entries = map
            .into_iter()
            .map(|(key, value)| (key, Value::String(value_to_string(value))))
            .collect();
        Self { entries }
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Metadata {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut metadata = Self::new();
        for (key, value) in iter {
            metadata.insert(key, value);
        }
        metadata
    }
}

#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("metadata is not valid UTF-8: {0}")]
    Utf8(std::str::Utf8Error),
    #[error("metadata is not valid JSON: {0}")]
    Json(serde_json::Error),
    #[error("metadata must be a JSON object, found {0}")]
    NotAnObject(&'static str),
}

fn deserialize_entries<'de, D>(deserializer: D) -> Result<Map<String, Value>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let raw = Map::<String, Value>::deserialize(deserializer)?;
    Ok(Metadata::from(raw).entries)
}

fn value_to_string(value: Value) -> String {
    match value {
        Value::String(s) => s,
        other => other.to_string(),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_layout_is_big_endian() {
        let header = Header {
            version: CURRENT_VERSION,
            width: 0x0140,
            height: 0x00F0,
            fps: 15,
            frame_count: 0x0102_0304,
            loop_count: 3,
        };
        let bytes = header.to_bytes();
        assert_eq!(&bytes[..5], b"MPGIF");
        assert_eq!(bytes[5], 2);
        assert_eq!(&bytes[6..10], &[0x01, 0x40, 0x00, 0xF0]);
        assert_eq!(bytes[10], 15);
        assert_eq!(&bytes[11..15], &[1, 2, 3, 4]);
        assert_eq!(bytes[15], 3);
        assert_eq!(Header::parse(&bytes).unwrap(), header);
    }

    #[test]
    fn short_or_foreign_headers_are_format_errors() {
        let err = Header::parse(b"MPGIF\x02").unwrap_err();
        assert!(matches!(err, ContainerError::HeaderTooShort { len: 6 }));
        assert!(err.is_format_error());

        let err = Header::parse(b"GIF89a0000000000000").unwrap_err();
        assert!(matches!(err, ContainerError::BadMagic { .. }));
        assert!(err.is_format_error());
    }

    #[test]
    fn loop_mode_descriptions() {
        assert_eq!(LoopMode::from_count(0).to_string(), "infinite");
        assert_eq!(LoopMode::from_count(1).to_string(), "play once");
        assert_eq!(LoopMode::from_count(5).to_string(), "play 5 times");
        assert_eq!(LoopMode::from_count(5).count(), 5);
        assert!(LoopMode::from_count(0).is_infinite());
    }

    #[test]
    fn audio_codec_ids() {
        for codec in [
            AudioCodec::None,
            AudioCodec::Opus,
            AudioCodec::Aac,
            AudioCodec::Mp3,
        ] {
            assert_eq!(AudioCodec::from_id(codec.id()), codec);
        }
        assert_eq!(AudioCodec::from_id(9), AudioCodec::Unknown(9));
        assert_eq!(AudioCodec::Mp3.extension(), "mp3");
    }

    #[test]
    fn metadata_keeps_insertion_order_and_upserts() {
        let mut metadata = Metadata::new();
        metadata.insert("title", "Sample");
        metadata.insert("author", "someone");
        assert_eq!(
            metadata.insert("title", "Renamed").as_deref(),
            Some("Sample")
        );
        let keys: Vec<_> = metadata.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, ["title", "author"]);
        assert_eq!(
            String::from_utf8(metadata.to_json_bytes().unwrap()).unwrap(),
            r#"{"title":"Renamed","author":"someone"}"#
        );
    }

    #[test]
    fn metadata_rejects_non_objects() {
        assert!(matches!(
            Metadata::from_json_bytes(b"[1,2]"),
            Err(MetadataError::NotAnObject("an array"))
        ));
        assert!(matches!(
            Metadata::from_json_bytes(&[0xff, 0xfe]),
            Err(MetadataError::Utf8(_))
        ));
        let parsed = Metadata::from_json_bytes(br#"{"fps": 12, "tags": "a,b"}"#).unwrap();
        assert_eq!(parsed.get("fps"), Some("12"));
        assert_eq!(parsed.get("tags"), Some("a,b"));
    }
}
