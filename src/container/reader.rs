use std::fs;
use std::io::{Cursor, Read};
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{debug, warn};

use super::{
    AUDIO_PREFIX_LEN, AudioCodec, ContainerError, FRAME_PREFIX_LEN, HEADER_LEN, Header, LoopMode,
    METADATA_PREFIX_LEN, METADATA_VERSION, Metadata,
};

/// Opens a container file for a one-shot, eager parse.
#[derive(Debug, Clone)]
pub struct ContainerReader {
    path: PathBuf,
}

impl ContainerReader {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Loads the whole file and parses every section into memory.
    pub fn read(&self) -> Result<Container, ContainerError> {
        let data = fs::read(&self.path).map_err(|source| ContainerError::Io {
            path: self.path.clone(),
            source,
        })?;
        let container = Container::from_bytes(&data)?;
        debug!(
            path = %self.path.display(),
            width = container.header.width,
            height = container.header.height,
            fps = container.header.fps,
            frames = container.frames.len(),
            audio_bytes = container.audio.len(),
            "Container read"
        );
        Ok(container)
    }
}

/// A fully parsed container. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Container {
    header: Header,
    frames: Vec<Vec<u8>>,
    audio_codec: AudioCodec,
    audio: Vec<u8>,
    metadata: Metadata,
}

impl Container {
    pub fn from_bytes(data: &[u8]) -> Result<Self, ContainerError> {
        let header = Header::parse(data)?;
        let mut cursor = Cursor::new(data);
        cursor.set_position(HEADER_LEN as u64);

        let frames = read_frames(&mut cursor, header.frame_count)?;
        let (audio_codec, audio) = read_audio(&mut cursor);
        let metadata = if header.version >= METADATA_VERSION {
            read_metadata(&mut cursor)
        } else {
            Metadata::new()
        };

        let trailing = remaining(&cursor);
        if trailing > 0 {
            debug!(trailing, "Ignoring bytes after the last known section");
        }

        Ok(Self {
            header,
            frames,
            audio_codec,
            audio,
            metadata,
        })
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    pub fn width(&self) -> u16 {
        self.header.width
    }

    pub fn height(&self) -> u16 {
        self.header.height
    }

    pub fn fps(&self) -> u8 {
        self.header.fps
    }

    pub fn loop_mode(&self) -> LoopMode {
        LoopMode::from_count(self.header.loop_count)
    }

    pub fn frames(&self) -> &[Vec<u8>] {
        &self.frames
    }

    pub fn frame(&self, index: usize) -> Option<&[u8]> {
        self.frames.get(index).map(Vec::as_slice)
    }

    /// The audio track, or `None` when the section is absent or empty.
    pub fn audio(&self) -> Option<(AudioCodec, &[u8])> {
        if self.audio.is_empty() || self.audio_codec == AudioCodec::None {
            None
        } else {
            Some((self.audio_codec, &self.audio))
        }
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    pub fn info(&self) -> ContainerInfo {
        let (audio_codec, audio_size) = self
            .audio()
            .map_or((AudioCodec::None, 0), |(codec, data)| (codec, data.len()));
        ContainerInfo {
            version: self.header.version,
            width: self.header.width,
            height: self.header.height,
            fps: self.header.fps,
            declared_frames: self.header.frame_count,
            frames: self.frames.len(),
            loop_mode: self.loop_mode(),
            loop_description: self.loop_mode().to_string(),
            audio_codec,
            audio_size,
            metadata: self.metadata.clone(),
        }
    }
}

/// Read-only summary of a parsed container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContainerInfo {
    pub version: u8,
    pub width: u16,
    pub height: u16,
    pub fps: u8,
    pub declared_frames: u32,
    pub frames: usize,
    pub loop_mode: LoopMode,
    pub loop_description: String,
    pub audio_codec: AudioCodec,
    pub audio_size: usize,
    pub metadata: Metadata,
}

fn remaining(cursor: &Cursor<&[u8]>) -> usize {
    cursor
        .get_ref()
        .len()
        .saturating_sub(cursor.position() as usize)
}

fn take<'a>(cursor: &mut Cursor<&'a [u8]>, len: usize) -> Option<&'a [u8]> {
    if remaining(cursor) < len {
        return None;
    }
    let start = cursor.position() as usize;
    let data = *cursor.get_ref();
    cursor.set_position((start + len) as u64);
    Some(&data[start..start + len])
}

fn read_u32(cursor: &mut Cursor<&[u8]>) -> Option<u32> {
    let mut buf = [0u8; 4];
    cursor.read_exact(&mut buf).ok()?;
    Some(u32::from_be_bytes(buf))
}

fn read_frames(
    cursor: &mut Cursor<&[u8]>,
    declared: u32,
) -> Result<Vec<Vec<u8>>, ContainerError> {
    // The declared count is untrusted; cap the pre-allocation by what the
    // remaining bytes could possibly hold.
    let capacity = (declared as usize).min(remaining(cursor) / FRAME_PREFIX_LEN);
    let mut frames = Vec::with_capacity(capacity);

    for index in 0..declared {
        match remaining(cursor) {
            0 => {
                warn!(
                    declared,
                    read = frames.len(),
                    "Container ends before the declared frame count; keeping frames read so far"
                );
                break;
            }
            left if left < FRAME_PREFIX_LEN => {
                return Err(ContainerError::Corruption {
                    index,
                    reason: format!("length prefix cut short ({left} of {FRAME_PREFIX_LEN} bytes)"),
                });
            }
            _ => {}
        }

        let len = read_u32(cursor).ok_or_else(|| ContainerError::Corruption {
            index,
            reason: "unreadable length prefix".into(),
        })? as usize;
        let left = remaining(cursor);
        let payload = take(cursor, len).ok_or_else(|| ContainerError::Corruption {
            index,
            reason: format!("declares {len} bytes but only {left} remain"),
        })?;
        frames.push(payload.to_vec());
    }

    Ok(frames)
}

fn read_audio(cursor: &mut Cursor<&[u8]>) -> (AudioCodec, Vec<u8>) {
    let Some(prefix) = take(cursor, AUDIO_PREFIX_LEN) else {
        if remaining(cursor) > 0 {
            warn!("Audio section header is truncated; treating the clip as silent");
        }
        return (AudioCodec::None, Vec::new());
    };
    let codec = AudioCodec::from_id(prefix[0]);
    let len = u32::from_be_bytes([prefix[1], prefix[2], prefix[3], prefix[4]]) as usize;
    if len == 0 {
        return (codec, Vec::new());
    }

    match take(cursor, len) {
        Some(data) => (codec, data.to_vec()),
        None => {
            warn!(
                codec = %codec,
                declared = len,
                available = remaining(cursor),
                "Audio track is truncated; dropping it"
            );
            cursor.set_position(cursor.get_ref().len() as u64);
            (AudioCodec::None, Vec::new())
        }
    }
}

fn read_metadata(cursor: &mut Cursor<&[u8]>) -> Metadata {
    let Some(prefix) = take(cursor, METADATA_PREFIX_LEN) else {
        return Metadata::new();
    };
    let len = u32::from_be_bytes([prefix[0], prefix[1], prefix[2], prefix[3]]) as usize;
    if len == 0 {
        return Metadata::new();
    }

    let Some(payload) = take(cursor, len) else {
        warn!(
            declared = len,
            available = remaining(cursor),
            "Metadata section is truncated; ignoring it"
        );
        cursor.set_position(cursor.get_ref().len() as u64);
        return Metadata::new();
    };

    match Metadata::from_json_bytes(payload) {
        Ok(metadata) => metadata,
        Err(err) => {
            warn!(error = %err, "Discarding unreadable metadata");
            Metadata::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::container::ContainerWriter;

    fn header_bytes(version: u8, frame_count: u32) -> Vec<u8> {
        Header {
            version,
            width: 4,
            height: 4,
            fps: 10,
            frame_count,
            loop_count: 0,
        }
        .to_bytes()
        .to_vec()
    }

    #[test]
    fn partial_length_prefix_is_corruption() {
        let mut data = header_bytes(2, 2);
        data.extend_from_slice(&[0, 0, 0, 1, 7]);
        data.extend_from_slice(&[0, 0]);
        let err = Container::from_bytes(&data).unwrap_err();
        assert!(matches!(err, ContainerError::Corruption { index: 1, .. }));
    }

    #[test]
    fn truncated_audio_is_dropped() {
        let mut data = header_bytes(1, 1);
        data.extend_from_slice(&[0, 0, 0, 1, 7]);
        data.extend_from_slice(&[1, 0, 0, 0, 10, 1, 2, 3]);
        let container = Container::from_bytes(&data).unwrap();
        assert_eq!(container.frames().len(), 1);
        assert!(container.audio().is_none());
    }

    #[test]
    fn payload_under_codec_none_counts_as_silence() {
        let mut data = header_bytes(1, 1);
        data.extend_from_slice(&[0, 0, 0, 1, 7]);
        data.extend_from_slice(&[0, 0, 0, 0, 3, 9, 9, 9]);
        let container = Container::from_bytes(&data).unwrap();
        assert!(container.audio().is_none());
        let info = container.info();
        assert_eq!((info.audio_codec, info.audio_size), (AudioCodec::None, 0));
    }

    #[test]
    fn missing_trailing_sections_read_as_absent() {
        let mut data = header_bytes(2, 1);
        data.extend_from_slice(&[0, 0, 0, 2, 1, 2]);
        let container = Container::from_bytes(&data).unwrap();
        assert_eq!(container.frame(0), Some(&[1u8, 2][..]));
        assert!(container.audio().is_none());
        assert!(container.metadata().is_empty());
    }

    #[test]
    fn metadata_that_is_not_an_object_is_discarded() {
        let mut writer = ContainerWriter::new(4, 4, 10, 0);
        writer.add_frame(vec![1]);
        let mut data = writer.to_bytes().unwrap();
        data.truncate(data.len() - METADATA_PREFIX_LEN);
        data.extend_from_slice(&3u32.to_be_bytes());
        data.extend_from_slice(b"[1]");
        let container = Container::from_bytes(&data).unwrap();
        assert!(container.metadata().is_empty());
        assert_eq!(container.frames().len(), 1);
    }

    #[test]
    fn huge_declared_count_does_not_preallocate() {
        let mut data = header_bytes(2, u32::MAX);
        data.extend_from_slice(&[0, 0, 0, 1, 5]);
        let container = Container::from_bytes(&data).unwrap();
        assert_eq!(container.frames().len(), 1);
        assert_eq!(container.info().declared_frames, u32::MAX);
    }
}
