use std::fs;
use std::path::Path;

use tracing::info;

use super::{
    AUDIO_PREFIX_LEN, AudioCodec, CURRENT_VERSION, ContainerError, FRAME_PREFIX_LEN, HEADER_LEN,
    Header, METADATA_PREFIX_LEN, Metadata,
};

/// Builds a container in memory and flushes it in a single pass.
///
/// Frames are appended in presentation order, audio is replaced by every
/// `set_audio` call and metadata is upserted by key. Nothing touches the
/// filesystem until [`ContainerWriter::write`].
#[derive(Debug, Clone)]
pub struct ContainerWriter {
    width: u16,
    height: u16,
    fps: u8,
    loop_count: u8,
    frames: Vec<Vec<u8>>,
    audio: Option<(AudioCodec, Vec<u8>)>,
    metadata: Metadata,
}

impl ContainerWriter {
    pub fn new(width: u16, height: u16, fps: u8, loop_count: u8) -> Self {
        Self {
            width,
            height,
            fps,
            loop_count,
            frames: Vec::new(),
            audio: None,
            metadata: Metadata::new(),
        }
    }

    pub fn add_frame(&mut self, frame: impl Into<Vec<u8>>) {
        self.frames.push(frame.into());
    }

    pub fn set_audio(&mut self, data: impl Into<Vec<u8>>, codec: AudioCodec) {
        self.audio = Some((codec, data.into()));
    }

    pub fn set_metadata(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.metadata.insert(key, value);
    }

    pub fn extend_metadata(&mut self, metadata: Metadata) {
        self.metadata.extend(metadata);
    }

    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    pub fn header(&self) -> Result<Header, ContainerError> {
        let frame_count = u32::try_from(self.frames.len()).map_err(|_| {
            ContainerError::TooManyFrames {
                count: self.frames.len(),
            }
        })?;
        Ok(Header {
            version: CURRENT_VERSION,
            width: self.width,
            height: self.height,
            fps: self.fps,
            frame_count,
            loop_count: self.loop_count,
        })
    }

    /// Serializes the whole container.
    pub fn to_bytes(&self) -> Result<Vec<u8>, ContainerError> {
        let header = self.header()?;
        let payload: usize = self.frames.iter().map(|f| f.len() + FRAME_PREFIX_LEN).sum();
        let audio_len = self.audio.as_ref().map_or(0, |(_, data)| data.len());
        let capacity = HEADER_LEN + payload + AUDIO_PREFIX_LEN + audio_len + METADATA_PREFIX_LEN;
        let mut out = Vec::with_capacity(capacity);
        out.extend_from_slice(&header.to_bytes());

        for (index, frame) in self.frames.iter().enumerate() {
            let len = u32::try_from(frame.len()).map_err(|_| ContainerError::FrameTooLarge {
                index,
                len: frame.len(),
            })?;
            out.extend_from_slice(&len.to_be_bytes());
            out.extend_from_slice(frame);
        }

        match &self.audio {
            Some((codec, data)) if !data.is_empty() && *codec != AudioCodec::None => {
                let len = u32::try_from(data.len())
                    .map_err(|_| ContainerError::AudioTooLarge { len: data.len() })?;
                out.push(codec.id());
                out.extend_from_slice(&len.to_be_bytes());
                out.extend_from_slice(data);
            }
            _ => {
                out.push(AudioCodec::None.id());
                out.extend_from_slice(&0u32.to_be_bytes());
            }
        }

        if self.metadata.is_empty() {
            out.extend_from_slice(&0u32.to_be_bytes());
        } else {
            let json = self.metadata.to_json_bytes()?;
            let len = u32::try_from(json.len())
                .map_err(|_| ContainerError::MetadataTooLarge { len: json.len() })?;
            out.extend_from_slice(&len.to_be_bytes());
            out.extend_from_slice(&json);
        }

        Ok(out)
    }

    /// Writes the container to `path`, replacing any existing file.
    pub fn write(&self, path: &Path) -> Result<(), ContainerError> {
        let bytes = self.to_bytes()?;
        fs::write(path, &bytes).map_err(|source| ContainerError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        info!(
            path = %path.display(),
            frames = self.frames.len(),
            audio_bytes = self.audio.as_ref().map_or(0, |(_, data)| data.len()),
            metadata_entries = self.metadata.len(),
            size_bytes = bytes.len(),
            "Container written"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_writer_emits_absent_sections() {
        let writer = ContainerWriter::new(2, 2, 10, 0);
        let bytes = writer.to_bytes().unwrap();
        assert_eq!(
            bytes.len(),
            HEADER_LEN + AUDIO_PREFIX_LEN + METADATA_PREFIX_LEN
        );
        assert_eq!(&bytes[HEADER_LEN..], &[0, 0, 0, 0, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn last_audio_wins() {
        let mut writer = ContainerWriter::new(2, 2, 10, 0);
        writer.set_audio(vec![1, 2, 3], AudioCodec::Opus);
        writer.set_audio(vec![9], AudioCodec::Mp3);
        let bytes = writer.to_bytes().unwrap();
        assert_eq!(&bytes[HEADER_LEN..HEADER_LEN + 6], &[3, 0, 0, 0, 1, 9]);
    }

    #[test]
    fn frames_are_length_prefixed_in_order() {
        let mut writer = ContainerWriter::new(2, 2, 10, 1);
        writer.add_frame(b"ab".to_vec());
        writer.add_frame(b"cde".to_vec());
        let bytes = writer.to_bytes().unwrap();
        assert_eq!(&bytes[11..15], &2u32.to_be_bytes());
        assert_eq!(
            &bytes[HEADER_LEN..HEADER_LEN + 13],
            &[0, 0, 0, 2, b'a', b'b', 0, 0, 0, 3, b'c', b'd', b'e']
        );
    }
}
