mod common;

use std::fs;

use mpgif::container::{
    AudioCodec, Container, ContainerError, ContainerReader, ContainerWriter, Header, HEADER_LEN,
    LoopMode,
};
use tempfile::tempdir;

use common::pseudo_random_bytes;

#[test]
fn round_trip_preserves_everything() {
    let temp = tempdir().unwrap();
    for count in [0usize, 1, 2, 17, 500] {
        let mut writer = ContainerWriter::new(320, 180, 12, 3);
        let frames: Vec<Vec<u8>> = (0..count)
            .map(|i| pseudo_random_bytes(i as u64, i % 97))
            .collect();
        for frame in &frames {
            writer.add_frame(frame.clone());
        }
        writer.set_audio(pseudo_random_bytes(99, 1024), AudioCodec::Opus);
        writer.set_metadata("title", "Sample Clip");
        writer.set_metadata("author", "mpgif");

        let path = temp.path().join(format!("clip_{count}.mpgif"));
        writer.write(&path).expect("write container");
        let container = ContainerReader::new(&path).read().expect("read container");

        let header = container.header();
        assert_eq!(header.version, 2);
        assert_eq!((header.width, header.height, header.fps), (320, 180, 12));
        assert_eq!(header.frame_count as usize, count);
        assert_eq!(container.frames(), frames.as_slice());
        let (codec, audio) = container.audio().expect("audio present");
        assert_eq!(codec, AudioCodec::Opus);
        assert_eq!(audio, pseudo_random_bytes(99, 1024).as_slice());
        let keys: Vec<_> = container.metadata().iter().map(|(k, _)| k).collect();
        assert_eq!(keys, ["title", "author"]);
        assert_eq!(container.loop_mode(), LoopMode::from_count(3));
    }
}

#[test]
fn version_one_file_reads_with_empty_metadata() {
    let mut data = Header {
        version: 1,
        width: 8,
        height: 8,
        fps: 10,
        frame_count: 1,
        loop_count: 0,
    }
    .to_bytes()
    .to_vec();
    data.extend_from_slice(&[0, 0, 0, 3, 1, 2, 3]);
    data.extend_from_slice(&[3, 0, 0, 0, 2, 0xAA, 0xBB]);
    // A v1 reader never looks past the audio section.
    data.extend_from_slice(&[0, 0, 0, 2, b'{', b'}']);

    let container = Container::from_bytes(&data).unwrap();
    assert_eq!(container.header().version, 1);
    assert_eq!(container.frames().len(), 1);
    assert_eq!(
        container.audio(),
        Some((AudioCodec::Mp3, &[0xAA, 0xBB][..]))
    );
    assert!(container.metadata().is_empty());
}

#[test]
fn foreign_magic_is_a_format_error() {
    let temp = tempdir().unwrap();
    let path = temp.path().join("not.mpgif");
    let foreign = b"GIF89a\x01\x00\x01\x00\x00\x00\x00\x00\x00\x00\x00\x00";
    fs::write(&path, foreign).unwrap();
    let err = ContainerReader::new(&path).read().unwrap_err();
    assert!(err.is_format_error(), "unexpected error: {err}");
    assert!(matches!(err, ContainerError::BadMagic { .. }));

    let err = Container::from_bytes(b"MPGIF\x02\x00").unwrap_err();
    assert!(matches!(err, ContainerError::HeaderTooShort { len: 7 }));
}

fn three_frame_header() -> Vec<u8> {
    Header {
        version: 2,
        width: 4,
        height: 4,
        fps: 10,
        frame_count: 3,
        loop_count: 0,
    }
    .to_bytes()
    .to_vec()
}

#[test]
fn oversized_frame_claim_is_corruption() {
    let mut data = three_frame_header();
    data.extend_from_slice(&[0, 0, 0, 1, 0x11]);
    data.extend_from_slice(&[0, 0, 0, 1, 0x22]);
    data.extend_from_slice(&[0, 0, 0x10, 0, 0x33, 0x33]);
    let err = Container::from_bytes(&data).unwrap_err();
    assert!(err.is_corruption());
    assert!(matches!(err, ContainerError::Corruption { index: 2, .. }));
}

#[test]
fn clean_end_after_two_frames_is_tolerated() {
    let mut data = three_frame_header();
    data.extend_from_slice(&[0, 0, 0, 1, 0x11]);
    data.extend_from_slice(&[0, 0, 0, 2, 0x22, 0x23]);
    let container = Container::from_bytes(&data).unwrap();
    assert_eq!(container.frames().len(), 2);
    assert_eq!(container.frame(1), Some(&[0x22, 0x23][..]));
    assert!(container.audio().is_none());
    let info = container.info();
    assert_eq!((info.declared_frames, info.frames), (3, 2));
}

#[test]
fn loop_counts_describe_total_plays() {
    let temp = tempdir().unwrap();
    for (loop_count, description) in [(0, "infinite"), (1, "play once"), (5, "play 5 times")] {
        let path = temp.path().join(format!("loop_{loop_count}.mpgif"));
        let mut writer = ContainerWriter::new(2, 2, 5, loop_count);
        writer.add_frame(vec![0]);
        writer.write(&path).unwrap();
        let info = ContainerReader::new(&path).read().unwrap().info();
        assert_eq!(info.loop_description, description);
    }
}

#[test]
fn unreadable_metadata_is_dropped() {
    let mut writer = ContainerWriter::new(2, 2, 5, 0);
    writer.add_frame(vec![1, 2, 3]);
    writer.set_audio(vec![7; 4], AudioCodec::Aac);
    let mut data = writer.to_bytes().unwrap();
    let garbage = b"{not json";
    let metadata_prefix = data.len() - 4;
    data.truncate(metadata_prefix);
    data.extend_from_slice(&(garbage.len() as u32).to_be_bytes());
    data.extend_from_slice(garbage);

    let container = Container::from_bytes(&data).unwrap();
    assert!(container.metadata().is_empty());
    assert_eq!(container.frames().len(), 1);
    assert_eq!(
        container.audio().map(|(codec, _)| codec),
        Some(AudioCodec::Aac)
    );
}

#[test]
fn writer_overwrites_and_emits_absent_audio() {
    let temp = tempdir().unwrap();
    let path = temp.path().join("silent.mpgif");
    fs::write(&path, vec![0xFF; 4096]).unwrap();

    let mut writer = ContainerWriter::new(16, 9, 24, 0);
    writer.add_frame(vec![9; 10]);
    writer.write(&path).unwrap();

    let bytes = fs::read(&path).unwrap();
    assert_eq!(bytes.len(), HEADER_LEN + 4 + 10 + 5 + 4);
    let container = Container::from_bytes(&bytes).unwrap();
    assert!(container.audio().is_none());
    assert_eq!(container.info().audio_codec, AudioCodec::None);
}
