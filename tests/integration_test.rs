use proptest::prelude::*;
use rand::Rng;
use sngpkg::archive::{self, decode_file, decode_reader, encode_dir, encode_dir_to, DecodeOptions, EncodeOptions};
use sngpkg::header::HEADER_SIZE;
use sngpkg::sidecar;
use sngpkg::transcode::{CancelToken, TranscodeFailure, TranscodeOptions, Transcoder};
use sngpkg::{MaskKey, Metadata, SngError, SngReader};
use std::fs;
use std::io::{Cursor, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;

/// Prefixes the source bytes, reversed, with `OPUS` after a random delay so
/// tasks finish in a different order on every run.
struct FakeOpus;

impl Transcoder for FakeOpus {
    fn extension(&self) -> &str {
        "opus"
    }

    fn transcode(&self, source: &Path, sink: &mut dyn Write) -> Result<(), TranscodeFailure> {
        let delay = rand::thread_rng().gen_range(0..25);
        std::thread::sleep(Duration::from_millis(delay));
        let mut data = fs::read(source)?;
        data.reverse();
        sink.write_all(b"OPUS")?;
        sink.write_all(&data)?;
        Ok(())
    }
}

struct Broken;

impl Transcoder for Broken {
    fn extension(&self) -> &str {
        "opus"
    }

    fn transcode(&self, source: &Path, _: &mut dyn Write) -> Result<(), TranscodeFailure> {
        if source.file_name().is_some_and(|n| n == "bass.wav") {
            return Err(TranscodeFailure::Codec("unsupported sample format".into()));
        }
        Ok(())
    }
}

fn metadata(pairs: &[(&str, &str)]) -> Metadata {
    pairs.iter().copied().collect()
}

fn song_dir(root: &Path) -> PathBuf {
    let dir = root.join("song");
    fs::create_dir(&dir).unwrap();
    fs::write(dir.join("notes.chart"), b"[Song]\n{\n}\n").unwrap();
    fs::write(dir.join("guitar.wav"), (0..3000u32).map(|i| (i % 251) as u8).collect::<Vec<_>>()).unwrap();
    fs::write(dir.join("bass.wav"), vec![7u8; 1200]).unwrap();
    fs::write(dir.join("song.ogg"), b"already compressed").unwrap();
    fs::write(dir.join("album.png"), vec![0x89u8; 300]).unwrap();
    fs::write(dir.join("song.ini"), "[Song]\nname = Test Song\nartist = Band\ncharter = Someone\n").unwrap();
    dir
}

fn transcoding(transcoder: Arc<dyn Transcoder>) -> Option<TranscodeOptions> {
    Some(TranscodeOptions {
        transcoder,
        threads:      Some(4),
        task_timeout: Some(Duration::from_secs(30)),
    })
}

#[test]
fn test_single_text_file_scenario() {
    let root = tempdir().unwrap();
    let dir = root.path().join("in");
    fs::create_dir(&dir).unwrap();
    fs::write(dir.join("notes.txt"), b"abc").unwrap();

    let dest = root.path().join("out.sng");
    let opts = EncodeOptions {
        version: 1,
        mask_key: Some(MaskKey([0; 16])),
        metadata: Some(metadata(&[("name", "Test")])),
        allow_nonconforming: true,
        ..Default::default()
    };
    encode_dir(&dir, &dest, &opts).unwrap();

    let bytes = fs::read(&dest).unwrap();
    assert_eq!(&bytes[..6], b"SNGPKG");
    assert_eq!(&bytes[6..10], &1u32.to_le_bytes());
    assert_eq!(&bytes[10..26], &[0u8; 16]);
    // "abc" masked with a zero key at positions 0, 1, 2.
    assert_eq!(&bytes[bytes.len() - 3..], &[b'a', b'b' ^ 1, b'c' ^ 2]);

    let decode_opts = DecodeOptions {
        out_dir: root.path().to_owned(),
        sng_dir: Some("decoded".into()),
        ..Default::default()
    };
    let out = decode_file(&dest, &decode_opts).unwrap();
    assert_eq!(fs::read(out.join("notes.txt")).unwrap(), b"abc");
    assert_eq!(
        sidecar::read_sidecar(&out.join("song.ini")).unwrap(),
        metadata(&[("name", "Test")])
    );
}

#[test]
fn test_wrong_identifier_is_rejected() {
    let mut bytes = b"SNGPKX".to_vec();
    bytes.extend_from_slice(&[0u8; 64]);
    let err = decode_reader(Cursor::new(bytes), &DecodeOptions::default()).unwrap_err();
    assert!(matches!(err, SngError::Format(_)), "{err:?}");
}

#[test]
fn test_roundtrip_and_offsets() {
    let root = tempdir().unwrap();
    let dir = song_dir(root.path());
    let dest = root.path().join("song.sng");
    let summary = encode_dir(&dir, &dest, &EncodeOptions::default()).unwrap();
    assert_eq!(summary.metadata.get("artist"), Some("Band"));
    assert_eq!(fs::metadata(&dest).unwrap().len(), summary.archive_size);

    let mut reader = archive::open(&dest).unwrap();
    let names: Vec<_> = reader.entries().iter().map(|e| e.name.clone()).collect();
    assert_eq!(names, ["album.png", "bass.wav", "guitar.wav", "notes.chart", "song.ogg"]);

    let expected_start = HEADER_SIZE + summary.metadata.encoded_len() + summary.table.encoded_len() + 8;
    assert_eq!(reader.content_start(), expected_start);
    let entries = reader.entries().to_vec();
    assert_eq!(entries[0].content_offset, expected_start);
    for pair in entries.windows(2) {
        assert_eq!(pair[0].content_offset + pair[0].content_length, pair[1].content_offset);
    }

    for entry in &entries {
        assert_eq!(reader.read_file(&entry.name).unwrap(), fs::read(dir.join(&entry.name)).unwrap());
    }
    assert!(matches!(reader.read_file("drums.wav"), Err(SngError::NotFound(_))));
}

#[test]
fn test_decode_into_named_song_dir() {
    let root = tempdir().unwrap();
    let dir = song_dir(root.path());
    fs::write(dir.join("readme.txt"), b"not an asset").unwrap();
    let dest = root.path().join("song.sng");
    let opts = EncodeOptions { allow_nonconforming: true, ..Default::default() };
    encode_dir(&dir, &dest, &opts).unwrap();

    let out_dir = root.path().join("library");
    let decode_opts = DecodeOptions {
        out_dir: out_dir.clone(),
        allow_nonconforming: false,
        ..Default::default()
    };
    let out = decode_file(&dest, &decode_opts).unwrap();
    assert_eq!(out, out_dir.join("Band - Test Song (Someone)"));
    assert!(!out.join("readme.txt").exists());
    assert_eq!(fs::read(out.join("bass.wav")).unwrap(), vec![7u8; 1200]);
    let ini = sidecar::read_sidecar(&out.join("song.ini")).unwrap();
    assert_eq!(ini.get("name"), Some("Test Song"));

    // No staging leftovers next to the song directory.
    assert_eq!(fs::read_dir(&out_dir).unwrap().count(), 1);

    assert!(matches!(decode_file(&dest, &decode_opts), Err(SngError::AlreadyExists(_))));
    let force = DecodeOptions { overwrite: true, ..decode_opts };
    decode_file(&dest, &force).unwrap();
}

#[test]
fn test_transcoded_output_is_deterministic() {
    let root = tempdir().unwrap();
    let dir = song_dir(root.path());
    let opts = EncodeOptions {
        mask_key: Some(MaskKey(*b"0123456789abcdef")),
        transcode: transcoding(Arc::new(FakeOpus)),
        ..Default::default()
    };

    let mut archives = Vec::new();
    for _ in 0..6 {
        let (cursor, _) = encode_dir_to(&dir, Cursor::new(Vec::new()), &opts).unwrap();
        archives.push(cursor.into_inner());
    }
    assert!(archives.windows(2).all(|w| w[0] == w[1]));

    let mut reader = SngReader::new(Cursor::new(archives.pop().unwrap())).unwrap();
    let names: Vec<_> = reader.entries().iter().map(|e| e.name.clone()).collect();
    assert_eq!(names, ["album.png", "bass.opus", "guitar.opus", "notes.chart", "song.opus"]);

    let mut pcm = fs::read(dir.join("guitar.wav")).unwrap();
    pcm.reverse();
    let mut expected = b"OPUS".to_vec();
    expected.extend(pcm);
    assert_eq!(reader.read_file("guitar.opus").unwrap(), expected);
    assert_eq!(reader.read_file("notes.chart").unwrap(), fs::read(dir.join("notes.chart")).unwrap());

    let entries = reader.entries();
    assert_eq!(entries[0].content_offset, reader.content_start());
    for pair in entries.windows(2) {
        assert_eq!(pair[0].content_offset + pair[0].content_length, pair[1].content_offset);
    }
}

#[test]
fn test_failed_transcode_leaves_no_archive() {
    let root = tempdir().unwrap();
    let dir = song_dir(root.path());
    let dest = root.path().join("song.sng");
    let opts = EncodeOptions { transcode: transcoding(Arc::new(Broken)), ..Default::default() };

    let err = encode_dir(&dir, &dest, &opts).unwrap_err();
    match err {
        SngError::Transcode { path, source: TranscodeFailure::Codec(_) } => {
            assert_eq!(path, dir.join("bass.wav"));
        }
        other => panic!("unexpected error {other:?}"),
    }
    assert!(!dest.exists());
    let leftovers: Vec<_> = fs::read_dir(root.path()).unwrap().map(|e| e.unwrap().file_name()).collect();
    assert_eq!(leftovers, ["song"]);
}

#[test]
fn test_cancellation_mid_transcode() {
    struct CancelOnFirstCall(CancelToken);
    impl Transcoder for CancelOnFirstCall {
        fn extension(&self) -> &str {
            "opus"
        }
        fn transcode(&self, _: &Path, sink: &mut dyn Write) -> Result<(), TranscodeFailure> {
            self.0.cancel();
            std::thread::sleep(Duration::from_millis(30));
            sink.write_all(b"x")?;
            Ok(())
        }
    }

    let root = tempdir().unwrap();
    let dir = song_dir(root.path());
    let dest = root.path().join("song.sng");
    let cancel = CancelToken::new();
    let opts = EncodeOptions {
        transcode: transcoding(Arc::new(CancelOnFirstCall(cancel.clone()))),
        cancel,
        ..Default::default()
    };
    assert!(matches!(encode_dir(&dir, &dest, &opts), Err(SngError::Cancelled)));
    assert!(!dest.exists());
}

#[test]
fn test_existing_destination_needs_overwrite() {
    let root = tempdir().unwrap();
    let dir = song_dir(root.path());
    let dest = root.path().join("song.sng");
    fs::write(&dest, b"old").unwrap();

    let err = encode_dir(&dir, &dest, &EncodeOptions::default()).unwrap_err();
    assert!(matches!(err, SngError::AlreadyExists(_)));
    assert_eq!(fs::read(&dest).unwrap(), b"old");

    let opts = EncodeOptions { overwrite: true, ..Default::default() };
    encode_dir(&dir, &dest, &opts).unwrap();
    assert_eq!(&fs::read(&dest).unwrap()[..6], b"SNGPKG");
}

#[test]
fn test_missing_inputs_are_not_found() {
    let root = tempdir().unwrap();
    let missing = root.path().join("nope");
    let out = root.path().join("out.sng");
    assert!(matches!(encode_dir(&missing, &out, &EncodeOptions::default()), Err(SngError::NotFound(_))));

    let bare = root.path().join("bare");
    fs::create_dir(&bare).unwrap();
    fs::write(bare.join("notes.mid"), b"MThd").unwrap();
    assert!(matches!(encode_dir(&bare, &out, &EncodeOptions::default()), Err(SngError::NotFound(_))));

    let err = decode_file(&root.path().join("missing.sng"), &DecodeOptions::default()).unwrap_err();
    assert!(matches!(err, SngError::NotFound(_)));
}

#[test]
fn test_truncated_archive_is_rejected() {
    let root = tempdir().unwrap();
    let dir = song_dir(root.path());
    let (cursor, _) = encode_dir_to(&dir, Cursor::new(Vec::new()), &EncodeOptions::default()).unwrap();
    let mut bytes = cursor.into_inner();
    bytes.truncate(bytes.len() - 10);

    let opts = DecodeOptions { out_dir: root.path().join("out"), ..Default::default() };
    let err = decode_reader(Cursor::new(bytes), &opts).unwrap_err();
    assert!(matches!(err, SngError::SizeMismatch { section: "content", .. }), "{err:?}");
    assert!(!root.path().join("out").join("Band - Test Song (Someone)").exists());
}

const ASSET_NAMES: &[&str] = &[
    "notes.chart", "notes.mid", "song.ogg", "guitar.wav", "bass.opus", "drums_1.flac",
    "album.png", "background.jpg", "video.mp4", "preview.mp3",
];

/// Encode `files` from a fresh directory into memory and check everything
/// read back against the inputs.
fn assert_round_trip(files: &[(&str, Vec<u8>)], metadata: Metadata) {
    let root = tempdir().unwrap();
    let dir = root.path().join("song");
    fs::create_dir(&dir).unwrap();
    for (name, data) in files {
        fs::write(dir.join(name), data).unwrap();
    }

    let opts = EncodeOptions {
        metadata: Some(metadata.clone()),
        allow_nonconforming: true,
        ..Default::default()
    };
    let (cursor, summary) = encode_dir_to(&dir, Cursor::new(Vec::new()), &opts).unwrap();
    let len = cursor.get_ref().len() as u64;
    let mut reader = SngReader::new(Cursor::new(cursor.into_inner())).unwrap();

    assert_eq!(summary.archive_size, len);
    assert_eq!(reader.metadata(), &metadata);
    assert_eq!(reader.entries().len(), files.len());

    let mut next = reader.content_start();
    for entry in reader.entries() {
        assert_eq!(entry.content_offset, next, "{} is not contiguous", entry.name);
        next += entry.content_length;
    }
    assert_eq!(next, len);
    assert_eq!(reader.content_length(), len - reader.content_start());

    for (name, data) in files {
        assert_eq!(&reader.read_file(name).unwrap(), data, "{name}");
    }
}

#[test]
fn test_empty_directory_round_trip() {
    assert_round_trip(&[], Metadata::new());
    assert_round_trip(&[], metadata(&[("name", "Silence"), ("artist", "Nobody")]));
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn test_random_directories_round_trip(
        names in proptest::sample::subsequence(ASSET_NAMES, 0..=ASSET_NAMES.len()),
        contents in proptest::collection::vec(proptest::collection::vec(any::<u8>(), 0..512), ASSET_NAMES.len()),
        pairs in proptest::collection::btree_map("[a-z_]{1,8}", "\\PC{0,16}", 0..6),
    ) {
        let files: Vec<(&str, Vec<u8>)> = names.into_iter().zip(contents).collect();
        assert_round_trip(&files, pairs.into_iter().collect());
    }
}
