//! Offline decoder checks against hand-assembled log files. Files are
//! built with the same generated compressors the runtime uses, so these
//! cover the on-disk framing without involving the background thread.

use std::fs;
use std::io;
use std::path::PathBuf;

use rand::distributions::Alphanumeric;
use rand::{thread_rng, Rng};

use nanolog::config::FILE_ALIGNMENT_BYTES;
use nanolog::generated::demo;
use nanolog::Decoder;

fn scratch_path(tag: &str) -> PathBuf {
    let nonce: String = thread_rng()
        .sample_iter(&Alphanumeric)
        .take(8)
        .map(char::from)
        .collect();
    std::env::temp_dir().join(format!("nanolog_decoder_{}_{}", tag, nonce))
}

/// Appends one on-disk record: the id prefix, then the site's compressor
/// output for the staged argument bytes.
fn push_record(out: &mut Vec<u8>, id: u32, timestamp: u64, args: &[u8]) {
    out.extend_from_slice(&(id + 1).to_le_bytes());
    (demo::SITES[id as usize].compress)(timestamp, args, out);
}

/// Zero-pads to the next alignment boundary the way the writer does at a
/// submission boundary, bumping a sub-prefix-sized pad by one more block.
fn pad_submission(out: &mut Vec<u8>) {
    let len = out.len();
    let mut padded = (len + FILE_ALIGNMENT_BYTES - 1) / FILE_ALIGNMENT_BYTES
        * FILE_ALIGNMENT_BYTES;
    if padded - len > 0 && padded - len < 4 {
        padded += FILE_ALIGNMENT_BYTES;
    }
    out.resize(padded, 0);
}

fn decode(path: &PathBuf, max: Option<u64>) -> io::Result<(Vec<String>, u64)> {
    let mut decoder = Decoder::open(path, demo::SITES)?;
    let mut rendered = vec![];
    let consumed = decoder.decompress_unordered(&mut rendered, max)?;
    let lines = String::from_utf8(rendered)
        .unwrap()
        .lines()
        .map(str::to_owned)
        .collect();
    Ok((lines, consumed))
}

#[test]
fn roundtrip_across_submission_boundaries() {
    let mut file = vec![];

    // first submission: a mix of every site
    push_record(&mut file, 0, 1_000, &4096u64.to_le_bytes());
    push_record(&mut file, 2, 1_050, &[]);
    let mut two_args = [0; 16];
    two_args[..8].copy_from_slice(&17u64.to_le_bytes());
    two_args[8..].copy_from_slice(&250u64.to_le_bytes());
    push_record(&mut file, 1, 1_100, &two_args);
    pad_submission(&mut file);

    // second submission: a record with a string argument
    let path_arg = "/var/data/segment.0007";
    let mut args = vec![];
    args.extend_from_slice(&(path_arg.len() as u32).to_le_bytes());
    args.extend_from_slice(path_arg.as_bytes());
    args.extend_from_slice(&5u64.to_le_bytes());
    push_record(&mut file, 3, 2_000, &args);
    pad_submission(&mut file);

    let path = scratch_path("roundtrip");
    fs::write(&path, &file).unwrap();

    let (lines, consumed) = decode(&path, None).unwrap();
    assert_eq!(lines.len(), 4);
    assert_eq!(
        lines[0],
        "1000 | backup.rs:37 | NOTICE: Starting backup of 4096 bytes"
    );
    assert_eq!(lines[1], "1050 | supervisor.rs:112 | DEBUG: Heartbeat");
    assert_eq!(
        lines[2],
        "1100 | backup.rs:81 | NOTICE: Backup complete, wrote 17 objects in 250 ms"
    );
    assert_eq!(
        lines[3],
        "2000 | backup.rs:95 | ERROR: Write failed on /var/data/segment.0007: error 5"
    );
    assert_eq!(consumed, file.len() as u64);

    let _ = fs::remove_file(&path);
}

#[test]
fn message_count_limit_is_exact() {
    let mut file = vec![];
    for i in 0..100u64 {
        push_record(&mut file, 0, i, &i.to_le_bytes());
    }
    pad_submission(&mut file);

    let path = scratch_path("limit");
    fs::write(&path, &file).unwrap();

    let (lines, consumed) = decode(&path, Some(25)).unwrap();
    assert_eq!(lines.len(), 25);
    for (i, line) in lines.iter().enumerate() {
        assert!(
            line.ends_with(&format!("Starting backup of {} bytes", i)),
            "unexpected line {:?}",
            line
        );
    }
    assert!(consumed < file.len() as u64);

    // unlimited run sees everything
    let (lines, consumed) = decode(&path, None).unwrap();
    assert_eq!(lines.len(), 100);
    assert_eq!(consumed, file.len() as u64);

    let _ = fs::remove_file(&path);
}

#[test]
fn short_pad_gets_a_whole_extra_block() {
    // a heartbeat record is 4 + ~2 bytes; force a length whose distance to
    // the boundary is under the prefix size
    let mut file = vec![];
    while FILE_ALIGNMENT_BYTES - (file.len() % FILE_ALIGNMENT_BYTES) >= 4
        || file.len() % FILE_ALIGNMENT_BYTES == 0
    {
        push_record(&mut file, 2, 7, &[]);
    }
    let unpadded = file.len();
    pad_submission(&mut file);
    assert!(file.len() - unpadded >= 4, "pad rule regressed");
    assert_eq!(file.len() % FILE_ALIGNMENT_BYTES, 0);

    push_record(&mut file, 0, 9, &1u64.to_le_bytes());
    pad_submission(&mut file);

    let path = scratch_path("shortpad");
    fs::write(&path, &file).unwrap();

    let (lines, _) = decode(&path, None).unwrap();
    assert_eq!(*lines.last().unwrap(), "9 | backup.rs:37 | NOTICE: Starting backup of 1 bytes");

    let _ = fs::remove_file(&path);
}

#[test]
fn empty_file_decodes_to_nothing() {
    let path = scratch_path("empty");
    fs::write(&path, b"").unwrap();

    let (lines, consumed) = decode(&path, None).unwrap();
    assert!(lines.is_empty());
    assert_eq!(consumed, 0);

    let _ = fs::remove_file(&path);
}

#[test]
fn unknown_log_id_is_rejected() {
    let mut file = vec![];
    file.extend_from_slice(&(demo::SITES.len() as u32 + 1).to_le_bytes());
    file.extend_from_slice(&[0; 12]);

    let path = scratch_path("unknown");
    fs::write(&path, &file).unwrap();

    let err = decode(&path, None).unwrap_err();
    assert_eq!(err.kind(), io::ErrorKind::InvalidData);

    let _ = fs::remove_file(&path);
}

#[test]
fn truncated_record_is_reported() {
    let mut file = vec![];
    push_record(&mut file, 1, 123_456_789, &[7; 16]);
    file.truncate(file.len() - 1);

    let path = scratch_path("truncated");
    fs::write(&path, &file).unwrap();

    let err = decode(&path, None).unwrap_err();
    assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);

    let _ = fs::remove_file(&path);
}

#[test]
fn unopenable_file_is_an_error() {
    let path = scratch_path("missing");
    assert!(Decoder::open(&path, demo::SITES).is_err());
}

#[test]
fn metadata_search_runs() {
    // smoke only; the table goes to stdout
    nanolog::decoder::print_metadata_containing(demo::SITES, "backup");
    nanolog::decoder::print_metadata_containing(demo::SITES, "no such format string");
}
