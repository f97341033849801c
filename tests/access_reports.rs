use std::fs;

use autobuild::access::{AccessKind, AccessRecord, append_report, read_report};
use autobuild::error::EngineError;

#[test]
fn records_come_back_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let report = dir.path().join("report");
    let records = vec![
        AccessRecord::new(AccessKind::Read, "/repo/a.c", true),
        AccessRecord::new(AccessKind::Link, "/repo/lnk", true),
        AccessRecord::new(AccessKind::Write, "/repo/a.o", true).no_follow(),
        AccessRecord::new(AccessKind::Stat, "/repo/missing.h", false),
    ];
    append_report(&report, &records[..2]).unwrap();
    append_report(&report, &records[2..]).unwrap();
    assert_eq!(read_report(&report).unwrap(), records);
    assert_eq!(fs::read_to_string(&report).unwrap().lines().nth(2), Some("w+\t/repo/a.o"));
}

#[test]
fn missing_report_means_no_accesses() {
    let dir = tempfile::tempdir().unwrap();
    assert!(read_report(&dir.path().join("never-written")).unwrap().is_empty());
}

#[test]
fn torn_last_line_is_skipped() {
    let dir = tempfile::tempdir().unwrap();
    let report = dir.path().join("report");
    fs::write(&report, "R+\t/repo/a.c\nR+\t/repo/b").unwrap();
    let records = read_report(&report).unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].path, "/repo/a.c");
}

#[test]
fn paths_that_are_not_utf8_do_not_spoil_the_report() {
    let dir = tempfile::tempdir().unwrap();
    let report = dir.path().join("report");
    let mut bytes = b"R+\t/repo/before.txt\n".to_vec();
    bytes.extend_from_slice(b"R+\t/repo/caf\xe9.txt\n");
    bytes.extend_from_slice(b"W+\t/repo/after.txt\n");
    fs::write(&report, bytes).unwrap();
    let records = read_report(&report).unwrap();
    let paths: Vec<&str> = records.iter().map(|r| r.path.as_str()).collect();
    assert_eq!(paths, vec!["/repo/before.txt", "/repo/after.txt"]);
    assert_eq!(records[1].kind, AccessKind::Write);
}

#[test]
fn garbage_lines_are_protocol_errors() {
    let dir = tempfile::tempdir().unwrap();
    let report = dir.path().join("report");
    fs::write(&report, "X?\t/repo/a.c\n").unwrap();
    assert!(matches!(read_report(&report), Err(EngineError::Protocol(_))));
}

#[test]
fn lines_without_path_separator_are_rejected() {
    assert!(AccessRecord::parse_line("R+/repo/a.c").is_err());
    let record = AccessRecord::parse_line("e-\t/usr/bin/cc").unwrap();
    assert_eq!(record.kind, AccessKind::Explicit);
    assert!(!record.ok);
    assert!(!record.follow);
}
