//! Artifact Extraction Integration Tests
//!
//! Crafted-archive tests for the path-validated extraction stage: normal
//! bundles extract completely, traversal entries are rejected outright.

use colab_exec_mcp::{extract_archive, BridgeError};
use std::io::{Cursor, Write};
use tempfile::TempDir;
use zip::write::SimpleFileOptions;

fn build_zip(entries: &[(&str, &[u8])]) -> Vec<u8> {
    let mut cursor = Cursor::new(Vec::new());
    {
        let mut writer = zip::ZipWriter::new(&mut cursor);
        for (name, data) in entries {
            writer
                .start_file(name.to_string(), SimpleFileOptions::default())
                .unwrap();
            writer.write_all(data).unwrap();
        }
        writer.finish().unwrap();
    }
    cursor.into_inner()
}

#[test]
fn test_training_run_bundle_extracts() {
    let temp = TempDir::new().unwrap();
    let output_dir = temp.path().join("artifacts");
    let bytes = build_zip(&[
        ("model.pt", b"serialized weights".as_slice()),
        ("plot.png", b"\x89PNG\r\n".as_slice()),
    ]);

    let mut files = extract_archive(&bytes, &output_dir).unwrap();
    files.sort();
    assert_eq!(files, vec!["model.pt", "plot.png"]);

    // The output directory holds exactly those two files
    let on_disk: Vec<String> = std::fs::read_dir(&output_dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    assert_eq!(on_disk.len(), 2);
    assert_eq!(
        std::fs::read(output_dir.join("model.pt")).unwrap(),
        b"serialized weights"
    );
}

#[test]
fn test_traversal_entries_never_escape() {
    let temp = TempDir::new().unwrap();
    let output_dir = temp.path().join("nested").join("out");

    for evil in [
        "../../etc/passwd",
        "../sibling.txt",
        "a/../../escape.txt",
        "/etc/colab-exec-evil",
    ] {
        let bytes = build_zip(&[(evil, b"owned".as_slice())]);
        let err = extract_archive(&bytes, &output_dir).unwrap_err();
        assert!(
            matches!(err, BridgeError::ArtifactRetrieval(_)),
            "entry {evil:?} should be rejected"
        );
    }

    // Nothing may have been written above the target directory
    assert!(!temp.path().join("etc").exists());
    assert!(!temp.path().join("sibling.txt").exists());
    assert!(!temp.path().join("escape.txt").exists());
    assert!(!temp.path().join("nested").join("sibling.txt").exists());
}

#[test]
fn test_mixed_archive_fails_before_any_escape() {
    let temp = TempDir::new().unwrap();
    let output_dir = temp.path().join("out");
    let bytes = build_zip(&[
        ("../../stolen.txt", b"x".as_slice()),
        ("legit.csv", b"a,b".as_slice()),
    ]);

    assert!(extract_archive(&bytes, &output_dir).is_err());
    assert!(!temp.path().join("stolen.txt").exists());
}

#[test]
fn test_degenerate_archives_fail_without_panicking() {
    let temp = TempDir::new().unwrap();

    for bytes in [&b""[..], &b"PK\x03\x04truncated"[..], &b"random bytes"[..]] {
        let err = extract_archive(bytes, temp.path()).unwrap_err();
        assert!(matches!(err, BridgeError::ArtifactRetrieval(_)));
    }
}

#[test]
fn test_empty_zip_extracts_nothing() {
    let temp = TempDir::new().unwrap();
    let bytes = build_zip(&[]);
    let files = extract_archive(&bytes, temp.path()).unwrap();
    assert!(files.is_empty());
}
