use std::io::{Cursor, Write};
use std::path::PathBuf;

use zip::write::SimpleFileOptions;
use zip::ZipWriter;

use super::*;

const SAMPLE_SETUP: &str = r#"
[metadata]
name = "Distutils"
version = "0.9pre"
author = "Greg Ward"
license = "Python"

[setup]
title = "Distutils-0.9pre"
info = "Python Distribution Utilities"

[runtime]
name = "Python"
key = 'Software\Python\PythonCore'
version = "2.7"
"#;

fn sample_zip(members: &[(&str, &[u8])]) -> Vec<u8> {
    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
    for (name, contents) in members {
        if name.ends_with('/') {
            writer
                .add_directory(*name, SimpleFileOptions::default())
                .expect("must add directory");
            continue;
        }
        writer
            .start_file(*name, SimpleFileOptions::default())
            .expect("must start file");
        writer.write_all(contents).expect("must write member");
    }
    writer.finish().expect("must finish zip").into_inner()
}

#[test]
fn parse_setup_data() {
    let setup = SetupData::from_toml_str(SAMPLE_SETUP).expect("setup should parse");
    assert_eq!(setup.metadata.name, "Distutils");
    assert_eq!(setup.metadata.version, "0.9pre");
    assert_eq!(setup.metadata.author.as_deref(), Some("Greg Ward"));
    assert_eq!(setup.title(), "Distutils-0.9pre");
    assert_eq!(setup.display_name(), "Python 2.7 Distutils-0.9pre");
    assert_eq!(setup.uninstall_subkey_name(), "Distutils-0.9pre");
    let runtime = setup.runtime.expect("runtime section should parse");
    assert_eq!(runtime.key, r"Software\Python\PythonCore");
}

#[test]
fn setup_without_optional_sections_defaults_title() {
    let setup = SetupData::from_toml_str("[metadata]\nname = \"tool\"\nversion = \"1.0\"\n")
        .expect("minimal setup should parse");
    assert!(setup.runtime.is_none());
    assert_eq!(setup.title(), "tool-1.0");
    assert_eq!(setup.display_name(), "tool-1.0");
}

#[test]
fn setup_rejects_package_name_with_separator() {
    let err = SetupData::from_toml_str("[metadata]\nname = \"../evil\"\nversion = \"1.0\"\n")
        .expect_err("separator in name must be rejected");
    assert!(
        err.to_string().contains("package name contains invalid character(s)"),
        "unexpected error: {err}"
    );
}

#[test]
fn setup_rejects_empty_runtime_key() {
    let raw = "[metadata]\nname = \"tool\"\nversion = \"1.0\"\n\n[runtime]\nname = \"Python\"\nkey = \" \"\nversion = \"3.12\"\n";
    let err = SetupData::from_toml_str(raw).expect_err("blank runtime key must be rejected");
    assert!(err.to_string().contains("runtime registry key must not be empty"));
}

#[test]
fn setup_survives_toml_round_trip() {
    let setup = SetupData::from_toml_str(SAMPLE_SETUP).expect("setup should parse");
    let rendered = setup.to_toml_string().expect("must serialize");
    let reparsed = SetupData::from_toml_str(&rendered).expect("rendered setup must parse");
    assert_eq!(reparsed, setup);
}

#[test]
fn bundle_splits_stub_setup_and_archive() {
    let archive = sample_zip(&[("lib/mod.txt", b"hello")]);
    let bytes = build_bundle(b"MZstub", SAMPLE_SETUP, &archive);

    let bundle = Bundle::from_bytes(bytes).expect("bundle must open");
    assert_eq!(bundle.stub_bytes(), b"MZstub");
    assert_eq!(bundle.setup_bytes(), SAMPLE_SETUP.as_bytes());
    assert_eq!(bundle.archive_bytes(), archive.as_slice());
    assert_eq!(bundle.payload_sha256().len(), 64);
    assert_eq!(bundle.setup().expect("setup").metadata.name, "Distutils");
}

#[test]
fn bundle_rejects_plain_executable() {
    let err = Bundle::from_bytes(vec![0_u8; TRAILER_LEN + 10])
        .expect_err("file without trailer must be rejected");
    assert!(err.to_string().contains("trailer magic missing"));
}

#[test]
fn bundle_rejects_short_file() {
    let err = Bundle::from_bytes(b"MZ".to_vec()).expect_err("short file must be rejected");
    assert!(err.to_string().contains("no appended payload found"));
}

#[test]
fn bundle_rejects_tampered_archive() {
    let archive = sample_zip(&[("a.txt", b"payload")]);
    let mut bytes = build_bundle(b"stub", SAMPLE_SETUP, &archive);
    let tamper_at = 4 + SAMPLE_SETUP.len() + 2;
    bytes[tamper_at] ^= 0xff;

    let err = Bundle::from_bytes(bytes).expect_err("tampered payload must be rejected");
    assert!(
        err.to_string().contains("payload digest mismatch"),
        "unexpected error: {err}"
    );
}

#[test]
fn bundle_rejects_lengths_larger_than_file() {
    let mut bytes = build_bundle(b"stub", "x", b"y");
    let setup_len_at = bytes.len() - TRAILER_LEN + 8;
    bytes[setup_len_at..setup_len_at + 8].copy_from_slice(&u64::MAX.to_le_bytes());

    let err = Bundle::from_bytes(bytes).expect_err("oversized length must be rejected");
    assert!(err.to_string().contains("exceed file size"));
}

#[test]
fn zip_payload_yields_files_and_skips_directories() {
    let archive = sample_zip(&[
        ("pkg/", b""),
        ("pkg/__init__.py", b"# init"),
        ("pkg/data/table.csv", b"a,b\n1,2\n"),
    ]);
    let payload = ZipPayload::new(&archive).expect("zip must open");
    assert_eq!(payload.len(), 3);

    let entries = payload
        .collect::<anyhow::Result<Vec<_>>>()
        .expect("entries must decode");
    assert_eq!(
        entries,
        vec![
            PayloadEntry {
                rel_path: PathBuf::from("pkg/__init__.py"),
                contents: b"# init".to_vec(),
            },
            PayloadEntry {
                rel_path: PathBuf::from("pkg/data/table.csv"),
                contents: b"a,b\n1,2\n".to_vec(),
            },
        ]
    );
}

#[test]
fn zip_payload_reports_escaping_member_and_continues() {
    let archive = sample_zip(&[("../outside.txt", b"nope"), ("inside.txt", b"ok")]);
    let mut payload = ZipPayload::new(&archive).expect("zip must open");

    let first = payload.next().expect("first item");
    let err = first.expect_err("escaping member must be an error");
    assert!(err.to_string().contains("must not escape the target"));

    let second = payload.next().expect("second item").expect("second decodes");
    assert_eq!(second.rel_path, PathBuf::from("inside.txt"));
    assert!(payload.next().is_none());
}

#[test]
fn zip_payload_rejects_garbage() {
    let err = ZipPayload::new(b"definitely not a zip").err().expect("garbage must fail");
    assert!(err.to_string().contains("failed to open appended zip archive"));
}

#[test]
fn relative_payload_path_validation() {
    assert!(validated_relative_payload_path("a/b.txt").is_ok());
    assert!(validated_relative_payload_path("").is_err());
    assert!(validated_relative_payload_path("/etc/passwd").is_err());
    assert!(validated_relative_payload_path("\\windows\\system32").is_err());
    assert!(validated_relative_payload_path("a\\..\\..\\b").is_err());
    assert!(validated_relative_payload_path("a/line\nbreak.txt").is_err());
    assert!(validated_relative_payload_path("tab\there.txt").is_err());
}
