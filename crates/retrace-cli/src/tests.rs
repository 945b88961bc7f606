use std::io::{Cursor, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::atomic::{AtomicU64, Ordering};

use clap::error::ErrorKind;
use clap::Parser;
use retrace_core::SetupData;
use retrace_installer::{
    join_key, FileRegistry, InstallResult, InstallScope, MutationFailure, RegistryStore,
    SelfRemoval, UndoCounts, UninstallError, UninstallReport, UninstallState, UNINSTALL_KEY,
};
use zip::write::SimpleFileOptions;
use zip::ZipWriter;

use super::*;
use crate::flows::{
    format_inspect_lines, format_install_result_lines, format_uninstall_report_lines,
    inspect_bundle, registry_root_override, uninstall_error_message, uninstall_exit_code,
};
use crate::render::{
    render_error_line, render_extraction_summary, render_status_line, render_warning_line,
    resolve_output_style, Status,
};

static TEST_ROOT_COUNTER: AtomicU64 = AtomicU64::new(0);

const DEMO_SETUP: &str = r#"
[metadata]
name = "demo"
version = "1.0"
author = "Demo Authors"
"#;

fn test_root() -> PathBuf {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("system time")
        .as_nanos();
    let sequence = TEST_ROOT_COUNTER.fetch_add(1, Ordering::Relaxed);
    let path = std::env::temp_dir().join(format!(
        "retrace-cli-tests-{}-{}-{}",
        std::process::id(),
        nanos,
        sequence
    ));
    std::fs::create_dir_all(&path).expect("must create test root");
    if cfg!(windows) {
        path
    } else {
        std::fs::canonicalize(&path).expect("must resolve test root")
    }
}

fn demo_zip() -> Vec<u8> {
    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
    writer
        .add_directory("a/", SimpleFileOptions::default())
        .expect("must add directory");
    writer
        .start_file("a/b.txt", SimpleFileOptions::default())
        .expect("must start file");
    writer.write_all(b"bee").expect("must write member");
    writer
        .start_file("c.txt", SimpleFileOptions::default())
        .expect("must start file");
    writer.write_all(b"sea").expect("must write member");
    writer.finish().expect("must finish zip").into_inner()
}

fn write_pack_inputs(root: &Path) -> (PathBuf, PathBuf, PathBuf) {
    let stub = root.join("stub.bin");
    let setup = root.join("setup.toml");
    let archive = root.join("payload.zip");
    std::fs::write(&stub, b"#!/bin/sh\n").expect("must write stub");
    std::fs::write(&setup, DEMO_SETUP).expect("must write setup");
    std::fs::write(&archive, demo_zip()).expect("must write archive");
    (stub, setup, archive)
}

fn sample_install_result() -> InstallResult {
    InstallResult {
        package: "demo".to_string(),
        scope: InstallScope::PerUser,
        target_dir: PathBuf::from("/opt/demo"),
        journal_path: PathBuf::from("/opt/demo/demo-retrace.log"),
        uninstaller_path: Some(PathBuf::from("/opt/demo/Removedemo")),
        uninstall_command: "\"/opt/demo/Removedemo\" -u \"/opt/demo/demo-retrace.log\"".to_string(),
        created_files: vec![PathBuf::from("/opt/demo/a/b.txt")],
        overwritten_files: vec![PathBuf::from("/opt/demo/c.txt")],
        created_dirs: vec![PathBuf::from("/opt/demo/a")],
        registry_entries: 6,
        failures: Vec::new(),
        warnings: vec!["runtime registration unknown".to_string()],
    }
}

fn sample_report(failures: Vec<MutationFailure>) -> UninstallReport {
    UninstallReport {
        journal_path: PathBuf::from("/opt/demo/demo-retrace.log"),
        scope: InstallScope::MachineWide,
        undone: UndoCounts {
            registry_values: 5,
            registry_keys: 1,
            files: 2,
            directories: 1,
            already_missing: 0,
        },
        failures,
        journal_removed: true,
        self_removal: None,
    }
}

fn exit_code_debug(code: ExitCode) -> String {
    format!("{code:?}")
}

#[test]
fn cli_parses_uninstall_with_flags() {
    let cli = Cli::try_parse_from(["retrace", "-u", "demo-retrace.log", "--strict", "--keep-self"])
        .expect("uninstall flags should parse");
    assert_eq!(cli.uninstall.as_deref(), Some(Path::new("demo-retrace.log")));
    assert!(cli.strict);
    assert!(cli.keep_self);
    assert!(cli.command.is_none());
}

#[test]
fn cli_parses_install_without_arguments() {
    let cli = Cli::try_parse_from(["retrace"]).expect("bare invocation should parse");
    assert!(cli.uninstall.is_none());
    assert!(cli.bundle.is_none());
    assert!(!cli.json);
}

#[test]
fn cli_rejects_strict_without_uninstall() {
    let err = Cli::try_parse_from(["retrace", "--strict"])
        .expect_err("strict should require uninstall");
    assert_eq!(err.kind(), ErrorKind::MissingRequiredArgument);
}

#[test]
fn cli_rejects_bundle_together_with_uninstall() {
    let err = Cli::try_parse_from(["retrace", "-u", "x.log", "--bundle", "setup.exe"])
        .expect_err("bundle and uninstall should conflict");
    assert_eq!(err.kind(), ErrorKind::ArgumentConflict);
}

#[test]
fn cli_parses_pack_subcommand() {
    let cli = Cli::try_parse_from([
        "retrace", "pack", "--stub", "stub", "--setup", "setup.toml", "--archive", "p.zip",
        "--output", "out",
    ])
    .expect("pack should parse");
    match cli.command {
        Some(Commands::Pack { output, .. }) => assert_eq!(output, PathBuf::from("out")),
        other => panic!("unexpected command: {other:?}"),
    }
}

#[test]
fn cli_rejects_pack_without_output() {
    let err = Cli::try_parse_from(["retrace", "pack", "--stub", "s", "--setup", "t", "--archive", "a"])
        .expect_err("pack without output should fail");
    assert_eq!(err.kind(), ErrorKind::MissingRequiredArgument);
}

#[test]
fn output_style_is_rich_only_on_color_terminals() {
    assert_eq!(resolve_output_style(true, false), OutputStyle::Rich);
    assert_eq!(resolve_output_style(true, true), OutputStyle::Plain);
    assert_eq!(resolve_output_style(false, false), OutputStyle::Plain);
}

#[test]
fn status_lines_use_badges_only_in_rich_mode() {
    assert_eq!(render_status_line(OutputStyle::Plain, Status::Ok, "done"), "done");
    assert_eq!(render_status_line(OutputStyle::Rich, Status::Ok, "done"), "[OK] done");
    assert_eq!(render_status_line(OutputStyle::Rich, Status::Step, "files"), "[..] files");
    assert_eq!(render_warning_line(OutputStyle::Plain, "kept"), "warning: kept");
    assert_eq!(render_warning_line(OutputStyle::Rich, "kept"), "[WARN] kept");
    assert_eq!(render_error_line(OutputStyle::Plain, "locked"), "error: locked");
    assert_eq!(render_error_line(OutputStyle::Rich, "locked"), "[ERR] locked");
}

#[test]
fn extraction_summary_is_suppressed_in_plain_mode() {
    let elapsed = std::time::Duration::from_millis(1_250);
    assert!(render_extraction_summary(OutputStyle::Plain, 1, 2, elapsed).is_none());
    let line = render_extraction_summary(OutputStyle::Rich, 2, 4, elapsed)
        .expect("rich mode should render a summary");
    assert!(line.ends_with(" 2/4 files in 1.250s"), "unexpected line: {line}");
}

#[test]
fn registry_root_flag_is_made_absolute() {
    let root = registry_root_override(Some(Path::new("registry")))
        .expect("relative root should resolve")
        .expect("flag should win");
    assert!(root.is_absolute());
    assert!(root.ends_with("registry"));
}

#[test]
fn install_result_lines_report_counts_and_warnings() {
    let lines = format_install_result_lines(&sample_install_result(), OutputStyle::Plain);
    assert_eq!(lines[0], "installed demo into /opt/demo (HKEY_CURRENT_USER)");
    assert_eq!(lines[1], "files: 1 created, 1 overwritten");
    assert_eq!(lines[2], "directories: 1 created");
    assert_eq!(lines[3], "registry: 6 entries under HKEY_CURRENT_USER");
    assert!(lines
        .iter()
        .any(|line| line == "warning: runtime registration unknown"));
}

#[test]
fn uninstall_report_lines_include_failures_and_self_removal() {
    let mut report = sample_report(vec![MutationFailure {
        action: "delete file".to_string(),
        target: "/opt/demo/c.txt".to_string(),
        message: "permission denied".to_string(),
    }]);
    report.self_removal = Some(SelfRemoval::Scheduled {
        exe: PathBuf::from("/opt/demo/Removedemo.exe"),
        script: PathBuf::from("/opt/demo/Removedemo.exe.bat"),
    });
    let lines = format_uninstall_report_lines(&report, OutputStyle::Plain);

    assert_eq!(
        lines[1],
        "removed: 2 files, 1 directories, 5 registry values, 1 registry keys"
    );
    assert!(lines
        .iter()
        .any(|line| line == "uninstaller removal scheduled: /opt/demo/Removedemo.exe.bat"));
    assert!(lines
        .iter()
        .any(|line| line == "warning: delete file failed for /opt/demo/c.txt: permission denied"));
    assert!(!lines.iter().any(|line| line.contains("already gone")));
}

#[test]
fn strict_exit_code_reflects_warnings() {
    let clean = sample_report(Vec::new());
    let noisy = sample_report(vec![MutationFailure {
        action: "remove directory".to_string(),
        target: "/opt/demo/a".to_string(),
        message: "directory not empty".to_string(),
    }]);

    assert_eq!(
        exit_code_debug(uninstall_exit_code(&clean, true)),
        exit_code_debug(ExitCode::SUCCESS)
    );
    assert_eq!(
        exit_code_debug(uninstall_exit_code(&noisy, false)),
        exit_code_debug(ExitCode::SUCCESS)
    );
    assert_eq!(
        exit_code_debug(uninstall_exit_code(&noisy, true)),
        exit_code_debug(ExitCode::from(2))
    );
}

#[test]
fn uninstall_error_message_unwraps_generic_errors() {
    let err = UninstallError::Other(anyhow::anyhow!("registry unavailable"));
    assert_eq!(uninstall_error_message(&err), "registry unavailable");

    let err = UninstallError::InvalidTransition {
        from: UninstallState::Done,
        to: UninstallState::Loaded,
    };
    assert!(!uninstall_error_message(&err).is_empty());
}

#[test]
fn pack_then_inspect_reports_bundle_contents() {
    let root = test_root();
    let (stub, setup, archive) = write_pack_inputs(&root);
    let output = root.join("demo-setup");

    run_pack(
        PackArgs {
            stub: &stub,
            setup: &setup,
            archive: &archive,
            output: &output,
        },
        OutputStyle::Plain,
    )
    .expect("pack should succeed");

    let report = inspect_bundle(&output).expect("inspect should read the packed installer");
    assert_eq!(report.name, "demo");
    assert_eq!(report.version, "1.0");
    assert_eq!(report.stub_bytes, b"#!/bin/sh\n".len());
    assert_eq!(report.archive_members, 3);
    assert_eq!(report.payload_sha256.len(), 64);
    assert!(report.runtime.is_none());

    let lines = format_inspect_lines(&report);
    assert!(lines.iter().any(|line| line == "package: demo 1.0"));
    assert!(!lines.iter().any(|line| line.starts_with("runtime:")));

    let _ = std::fs::remove_dir_all(&root);
}

#[test]
fn pack_rejects_invalid_setup_data() {
    let root = test_root();
    let (stub, setup, archive) = write_pack_inputs(&root);
    std::fs::write(&setup, "[metadata]\nname = \"demo\"\n").expect("must overwrite setup");
    let output = root.join("demo-setup");

    let err = run_pack(
        PackArgs {
            stub: &stub,
            setup: &setup,
            archive: &archive,
            output: &output,
        },
        OutputStyle::Plain,
    )
    .expect_err("setup without a version should be rejected");
    assert!(!format!("{err:#}").is_empty());
    assert!(!output.exists());

    let _ = std::fs::remove_dir_all(&root);
}

#[test]
fn installed_bundle_is_fully_retraced() {
    let root = test_root();
    let (stub, setup, archive) = write_pack_inputs(&root);
    let installer = root.join("demo-setup");
    let target = root.join("target");
    let registry = root.join("registry");
    std::fs::create_dir_all(&target).expect("must create target");

    run_pack(
        PackArgs {
            stub: &stub,
            setup: &setup,
            archive: &archive,
            output: &installer,
        },
        OutputStyle::Plain,
    )
    .expect("pack should succeed");

    run_install(
        InstallArgs {
            bundle: Some(&installer),
            target_dir: Some(&target),
            registry_root: Some(&registry),
            json: true,
        },
        OutputStyle::Plain,
    )
    .expect("install should succeed");

    let journal = target.join("demo-retrace.log");
    assert_eq!(
        std::fs::read_to_string(target.join("a/b.txt")).expect("must read installed file"),
        "bee"
    );
    assert!(journal.exists());

    let code = run_uninstall(
        UninstallArgs {
            journal: &journal,
            registry_root: Some(&registry),
            keep_self: true,
            strict: true,
            json: true,
        },
        OutputStyle::Plain,
    )
    .expect("uninstall should succeed");

    assert_eq!(exit_code_debug(code), exit_code_debug(ExitCode::SUCCESS));
    assert!(!target.join("a/b.txt").exists());
    assert!(!target.join("a").exists());
    assert!(!target.join("c.txt").exists());
    assert!(!journal.exists());

    let _ = std::fs::remove_dir_all(&root);
}

fn split_command_line(command: &str) -> Vec<String> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    for ch in command.chars() {
        match ch {
            '"' => quoted = !quoted,
            ' ' if !quoted => {
                if !current.is_empty() {
                    args.push(std::mem::take(&mut current));
                }
            }
            _ => current.push(ch),
        }
    }
    if !current.is_empty() {
        args.push(current);
    }
    args
}

#[test]
fn split_command_line_honours_quotes() {
    assert_eq!(
        split_command_line("\"/opt/my app/Removedemo\" -u \"/opt/my app/demo-retrace.log\""),
        vec!["/opt/my app/Removedemo", "-u", "/opt/my app/demo-retrace.log"]
    );
}

#[test]
fn recorded_uninstall_string_retraces_everything() {
    let root = test_root();
    let (stub, setup, archive) = write_pack_inputs(&root);
    let installer = root.join("demo-setup");
    let target = root.join("target");
    let registry = root.join("registry");
    std::fs::create_dir_all(&target).expect("must create target");

    run_pack(
        PackArgs {
            stub: &stub,
            setup: &setup,
            archive: &archive,
            output: &installer,
        },
        OutputStyle::Plain,
    )
    .expect("pack should succeed");
    run_install(
        InstallArgs {
            bundle: Some(&installer),
            target_dir: Some(&target),
            registry_root: Some(&registry),
            json: true,
        },
        OutputStyle::Plain,
    )
    .expect("install should succeed");

    let store = FileRegistry::under(&registry);
    let key = join_key(
        UNINSTALL_KEY,
        &SetupData::from_toml_str(DEMO_SETUP)
            .expect("demo setup should parse")
            .uninstall_subkey_name(),
    );
    let recorded = [InstallScope::MachineWide, InstallScope::PerUser]
        .into_iter()
        .find_map(|scope| {
            store
                .query_value(scope, &key, "UninstallString")
                .expect("must query registry")
        })
        .expect("uninstall string must be registered");
    assert!(recorded.contains("--registry-root"));

    let mut argv = vec!["retrace".to_string()];
    argv.extend(split_command_line(&recorded).into_iter().skip(1));
    let cli = Cli::try_parse_from(argv).expect("recorded command line should parse");
    let code = run(cli, OutputStyle::Plain).expect("recorded uninstall should succeed");

    assert_eq!(exit_code_debug(code), exit_code_debug(ExitCode::SUCCESS));
    assert!(!target.join("a/b.txt").exists());
    assert!(!target.join("c.txt").exists());
    assert!(!target.join("demo-retrace.log").exists());
    for scope in [InstallScope::MachineWide, InstallScope::PerUser] {
        assert!(!store.key_exists(scope, &key).expect("must query registry"));
    }

    let _ = std::fs::remove_dir_all(&root);
}

#[test]
fn uninstall_of_missing_journal_exits_with_failure() {
    let root = test_root();
    let journal = root.join("absent-retrace.log");

    let code = run_uninstall(
        UninstallArgs {
            journal: &journal,
            registry_root: Some(&root.join("registry")),
            keep_self: true,
            strict: false,
            json: false,
        },
        OutputStyle::Plain,
    )
    .expect("uninstall errors are reported through the exit code");

    assert_eq!(exit_code_debug(code), exit_code_debug(ExitCode::from(1)));

    let _ = std::fs::remove_dir_all(&root);
}
