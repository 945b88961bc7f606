use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{anyhow, Context, Result};
use retrace_core::{build_bundle, Bundle, SetupData, ZipPayload};
use retrace_installer::{
    install, uninstall, CompanionRuntime, FileRegistry, InstallRequest, InstallResult,
    RegExeRegistry, RegistryRuntimeLocator, RegistryStore, RuntimeLocation, SelfRemoval,
    UninstallError, UninstallOptions, UninstallReport, UnregisteredRuntime,
};
use serde::Serialize;
use tracing::debug;

use crate::render::{
    render_error_line, render_status_line, render_warning_line, Console, OutputStyle, Status,
};

pub(crate) const REGISTRY_ROOT_ENV: &str = "RETRACE_REGISTRY_ROOT";

const EXIT_FAILURE: u8 = 1;
const EXIT_WARNINGS: u8 = 2;

pub(crate) fn registry_root_override(flag: Option<&Path>) -> Result<Option<PathBuf>> {
    let root = match flag {
        Some(root) => root.to_path_buf(),
        None => match std::env::var_os(REGISTRY_ROOT_ENV).filter(|value| !value.is_empty()) {
            Some(root) => PathBuf::from(root),
            None => return Ok(None),
        },
    };
    std::path::absolute(&root)
        .map(Some)
        .with_context(|| format!("failed to resolve registry root: {}", root.display()))
}

pub(crate) fn open_registry_store(registry_root: Option<&Path>) -> Result<Box<dyn RegistryStore>> {
    if let Some(root) = registry_root {
        return Ok(Box::new(FileRegistry::under(root)));
    }
    if cfg!(windows) {
        return Ok(Box::new(RegExeRegistry::new()));
    }
    Ok(Box::new(FileRegistry::default_locations()?))
}

fn locate_runtime(setup: &SetupData, store: &dyn RegistryStore) -> Result<RuntimeLocation> {
    match &setup.runtime {
        Some(requirement) => RegistryRuntimeLocator::new(store, requirement.clone()).locate(),
        None => UnregisteredRuntime.locate(),
    }
}

fn own_executable() -> Result<PathBuf> {
    std::env::current_exe().context("failed to resolve the running executable")
}

pub(crate) struct InstallArgs<'a> {
    pub bundle: Option<&'a Path>,
    pub target_dir: Option<&'a Path>,
    pub registry_root: Option<&'a Path>,
    pub json: bool,
}

pub(crate) fn run_install(args: InstallArgs<'_>, style: OutputStyle) -> Result<ExitCode> {
    let bundle_path = match args.bundle {
        Some(path) => path.to_path_buf(),
        None => own_executable()?,
    };
    let bundle = Bundle::open(&bundle_path)?;
    let setup = bundle.setup()?;
    let registry_root = registry_root_override(args.registry_root)?;
    let store = open_registry_store(registry_root.as_deref())?;

    let location = locate_runtime(&setup, store.as_ref())?;
    let target_dir = resolve_target_dir(args.target_dir, &location, &setup)?;
    debug!(target = %target_dir.display(), registration = ?location.registration, "resolved install target");

    let payload = ZipPayload::new(bundle.archive_bytes())?;
    let total = payload.len() as u64;
    let stub = bundle.stub_bytes();
    let request = InstallRequest {
        setup: &setup,
        target_dir,
        source: bundle_path.clone(),
        uninstaller_stub: (!stub.is_empty()).then_some(stub),
        registration: location.registration,
        registry_root,
    };

    let console = Console::new(if args.json { OutputStyle::Plain } else { style });
    if !args.json {
        console.heading(&format!("Installing {}", setup.title()));
    }
    let mut progress = console.extraction(total);
    let outcome = install(&request, store.as_ref(), payload, |path| {
        progress.advance(path);
    });
    let result = match outcome {
        Ok(result) => {
            progress.complete();
            result
        }
        Err(err) => {
            progress.abandon();
            return Err(err);
        }
    };

    if args.json {
        println!("{}", to_json(&result)?);
    } else {
        console.lines(&format_install_result_lines(&result, style));
    }
    Ok(ExitCode::SUCCESS)
}

fn resolve_target_dir(
    explicit: Option<&Path>,
    location: &RuntimeLocation,
    setup: &SetupData,
) -> Result<PathBuf> {
    if let Some(path) = explicit {
        return Ok(path.to_path_buf());
    }
    if let Some(path) = &location.install_path {
        return Ok(path.clone());
    }
    match &setup.runtime {
        Some(runtime) => Err(anyhow!(
            "{} {} is not registered; pass --target-dir to choose an install directory",
            runtime.name,
            runtime.version
        )),
        None => Err(anyhow!(
            "no companion runtime is declared; pass --target-dir to choose an install directory"
        )),
    }
}

pub(crate) fn format_install_result_lines(result: &InstallResult, style: OutputStyle) -> Vec<String> {
    let mut lines = vec![
        render_status_line(
            style,
            Status::Ok,
            &format!(
                "installed {} into {} ({})",
                result.package,
                result.target_dir.display(),
                result.scope.hive_name()
            ),
        ),
        render_status_line(
            style,
            Status::Step,
            &format!(
                "files: {} created, {} overwritten",
                result.created_files.len(),
                result.overwritten_files.len()
            ),
        ),
        render_status_line(
            style,
            Status::Step,
            &format!("directories: {} created", result.created_dirs.len()),
        ),
        render_status_line(
            style,
            Status::Step,
            &format!(
                "registry: {} entries under {}",
                result.registry_entries,
                result.scope.hive_name()
            ),
        ),
        render_status_line(
            style,
            Status::Step,
            &format!("journal: {}", result.journal_path.display()),
        ),
        render_status_line(
            style,
            Status::Step,
            &format!("uninstall: {}", result.uninstall_command),
        ),
    ];
    for warning in &result.warnings {
        lines.push(render_warning_line(style, warning));
    }
    for failure in &result.failures {
        lines.push(render_warning_line(
            style,
            &format!("{} failed for {}: {}", failure.action, failure.target, failure.message),
        ));
    }
    lines
}

pub(crate) struct UninstallArgs<'a> {
    pub journal: &'a Path,
    pub registry_root: Option<&'a Path>,
    pub keep_self: bool,
    pub strict: bool,
    pub json: bool,
}

pub(crate) fn run_uninstall(args: UninstallArgs<'_>, style: OutputStyle) -> Result<ExitCode> {
    let registry_root = registry_root_override(args.registry_root)?;
    let store = open_registry_store(registry_root.as_deref())?;
    let options = UninstallOptions {
        self_exe: own_executable().ok(),
        keep_self: args.keep_self,
    };

    let report = match uninstall(args.journal, store.as_ref(), &options) {
        Ok(report) => report,
        Err(err) => {
            eprintln!("{}", render_error_line(style, &uninstall_error_message(&err)));
            return Ok(ExitCode::from(EXIT_FAILURE));
        }
    };

    if args.json {
        println!("{}", to_json(&report)?);
    } else {
        let console = Console::new(style);
        console.heading("Uninstall");
        console.lines(&format_uninstall_report_lines(&report, style));
    }
    Ok(uninstall_exit_code(&report, args.strict))
}

pub(crate) fn uninstall_exit_code(report: &UninstallReport, strict: bool) -> ExitCode {
    if strict && report.has_warnings() {
        ExitCode::from(EXIT_WARNINGS)
    } else {
        ExitCode::SUCCESS
    }
}

pub(crate) fn uninstall_error_message(err: &UninstallError) -> String {
    match err {
        UninstallError::Other(inner) => format!("{inner:#}"),
        other => other.to_string(),
    }
}

pub(crate) fn format_uninstall_report_lines(
    report: &UninstallReport,
    style: OutputStyle,
) -> Vec<String> {
    let undone = &report.undone;
    let mut lines = vec![
        render_status_line(
            style,
            Status::Ok,
            &format!(
                "uninstalled from {} ({})",
                report.journal_path.display(),
                report.scope.hive_name()
            ),
        ),
        render_status_line(
            style,
            Status::Step,
            &format!(
                "removed: {} files, {} directories, {} registry values, {} registry keys",
                undone.files, undone.directories, undone.registry_values, undone.registry_keys
            ),
        ),
    ];
    if undone.already_missing > 0 {
        lines.push(render_status_line(
            style,
            Status::Step,
            &format!("already gone: {}", undone.already_missing),
        ));
    }
    match &report.self_removal {
        Some(SelfRemoval::Removed { exe }) => lines.push(render_status_line(
            style,
            Status::Step,
            &format!("uninstaller removed: {}", exe.display()),
        )),
        Some(SelfRemoval::AlreadyGone { exe }) => lines.push(render_status_line(
            style,
            Status::Step,
            &format!("uninstaller already gone: {}", exe.display()),
        )),
        Some(SelfRemoval::Scheduled { script, .. }) => lines.push(render_status_line(
            style,
            Status::Step,
            &format!("uninstaller removal scheduled: {}", script.display()),
        )),
        None => {}
    }
    if !report.journal_removed {
        lines.push(render_warning_line(style, "journal was kept"));
    }
    for failure in &report.failures {
        lines.push(render_warning_line(
            style,
            &format!("{} failed for {}: {}", failure.action, failure.target, failure.message),
        ));
    }
    lines
}

pub(crate) struct PackArgs<'a> {
    pub stub: &'a Path,
    pub setup: &'a Path,
    pub archive: &'a Path,
    pub output: &'a Path,
}

pub(crate) fn run_pack(args: PackArgs<'_>, style: OutputStyle) -> Result<ExitCode> {
    let stub = fs::read(args.stub)
        .with_context(|| format!("failed to read installer stub: {}", args.stub.display()))?;
    let setup_text = fs::read_to_string(args.setup)
        .with_context(|| format!("failed to read setup data: {}", args.setup.display()))?;
    let setup = SetupData::from_toml_str(&setup_text)?;
    let archive = fs::read(args.archive)
        .with_context(|| format!("failed to read payload archive: {}", args.archive.display()))?;
    let members = ZipPayload::new(&archive)?.len();

    let bytes = build_bundle(&stub, &setup_text, &archive);
    let digest = Bundle::from_bytes(bytes.clone())?.payload_sha256();
    write_installer(args.output, &bytes)?;

    Console::new(style).status(
        Status::Ok,
        &format!(
            "packed {} ({} archive members) into {} sha256={digest}",
            setup.title(),
            members,
            args.output.display()
        ),
    );
    Ok(ExitCode::SUCCESS)
}

fn write_installer(path: &Path, bytes: &[u8]) -> Result<()> {
    fs::write(path, bytes)
        .with_context(|| format!("failed to write installer: {}", path.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut permissions = fs::metadata(path)
            .with_context(|| format!("failed to inspect installer: {}", path.display()))?
            .permissions();
        permissions.set_mode(0o755);
        fs::set_permissions(path, permissions)
            .with_context(|| format!("failed setting installer permissions: {}", path.display()))?;
    }
    Ok(())
}

#[derive(Debug, Serialize)]
pub(crate) struct InspectReport {
    pub installer: PathBuf,
    pub name: String,
    pub version: String,
    pub title: String,
    pub display_name: String,
    pub runtime: Option<String>,
    pub stub_bytes: usize,
    pub archive_members: usize,
    pub payload_sha256: String,
}

pub(crate) fn inspect_bundle(path: &Path) -> Result<InspectReport> {
    let bundle = Bundle::open(path)?;
    let setup = bundle.setup()?;
    Ok(InspectReport {
        installer: path.to_path_buf(),
        name: setup.metadata.name.clone(),
        version: setup.metadata.version.clone(),
        title: setup.title(),
        display_name: setup.display_name(),
        runtime: setup
            .runtime
            .as_ref()
            .map(|runtime| format!("{} {} ({})", runtime.name, runtime.version, runtime.key)),
        stub_bytes: bundle.stub_bytes().len(),
        archive_members: ZipPayload::new(bundle.archive_bytes())?.len(),
        payload_sha256: bundle.payload_sha256(),
    })
}

pub(crate) fn format_inspect_lines(report: &InspectReport) -> Vec<String> {
    let mut lines = vec![
        format!("installer: {}", report.installer.display()),
        format!("package: {} {}", report.name, report.version),
        format!("title: {}", report.title),
        format!("display name: {}", report.display_name),
    ];
    if let Some(runtime) = &report.runtime {
        lines.push(format!("runtime: {runtime}"));
    }
    lines.push(format!("stub: {} bytes", report.stub_bytes));
    lines.push(format!("archive members: {}", report.archive_members));
    lines.push(format!("payload sha256: {}", report.payload_sha256));
    lines
}

pub(crate) fn run_inspect(installer: Option<&Path>, json: bool) -> Result<ExitCode> {
    let path = match installer {
        Some(path) => path.to_path_buf(),
        None => own_executable()?,
    };
    let report = inspect_bundle(&path)?;
    if json {
        println!("{}", to_json(&report)?);
    } else {
        for line in format_inspect_lines(&report) {
            println!("{line}");
        }
    }
    Ok(ExitCode::SUCCESS)
}

fn to_json(value: &impl Serialize) -> Result<String> {
    serde_json::to_string_pretty(value).context("failed to render json output")
}
