use std::ffi::OsString;
use std::path::{Path, PathBuf};

pub const EXE_SUFFIX: &str = std::env::consts::EXE_SUFFIX;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallLayout {
    target_dir: PathBuf,
    package_name: String,
}

impl InstallLayout {
    pub fn new(target_dir: impl Into<PathBuf>, package_name: impl Into<String>) -> Self {
        Self {
            target_dir: target_dir.into(),
            package_name: package_name.into(),
        }
    }

    pub fn target_dir(&self) -> &Path {
        &self.target_dir
    }

    pub fn package_name(&self) -> &str {
        &self.package_name
    }

    pub fn journal_path(&self) -> PathBuf {
        self.target_dir
            .join(format!("{}-retrace.log", self.package_name))
    }

    pub fn uninstaller_path(&self) -> PathBuf {
        self.target_dir
            .join(format!("Remove{}{EXE_SUFFIX}", self.package_name))
    }

    pub fn payload_path(&self, rel_path: &Path) -> PathBuf {
        self.target_dir.join(rel_path)
    }
}

fn with_appended_extension(path: &Path, extension: &str) -> PathBuf {
    let mut raw = OsString::from(path.as_os_str());
    raw.push(".");
    raw.push(extension);
    PathBuf::from(raw)
}

pub fn journal_lock_path(journal: &Path) -> PathBuf {
    with_appended_extension(journal, "lock")
}

pub fn self_delete_script_path(exe: &Path) -> PathBuf {
    with_appended_extension(exe, "bat")
}

pub fn is_uninstaller_copy(exe: &Path, journal: &Path) -> bool {
    let Some(file_name) = exe.file_name().and_then(|name| name.to_str()) else {
        return false;
    };
    if !file_name.starts_with("Remove") {
        return false;
    }
    let exe_dir = exe.parent().map(normalize_dir);
    let journal_dir = journal.parent().map(normalize_dir);
    exe_dir.is_some() && exe_dir == journal_dir
}

fn normalize_dir(dir: &Path) -> PathBuf {
    if dir.as_os_str().is_empty() {
        return PathBuf::from(".");
    }
    dir.canonicalize().unwrap_or_else(|_| dir.to_path_buf())
}

pub fn quote_command_arg(value: &str) -> String {
    format!("\"{value}\"")
}

pub fn uninstall_command(uninstaller: &Path, journal: &Path, registry_root: Option<&Path>) -> String {
    let mut command = format!(
        "{} -u {}",
        quote_command_arg(&uninstaller.display().to_string()),
        quote_command_arg(&journal.display().to_string())
    );
    if let Some(root) = registry_root {
        command.push_str(" --registry-root ");
        command.push_str(&quote_command_arg(&root.display().to_string()));
    }
    command
}
