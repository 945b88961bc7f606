use serde::Serialize;
use std::path::PathBuf;

use crate::scope::InstallScope;
use crate::self_delete::SelfRemoval;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Removal {
    Removed,
    Missing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum KeyDisposition {
    Created,
    Existing,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MutationFailure {
    pub action: String,
    pub target: String,
    pub message: String,
}

impl MutationFailure {
    pub fn new(action: &str, target: impl Into<String>, err: &anyhow::Error) -> Self {
        Self {
            action: action.to_string(),
            target: target.into(),
            message: format!("{err:#}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstallResult {
    pub package: String,
    pub scope: InstallScope,
    pub target_dir: PathBuf,
    pub journal_path: PathBuf,
    pub uninstaller_path: Option<PathBuf>,
    pub uninstall_command: String,
    pub created_files: Vec<PathBuf>,
    pub overwritten_files: Vec<PathBuf>,
    pub created_dirs: Vec<PathBuf>,
    pub registry_entries: usize,
    pub failures: Vec<MutationFailure>,
    pub warnings: Vec<String>,
}

impl InstallResult {
    pub fn files_written(&self) -> usize {
        self.created_files.len() + self.overwritten_files.len()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UndoCounts {
    pub registry_values: usize,
    pub registry_keys: usize,
    pub files: usize,
    pub directories: usize,
    pub already_missing: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UninstallReport {
    pub journal_path: PathBuf,
    pub scope: InstallScope,
    pub undone: UndoCounts,
    pub failures: Vec<MutationFailure>,
    pub journal_removed: bool,
    pub self_removal: Option<SelfRemoval>,
}

impl UninstallReport {
    pub fn has_warnings(&self) -> bool {
        !self.failures.is_empty()
    }
}
