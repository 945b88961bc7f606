use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::fs_utils::remove_file_if_exists;
use crate::scope::InstallScope;
use crate::types::{KeyDisposition, Removal};

pub const UNINSTALL_KEY: &str = r"Software\Microsoft\Windows\CurrentVersion\Uninstall";
pub const DEFAULT_VALUE_NAME: &str = "";

const VALUES_FILE_NAME: &str = "values.toml";
const DEFAULT_VALUE_FILE_KEY: &str = "@";

pub trait RegistryStore {
    fn probe_create_access(&self, scope: InstallScope, key: &str) -> Result<bool>;
    fn key_exists(&self, scope: InstallScope, key: &str) -> Result<bool>;
    fn create_key(&self, scope: InstallScope, key: &str) -> Result<KeyDisposition>;
    fn set_value(&self, scope: InstallScope, key: &str, name: &str, data: &str) -> Result<()>;
    fn query_value(&self, scope: InstallScope, key: &str, name: &str) -> Result<Option<String>>;
    fn delete_value(&self, scope: InstallScope, key: &str, name: &str) -> Result<Removal>;
    fn delete_key(&self, scope: InstallScope, key: &str) -> Result<Removal>;
}

pub fn join_key(parent: &str, subkey: &str) -> String {
    let parent = parent.trim_matches('\\');
    let subkey = subkey.trim_matches('\\');
    if parent.is_empty() {
        return subkey.to_string();
    }
    if subkey.is_empty() {
        return parent.to_string();
    }
    format!("{parent}\\{subkey}")
}

pub fn key_segments(key: &str) -> Result<Vec<&str>> {
    let trimmed = key.trim_matches('\\');
    if trimmed.is_empty() {
        return Err(anyhow!("registry key must not be empty"));
    }
    let segments = trimmed.split('\\').collect::<Vec<_>>();
    for segment in &segments {
        if segment.is_empty() {
            return Err(anyhow!("registry key contains an empty segment: {key}"));
        }
        if *segment == "." || *segment == ".." {
            return Err(anyhow!("registry key contains a relative segment: {key}"));
        }
        if segment.chars().any(|ch| ch == '/' || ch.is_control()) {
            return Err(anyhow!("registry key contains invalid character(s): {key}"));
        }
    }
    Ok(segments)
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct ValueFile {
    #[serde(default)]
    values: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRegistry {
    machine_root: PathBuf,
    user_root: PathBuf,
}

impl FileRegistry {
    pub fn new(machine_root: impl Into<PathBuf>, user_root: impl Into<PathBuf>) -> Self {
        Self {
            machine_root: machine_root.into(),
            user_root: user_root.into(),
        }
    }

    pub fn under(root: &Path) -> Self {
        Self::new(root.join("machine"), root.join("user"))
    }

    pub fn default_locations() -> Result<Self> {
        let home =
            std::env::var("HOME").context("HOME is not set; cannot resolve per-user registry")?;
        Ok(Self::new(
            PathBuf::from("/var/lib/retrace/registry"),
            PathBuf::from(home).join(".retrace").join("registry"),
        ))
    }

    pub fn hive_dir(&self, scope: InstallScope) -> PathBuf {
        let root = match scope {
            InstallScope::MachineWide => &self.machine_root,
            InstallScope::PerUser => &self.user_root,
        };
        root.join(scope.hive_name())
    }

    fn key_dir(&self, scope: InstallScope, key: &str) -> Result<PathBuf> {
        let mut dir = self.hive_dir(scope);
        for segment in key_segments(key)? {
            dir.push(segment);
        }
        Ok(dir)
    }

    fn read_values(&self, key_dir: &Path) -> Result<ValueFile> {
        let path = key_dir.join(VALUES_FILE_NAME);
        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(ValueFile::default()),
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("failed to read registry values: {}", path.display()))
            }
        };
        toml::from_str(&raw)
            .with_context(|| format!("failed to parse registry values: {}", path.display()))
    }

    fn write_values(&self, key_dir: &Path, values: &ValueFile) -> Result<()> {
        let path = key_dir.join(VALUES_FILE_NAME);
        if values.values.is_empty() {
            return remove_file_if_exists(&path)
                .map(|_| ())
                .with_context(|| format!("failed to remove registry values: {}", path.display()));
        }
        let rendered = toml::to_string(values).context("failed to serialize registry values")?;
        fs::write(&path, rendered)
            .with_context(|| format!("failed to write registry values: {}", path.display()))
    }
}

fn value_file_key(name: &str) -> &str {
    if name == DEFAULT_VALUE_NAME {
        DEFAULT_VALUE_FILE_KEY
    } else {
        name
    }
}

fn nearest_existing_ancestor(path: &Path) -> Option<&Path> {
    path.ancestors().find(|candidate| candidate.is_dir())
}

impl RegistryStore for FileRegistry {
    fn probe_create_access(&self, scope: InstallScope, key: &str) -> Result<bool> {
        let key_dir = self.key_dir(scope, key)?;
        let Some(existing) = nearest_existing_ancestor(&key_dir) else {
            return Ok(false);
        };
        let probe = existing.join(format!(".retrace-probe-{}", std::process::id()));
        match OpenOptions::new().write(true).create_new(true).open(&probe) {
            Ok(file) => {
                drop(file);
                fs::remove_file(&probe).with_context(|| {
                    format!("failed to remove access probe: {}", probe.display())
                })?;
                Ok(true)
            }
            Err(err) if err.kind() == ErrorKind::PermissionDenied => {
                debug!(path = %existing.display(), "registry create access denied");
                Ok(false)
            }
            Err(err) => Err(err).with_context(|| {
                format!("failed to probe registry access: {}", existing.display())
            }),
        }
    }

    fn key_exists(&self, scope: InstallScope, key: &str) -> Result<bool> {
        Ok(self.key_dir(scope, key)?.is_dir())
    }

    fn create_key(&self, scope: InstallScope, key: &str) -> Result<KeyDisposition> {
        let key_dir = self.key_dir(scope, key)?;
        if key_dir.is_dir() {
            return Ok(KeyDisposition::Existing);
        }
        fs::create_dir_all(&key_dir).with_context(|| {
            format!(
                "failed to create registry key {}\\{key}: {}",
                scope.hive_name(),
                key_dir.display()
            )
        })?;
        Ok(KeyDisposition::Created)
    }

    fn set_value(&self, scope: InstallScope, key: &str, name: &str, data: &str) -> Result<()> {
        let key_dir = self.key_dir(scope, key)?;
        if !key_dir.is_dir() {
            return Err(anyhow!(
                "registry key does not exist: {}\\{key}",
                scope.hive_name()
            ));
        }
        let mut values = self.read_values(&key_dir)?;
        values
            .values
            .insert(value_file_key(name).to_string(), data.to_string());
        self.write_values(&key_dir, &values)
    }

    fn query_value(&self, scope: InstallScope, key: &str, name: &str) -> Result<Option<String>> {
        let key_dir = self.key_dir(scope, key)?;
        if !key_dir.is_dir() {
            return Ok(None);
        }
        let mut values = self.read_values(&key_dir)?;
        Ok(values.values.remove(value_file_key(name)))
    }

    fn delete_value(&self, scope: InstallScope, key: &str, name: &str) -> Result<Removal> {
        let key_dir = self.key_dir(scope, key)?;
        if !key_dir.is_dir() {
            return Ok(Removal::Missing);
        }
        let mut values = self.read_values(&key_dir)?;
        if values.values.remove(value_file_key(name)).is_none() {
            return Ok(Removal::Missing);
        }
        self.write_values(&key_dir, &values)?;
        Ok(Removal::Removed)
    }

    fn delete_key(&self, scope: InstallScope, key: &str) -> Result<Removal> {
        let key_dir = self.key_dir(scope, key)?;
        if !key_dir.is_dir() {
            return Ok(Removal::Missing);
        }
        let has_subkeys = fs::read_dir(&key_dir)
            .with_context(|| format!("failed to read registry key: {}", key_dir.display()))?
            .filter_map(|entry| entry.ok())
            .any(|entry| entry.path().is_dir());
        if has_subkeys {
            return Err(anyhow!(
                "registry key has subkeys: {}\\{key}",
                scope.hive_name()
            ));
        }
        remove_file_if_exists(&key_dir.join(VALUES_FILE_NAME)).with_context(|| {
            format!("failed to remove registry values: {}", key_dir.display())
        })?;
        fs::remove_dir(&key_dir).with_context(|| {
            format!("failed to delete registry key: {}", key_dir.display())
        })?;
        Ok(Removal::Removed)
    }
}
