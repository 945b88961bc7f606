use anyhow::{Context, Result};
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::UninstallError;
use crate::scope::InstallScope;

pub const SCOPE_MARKER_CODE: u16 = 999;
pub const REGISTRY_KEY_CODE: u16 = 20;
pub const REGISTRY_VALUE_CODE: u16 = 40;
pub const DIRECTORY_CODE: u16 = 100;
pub const FILE_CODE: u16 = 200;

const SCOPE_MARKER_LABEL: &str = "Root Key";
const REGISTRY_KEY_LABEL: &str = "Reg DB Key";
const REGISTRY_VALUE_LABEL: &str = "Reg DB Value";
const DIRECTORY_LABEL: &str = "Made Dir";
const FILE_CREATED_LABEL: &str = "File Copy";
const FILE_OVERWRITTEN_LABEL: &str = "File Overwrite";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JournalEntry {
    ScopeMarker(InstallScope),
    RegistryKeyCreated {
        parent: String,
        subkey: String,
    },
    RegistryValueSet {
        key: String,
        name: String,
        data: String,
    },
    DirectoryCreated(PathBuf),
    FileCreated(PathBuf),
    FileOverwritten(PathBuf),
}

impl JournalEntry {
    pub fn priority_code(&self) -> u16 {
        match self {
            Self::ScopeMarker(_) => SCOPE_MARKER_CODE,
            Self::RegistryKeyCreated { .. } => REGISTRY_KEY_CODE,
            Self::RegistryValueSet { .. } => REGISTRY_VALUE_CODE,
            Self::DirectoryCreated(_) => DIRECTORY_CODE,
            Self::FileCreated(_) | Self::FileOverwritten(_) => FILE_CODE,
        }
    }

    pub fn class_label(&self) -> &'static str {
        match self {
            Self::ScopeMarker(_) => SCOPE_MARKER_LABEL,
            Self::RegistryKeyCreated { .. } => REGISTRY_KEY_LABEL,
            Self::RegistryValueSet { .. } => REGISTRY_VALUE_LABEL,
            Self::DirectoryCreated(_) => DIRECTORY_LABEL,
            Self::FileCreated(_) => FILE_CREATED_LABEL,
            Self::FileOverwritten(_) => FILE_OVERWRITTEN_LABEL,
        }
    }

    fn payload(&self) -> String {
        match self {
            Self::ScopeMarker(scope) => scope.hive_name().to_string(),
            Self::RegistryKeyCreated { parent, subkey } => format!("[{parent}]{subkey}"),
            Self::RegistryValueSet { key, name, data } => format!("[{key}]{name}={data}"),
            Self::DirectoryCreated(path) | Self::FileCreated(path) | Self::FileOverwritten(path) => {
                path.to_string_lossy().into_owned()
            }
        }
    }

    pub fn to_line(&self) -> String {
        format!(
            "{:03} {}: {}",
            self.priority_code(),
            self.class_label(),
            sanitize(&self.payload())
        )
    }

    pub fn parse_line(line: &str) -> std::result::Result<Self, String> {
        let Some((code, rest)) = line.split_once(' ') else {
            return Err(format!("missing class code: '{line}'"));
        };
        if code.len() != 3 || !code.chars().all(|ch| ch.is_ascii_digit()) {
            return Err(format!("invalid class code '{code}'"));
        }
        let code: u16 = code
            .parse()
            .map_err(|_| format!("invalid class code '{code}'"))?;
        let Some((label, payload)) = rest.split_once(": ") else {
            return Err(format!("missing class label separator: '{line}'"));
        };

        let entry = match label {
            SCOPE_MARKER_LABEL => {
                let scope = InstallScope::parse_hive(payload)
                    .ok_or_else(|| format!("unknown registry root '{payload}'"))?;
                Self::ScopeMarker(scope)
            }
            REGISTRY_KEY_LABEL => {
                let (parent, subkey) = split_bracketed_key(payload)?;
                if subkey.is_empty() {
                    return Err(format!("registry key entry has no subkey: '{payload}'"));
                }
                Self::RegistryKeyCreated {
                    parent: parent.to_string(),
                    subkey: subkey.to_string(),
                }
            }
            REGISTRY_VALUE_LABEL => {
                let (key, rest) = split_bracketed_key(payload)?;
                let Some((name, data)) = rest.split_once('=') else {
                    return Err(format!("registry value entry has no '=': '{payload}'"));
                };
                Self::RegistryValueSet {
                    key: key.to_string(),
                    name: name.to_string(),
                    data: data.to_string(),
                }
            }
            DIRECTORY_LABEL => Self::DirectoryCreated(non_empty_path(payload)?),
            FILE_CREATED_LABEL => Self::FileCreated(non_empty_path(payload)?),
            FILE_OVERWRITTEN_LABEL => Self::FileOverwritten(non_empty_path(payload)?),
            other => return Err(format!("unknown class label '{other}'")),
        };

        if entry.priority_code() != code {
            return Err(format!(
                "class code {code:03} does not match label '{label}'"
            ));
        }
        Ok(entry)
    }
}

fn split_bracketed_key(payload: &str) -> std::result::Result<(&str, &str), String> {
    payload
        .strip_prefix('[')
        .and_then(|rest| rest.split_once(']'))
        .ok_or_else(|| format!("malformed registry payload: '{payload}'"))
}

fn non_empty_path(payload: &str) -> std::result::Result<PathBuf, String> {
    if payload.trim().is_empty() {
        return Err("path payload is empty".to_string());
    }
    Ok(PathBuf::from(payload))
}

pub fn sanitize(value: &str) -> String {
    value
        .chars()
        .map(|ch| if ch.is_control() { '?' } else { ch })
        .collect()
}

pub fn current_unix_timestamp() -> Result<u64> {
    Ok(SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .context("system time is before unix epoch")?
        .as_secs())
}

pub struct JournalWriter {
    path: PathBuf,
    file: File,
    entries_written: usize,
}

impl JournalWriter {
    pub fn open(path: &Path, source: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("failed to open install journal: {}", path.display()))?;
        let mut writer = Self {
            path: path.to_path_buf(),
            file,
            entries_written: 0,
        };
        writer.write_line(&format!(
            "*** Installation started at {} ***",
            current_unix_timestamp()?
        ))?;
        writer.write_line(&format!(
            "Source: {}",
            sanitize(&source.to_string_lossy())
        ))?;
        Ok(writer)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn entries_written(&self) -> usize {
        self.entries_written
    }

    pub fn record(&mut self, entry: &JournalEntry) -> Result<()> {
        self.write_line(&entry.to_line())?;
        self.entries_written += 1;
        Ok(())
    }

    pub fn finish(mut self) -> Result<PathBuf> {
        self.write_line(&format!(
            "*** Installation finished at {} ***",
            current_unix_timestamp()?
        ))?;
        Ok(self.path)
    }

    fn write_line(&mut self, line: &str) -> Result<()> {
        self.file
            .write_all(format!("{line}\n").as_bytes())
            .with_context(|| format!("failed to append install journal: {}", self.path.display()))?;
        self.file
            .flush()
            .with_context(|| format!("failed to flush install journal: {}", self.path.display()))?;
        self.file
            .sync_data()
            .with_context(|| format!("failed to sync install journal: {}", self.path.display()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SequencedEntry {
    pub position: usize,
    pub scope: InstallScope,
    pub entry: JournalEntry,
}

fn is_session_line(line: &str) -> bool {
    (line.starts_with("***") && line.ends_with("***")) || line.starts_with("Source: ")
}

pub fn parse_journal(
    path: &Path,
    raw: &str,
) -> std::result::Result<Vec<SequencedEntry>, UninstallError> {
    let mut entries = Vec::new();
    let mut scope = None;

    for (index, line) in raw.lines().enumerate() {
        let trimmed = line.strip_suffix('\r').unwrap_or(line);
        if trimmed.trim().is_empty() || is_session_line(trimmed) {
            continue;
        }
        let entry = JournalEntry::parse_line(trimmed)
            .map_err(|reason| UninstallError::corrupt(path, format!("line {}: {reason}", index + 1)))?;
        if let JournalEntry::ScopeMarker(marker) = entry {
            scope = Some(marker);
        }
        let Some(active_scope) = scope else {
            return Err(UninstallError::corrupt(
                path,
                format!(
                    "line {}: first entry must be a '{SCOPE_MARKER_LABEL}' scope marker",
                    index + 1
                ),
            ));
        };
        entries.push(SequencedEntry {
            position: entries.len(),
            scope: active_scope,
            entry,
        });
    }

    if entries.is_empty() {
        return Err(UninstallError::corrupt(path, "journal contains no entries"));
    }
    Ok(entries)
}

pub fn read_journal(path: &Path) -> std::result::Result<Vec<SequencedEntry>, UninstallError> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == ErrorKind::NotFound => {
            return Err(UninstallError::corrupt(path, "journal file does not exist"));
        }
        Err(err) => {
            return Err(UninstallError::corrupt(
                path,
                format!("journal file is unreadable: {err}"),
            ));
        }
    };
    parse_journal(path, &String::from_utf8_lossy(&bytes))
}
