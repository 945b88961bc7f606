use anyhow::Context;
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{debug, warn};

use crate::error::UninstallError;
use crate::fs_utils::remove_file_if_exists;
use crate::layout::journal_lock_path;

#[derive(Debug)]
pub struct UninstallLock {
    path: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LockHolder {
    Pid(u32),
    Unknown,
}

impl UninstallLock {
    pub fn acquire(journal: &Path) -> Result<Self, UninstallError> {
        Self::acquire_with(journal, process_is_running)
    }

    /// Claims `<journal>.lock`. A lock left by a process that is no longer
    /// running is reclaimed once.
    pub fn acquire_with<F>(journal: &Path, is_running: F) -> Result<Self, UninstallError>
    where
        F: Fn(u32) -> bool,
    {
        let path = journal_lock_path(journal);
        let mut reclaimed = false;
        let mut file = loop {
            match claim(&path) {
                Ok(file) => break file,
                Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                    let holder = read_holder(&path);
                    if let LockHolder::Pid(pid) = holder {
                        if !reclaimed && !is_running(pid) {
                            warn!(
                                path = %path.display(),
                                pid,
                                "reclaiming uninstall lock left by a process that is no longer running"
                            );
                            remove_file_if_exists(&path).with_context(|| {
                                format!("failed to remove stale uninstall lock: {}", path.display())
                            })?;
                            reclaimed = true;
                            continue;
                        }
                    }
                    return Err(UninstallError::Locked {
                        journal: journal.to_path_buf(),
                        lock_path: path,
                        holder: describe_holder(holder),
                    });
                }
                Err(err) => {
                    return Err(err)
                        .with_context(|| {
                            format!("failed to claim uninstall lock: {}", path.display())
                        })
                        .map_err(UninstallError::from);
                }
            }
        };

        let lock = Self { path };
        file.write_all(format!("{}\n", std::process::id()).as_bytes())
            .and_then(|()| file.flush())
            .with_context(|| format!("failed to write uninstall lock: {}", lock.path.display()))?;
        debug!(path = %lock.path.display(), "claimed uninstall lock");
        Ok(lock)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for UninstallLock {
    fn drop(&mut self) {
        if let Err(err) = remove_file_if_exists(&self.path) {
            warn!(path = %self.path.display(), error = %err, "failed to release uninstall lock");
        }
    }
}

fn claim(path: &Path) -> std::io::Result<File> {
    OpenOptions::new().write(true).create_new(true).open(path)
}

fn read_holder(path: &Path) -> LockHolder {
    fs::read_to_string(path)
        .ok()
        .and_then(|raw| raw.trim().parse::<u32>().ok())
        .map_or(LockHolder::Unknown, LockHolder::Pid)
}

fn describe_holder(holder: LockHolder) -> String {
    match holder {
        LockHolder::Pid(pid) => format!("pid {pid}"),
        LockHolder::Unknown => "an unknown process".to_string(),
    }
}

#[cfg(unix)]
pub(crate) fn process_is_running(pid: u32) -> bool {
    let proc_root = Path::new("/proc");
    if proc_root.join("self").exists() {
        return proc_root.join(pid.to_string()).exists();
    }
    match Command::new("kill").arg("-0").arg(pid.to_string()).output() {
        Ok(output) if output.status.success() => true,
        Ok(output) => !String::from_utf8_lossy(&output.stderr)
            .to_ascii_lowercase()
            .contains("no such process"),
        Err(_) => true,
    }
}

#[cfg(windows)]
pub(crate) fn process_is_running(pid: u32) -> bool {
    let filter = format!("PID eq {pid}");
    match Command::new("tasklist")
        .args(["/FI", &filter, "/NH", "/FO", "CSV"])
        .output()
    {
        Ok(output) if output.status.success() => {
            String::from_utf8_lossy(&output.stdout).contains(&format!("\"{pid}\""))
        }
        _ => true,
    }
}

#[cfg(not(any(unix, windows)))]
pub(crate) fn process_is_running(_pid: u32) -> bool {
    true
}
