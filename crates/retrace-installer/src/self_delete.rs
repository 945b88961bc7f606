use anyhow::{Context, Result};
use serde::Serialize;
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::process::{Command, Stdio};
use tracing::debug;

use crate::layout::self_delete_script_path;

#[cfg(windows)]
const CREATE_NEW_PROCESS_GROUP: u32 = 0x0000_0200;
#[cfg(windows)]
const IDLE_PRIORITY_CLASS: u32 = 0x0000_0040;
#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x0800_0000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "mode", rename_all = "kebab-case")]
pub enum SelfRemoval {
    Removed { exe: PathBuf },
    AlreadyGone { exe: PathBuf },
    Scheduled { exe: PathBuf, script: PathBuf },
}

pub fn render_self_delete_script(exe: &Path, script: &Path) -> String {
    let exe = exe.display();
    let script = script.display();
    format!(
        ":Repeat\r\ndel \"{exe}\"\r\nif exist \"{exe}\" goto Repeat\r\ndel \"{script}\"\r\n"
    )
}

pub fn write_self_delete_script(exe: &Path) -> Result<PathBuf> {
    let script = self_delete_script_path(exe);
    fs::write(&script, render_self_delete_script(exe, &script)).with_context(|| {
        format!("failed to write self-delete script: {}", script.display())
    })?;
    Ok(script)
}

pub fn drive_root(path: &Path) -> PathBuf {
    let root = path
        .components()
        .take_while(|component| matches!(component, Component::Prefix(_) | Component::RootDir))
        .collect::<PathBuf>();
    if root.as_os_str().is_empty() {
        PathBuf::from(std::path::MAIN_SEPARATOR_STR)
    } else {
        root
    }
}

pub fn self_delete_command(script: &Path) -> Command {
    let mut command = Command::new("cmd");
    command
        .arg("/C")
        .arg(script)
        .current_dir(drive_root(script))
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());

    #[cfg(windows)]
    {
        use std::os::windows::process::CommandExt;
        command.creation_flags(CREATE_NEW_PROCESS_GROUP | IDLE_PRIORITY_CLASS | CREATE_NO_WINDOW);
    }
    command
}

#[cfg(windows)]
pub fn schedule_self_delete(exe: &Path) -> Result<SelfRemoval> {
    let script = write_self_delete_script(exe)?;
    self_delete_command(&script)
        .spawn()
        .with_context(|| format!("failed to launch self-delete script: {}", script.display()))?;
    debug!(exe = %exe.display(), script = %script.display(), "scheduled uninstaller removal");
    Ok(SelfRemoval::Scheduled {
        exe: exe.to_path_buf(),
        script,
    })
}

#[cfg(not(windows))]
pub fn schedule_self_delete(exe: &Path) -> Result<SelfRemoval> {
    use crate::fs_utils::remove_file_if_exists;
    use crate::types::Removal;

    let removal = remove_file_if_exists(exe)
        .with_context(|| format!("failed to remove uninstaller: {}", exe.display()))?;
    debug!(exe = %exe.display(), ?removal, "removed uninstaller");
    Ok(match removal {
        Removal::Removed => SelfRemoval::Removed {
            exe: exe.to_path_buf(),
        },
        Removal::Missing => SelfRemoval::AlreadyGone {
            exe: exe.to_path_buf(),
        },
    })
}
