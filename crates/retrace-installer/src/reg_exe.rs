use anyhow::{anyhow, Context, Result};
use std::process::Command;
use tracing::debug;

use crate::registry::{key_segments, RegistryStore, DEFAULT_VALUE_NAME};
use crate::scope::InstallScope;
use crate::types::{KeyDisposition, Removal};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

type CommandRunner = Box<dyn Fn(&mut Command) -> Result<RegOutput>>;

pub struct RegExeRegistry {
    runner: CommandRunner,
}

impl Default for RegExeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl RegExeRegistry {
    pub fn new() -> Self {
        Self::with_runner(run_reg_command)
    }

    pub fn with_runner(runner: impl Fn(&mut Command) -> Result<RegOutput> + 'static) -> Self {
        Self {
            runner: Box::new(runner),
        }
    }

    fn run(&self, mut command: Command) -> Result<RegOutput> {
        debug!(command = ?command, "running registry command");
        (self.runner)(&mut command)
    }

    fn run_checked(&self, command: Command, context_message: &str) -> Result<RegOutput> {
        let output = self.run(command)?;
        if output.success {
            return Ok(output);
        }
        Err(anyhow!(
            "{context_message}: stdout='{}' stderr='{}'",
            output.stdout.trim(),
            output.stderr.trim()
        ))
    }
}

pub fn run_reg_command(command: &mut Command) -> Result<RegOutput> {
    let output = command.output().with_context(|| {
        format!(
            "{}: command failed to start",
            command.get_program().to_string_lossy()
        )
    })?;
    Ok(RegOutput {
        success: output.status.success(),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}

pub fn reg_key_path(scope: InstallScope, key: &str) -> Result<String> {
    let segments = key_segments(key)?;
    Ok(format!("{}\\{}", scope.short_hive_name(), segments.join("\\")))
}

fn push_value_name(command: &mut Command, name: &str) {
    if name == DEFAULT_VALUE_NAME {
        command.arg("/ve");
    } else {
        command.arg("/v").arg(name);
    }
}

pub fn reg_query_key_command(scope: InstallScope, key: &str) -> Result<Command> {
    let mut command = Command::new("reg");
    command.arg("query").arg(reg_key_path(scope, key)?);
    Ok(command)
}

pub fn reg_query_value_command(scope: InstallScope, key: &str, name: &str) -> Result<Command> {
    let mut command = reg_query_key_command(scope, key)?;
    push_value_name(&mut command, name);
    Ok(command)
}

pub fn reg_add_key_command(scope: InstallScope, key: &str) -> Result<Command> {
    let mut command = Command::new("reg");
    command.arg("add").arg(reg_key_path(scope, key)?).arg("/f");
    Ok(command)
}

pub fn reg_add_value_command(
    scope: InstallScope,
    key: &str,
    name: &str,
    data: &str,
) -> Result<Command> {
    let mut command = Command::new("reg");
    command.arg("add").arg(reg_key_path(scope, key)?);
    push_value_name(&mut command, name);
    command.args(["/t", "REG_SZ", "/d", data, "/f"]);
    Ok(command)
}

pub fn reg_delete_value_command(scope: InstallScope, key: &str, name: &str) -> Result<Command> {
    let mut command = Command::new("reg");
    command.arg("delete").arg(reg_key_path(scope, key)?);
    push_value_name(&mut command, name);
    command.arg("/f");
    Ok(command)
}

pub fn reg_delete_key_command(scope: InstallScope, key: &str) -> Result<Command> {
    let mut command = Command::new("reg");
    command.arg("delete").arg(reg_key_path(scope, key)?).arg("/f");
    Ok(command)
}

pub fn machine_privilege_probe_command() -> Command {
    let mut command = Command::new("net");
    command.arg("session");
    command
}

pub fn parse_reg_query_value(stdout: &str) -> Option<String> {
    stdout.lines().find_map(|line| {
        let index = line.find("    REG_")?;
        let typed = &line[index + 4..];
        let data = typed
            .split_once("    ")
            .map(|(_, data)| data)
            .unwrap_or_default();
        Some(data.trim_end_matches(['\r', '\n']).to_string())
    })
}

fn has_subkeys(stdout: &str, key: &str) -> bool {
    let prefix = format!("{key}\\");
    stdout
        .lines()
        .map(str::trim)
        .filter(|line| line.starts_with("HKEY_"))
        .filter_map(|line| line.split_once('\\').map(|(_, rest)| rest))
        .any(|rest| {
            rest.len() > prefix.len()
                && rest
                    .get(..prefix.len())
                    .is_some_and(|head| head.eq_ignore_ascii_case(&prefix))
        })
}

impl RegistryStore for RegExeRegistry {
    fn probe_create_access(&self, scope: InstallScope, _key: &str) -> Result<bool> {
        match scope {
            InstallScope::PerUser => Ok(true),
            InstallScope::MachineWide => Ok(self.run(machine_privilege_probe_command())?.success),
        }
    }

    fn key_exists(&self, scope: InstallScope, key: &str) -> Result<bool> {
        Ok(self.run(reg_query_key_command(scope, key)?)?.success)
    }

    fn create_key(&self, scope: InstallScope, key: &str) -> Result<KeyDisposition> {
        if self.key_exists(scope, key)? {
            return Ok(KeyDisposition::Existing);
        }
        self.run_checked(
            reg_add_key_command(scope, key)?,
            &format!("failed to create registry key {}", reg_key_path(scope, key)?),
        )?;
        Ok(KeyDisposition::Created)
    }

    fn set_value(&self, scope: InstallScope, key: &str, name: &str, data: &str) -> Result<()> {
        self.run_checked(
            reg_add_value_command(scope, key, name, data)?,
            &format!(
                "failed to set registry value {}\\{name}",
                reg_key_path(scope, key)?
            ),
        )?;
        Ok(())
    }

    fn query_value(&self, scope: InstallScope, key: &str, name: &str) -> Result<Option<String>> {
        let output = self.run(reg_query_value_command(scope, key, name)?)?;
        if !output.success {
            return Ok(None);
        }
        Ok(parse_reg_query_value(&output.stdout))
    }

    fn delete_value(&self, scope: InstallScope, key: &str, name: &str) -> Result<Removal> {
        if self.query_value(scope, key, name)?.is_none() {
            return Ok(Removal::Missing);
        }
        self.run_checked(
            reg_delete_value_command(scope, key, name)?,
            &format!(
                "failed to delete registry value {}\\{name}",
                reg_key_path(scope, key)?
            ),
        )?;
        Ok(Removal::Removed)
    }

    fn delete_key(&self, scope: InstallScope, key: &str) -> Result<Removal> {
        let key_path = reg_key_path(scope, key)?;
        let listing = self.run(reg_query_key_command(scope, key)?)?;
        if !listing.success {
            return Ok(Removal::Missing);
        }
        if has_subkeys(&listing.stdout, &key_segments(key)?.join("\\")) {
            return Err(anyhow!("registry key has subkeys: {key_path}"));
        }
        self.run_checked(
            reg_delete_key_command(scope, key)?,
            &format!("failed to delete registry key {key_path}"),
        )?;
        Ok(Removal::Removed)
    }
}
