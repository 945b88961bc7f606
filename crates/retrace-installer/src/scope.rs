use serde::Serialize;
use tracing::{debug, warn};

use crate::registry::{RegistryStore, UNINSTALL_KEY};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum InstallScope {
    MachineWide,
    PerUser,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum RuntimeRegistration {
    MachineWide,
    PerUser,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScopeDecision {
    pub scope: InstallScope,
    pub warning: Option<String>,
}

impl InstallScope {
    pub fn hive_name(self) -> &'static str {
        match self {
            Self::MachineWide => "HKEY_LOCAL_MACHINE",
            Self::PerUser => "HKEY_CURRENT_USER",
        }
    }

    pub fn short_hive_name(self) -> &'static str {
        match self {
            Self::MachineWide => "HKLM",
            Self::PerUser => "HKCU",
        }
    }

    pub fn parse_hive(value: &str) -> Option<Self> {
        match value.trim() {
            "HKEY_LOCAL_MACHINE" | "HKLM" => Some(Self::MachineWide),
            "HKEY_CURRENT_USER" | "HKCU" => Some(Self::PerUser),
            _ => None,
        }
    }
}

impl From<InstallScope> for RuntimeRegistration {
    fn from(value: InstallScope) -> Self {
        match value {
            InstallScope::MachineWide => Self::MachineWide,
            InstallScope::PerUser => Self::PerUser,
        }
    }
}

pub fn resolve_scope(registration: RuntimeRegistration, store: &dyn RegistryStore) -> ScopeDecision {
    match registration {
        RuntimeRegistration::PerUser => ScopeDecision {
            scope: InstallScope::PerUser,
            warning: None,
        },
        RuntimeRegistration::MachineWide => {
            let scope = if has_machine_wide_privileges(store) {
                InstallScope::MachineWide
            } else {
                InstallScope::PerUser
            };
            ScopeDecision {
                scope,
                warning: None,
            }
        }
        RuntimeRegistration::Unknown => {
            let scope = if has_machine_wide_privileges(store) {
                InstallScope::MachineWide
            } else {
                InstallScope::PerUser
            };
            let warning = format!(
                "companion runtime registration type is unknown; installing into {}",
                scope.hive_name()
            );
            warn!("{warning}");
            ScopeDecision {
                scope,
                warning: Some(warning),
            }
        }
    }
}

fn has_machine_wide_privileges(store: &dyn RegistryStore) -> bool {
    match store.probe_create_access(InstallScope::MachineWide, UNINSTALL_KEY) {
        Ok(true) => true,
        Ok(false) => {
            debug!("machine-wide store denied create access; falling back to per-user scope");
            false
        }
        Err(err) => {
            debug!(error = %format!("{err:#}"), "machine-wide access probe failed; falling back to per-user scope");
            false
        }
    }
}
