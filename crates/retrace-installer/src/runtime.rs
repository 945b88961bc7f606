use anyhow::Result;
use retrace_core::RuntimeRequirement;
use std::path::PathBuf;
use tracing::debug;

use crate::registry::{join_key, RegistryStore, DEFAULT_VALUE_NAME};
use crate::scope::{InstallScope, RuntimeRegistration};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeLocation {
    pub registration: RuntimeRegistration,
    pub install_path: Option<PathBuf>,
}

impl RuntimeLocation {
    pub fn unknown() -> Self {
        Self {
            registration: RuntimeRegistration::Unknown,
            install_path: None,
        }
    }
}

pub trait CompanionRuntime {
    fn locate(&self) -> Result<RuntimeLocation>;
}

pub struct UnregisteredRuntime;

impl CompanionRuntime for UnregisteredRuntime {
    fn locate(&self) -> Result<RuntimeLocation> {
        Ok(RuntimeLocation::unknown())
    }
}

pub struct RegistryRuntimeLocator<'a> {
    store: &'a dyn RegistryStore,
    requirement: RuntimeRequirement,
}

impl<'a> RegistryRuntimeLocator<'a> {
    pub fn new(store: &'a dyn RegistryStore, requirement: RuntimeRequirement) -> Self {
        Self { store, requirement }
    }

    pub fn install_path_key(&self) -> String {
        join_key(
            &join_key(&self.requirement.key, &self.requirement.version),
            "InstallPath",
        )
    }
}

impl CompanionRuntime for RegistryRuntimeLocator<'_> {
    fn locate(&self) -> Result<RuntimeLocation> {
        let key = self.install_path_key();
        for scope in [InstallScope::PerUser, InstallScope::MachineWide] {
            let Some(value) = self.store.query_value(scope, &key, DEFAULT_VALUE_NAME)? else {
                continue;
            };
            let install_path = value.trim();
            debug!(
                runtime = %self.requirement.name,
                hive = scope.hive_name(),
                install_path,
                "located companion runtime"
            );
            return Ok(RuntimeLocation {
                registration: scope.into(),
                install_path: (!install_path.is_empty()).then(|| PathBuf::from(install_path)),
            });
        }
        debug!(runtime = %self.requirement.name, key = %key, "companion runtime is not registered");
        Ok(RuntimeLocation::unknown())
    }
}
