mod error;
mod fs_utils;
mod install;
mod journal;
mod layout;
mod lock;
mod reg_exe;
mod registry;
mod runtime;
mod scope;
mod self_delete;
mod types;
mod uninstall;

pub use error::UninstallError;
pub use fs_utils::{remove_dir_if_exists, remove_file_if_exists};
pub use install::{install, InstallRequest, InstallSession};
pub use journal::{
    current_unix_timestamp, parse_journal, read_journal, sanitize, JournalEntry, JournalWriter,
    SequencedEntry, DIRECTORY_CODE, FILE_CODE, REGISTRY_KEY_CODE, REGISTRY_VALUE_CODE,
    SCOPE_MARKER_CODE,
};
pub use layout::{
    is_uninstaller_copy, journal_lock_path, self_delete_script_path, uninstall_command,
    InstallLayout, EXE_SUFFIX,
};
pub use lock::UninstallLock;
pub use reg_exe::{
    machine_privilege_probe_command, parse_reg_query_value, reg_add_key_command,
    reg_add_value_command, reg_delete_key_command, reg_delete_value_command, reg_key_path,
    reg_query_key_command, reg_query_value_command, run_reg_command, RegExeRegistry, RegOutput,
};
pub use registry::{
    join_key, key_segments, FileRegistry, RegistryStore, DEFAULT_VALUE_NAME, UNINSTALL_KEY,
};
pub use runtime::{CompanionRuntime, RegistryRuntimeLocator, RuntimeLocation, UnregisteredRuntime};
pub use scope::{resolve_scope, InstallScope, RuntimeRegistration, ScopeDecision};
pub use self_delete::{
    drive_root, render_self_delete_script, schedule_self_delete, self_delete_command,
    write_self_delete_script, SelfRemoval,
};
pub use types::{
    InstallResult, KeyDisposition, MutationFailure, Removal, UndoCounts, UninstallReport,
};
pub use uninstall::{replay_order, uninstall, UndoPlan, UninstallOptions, UninstallState};
