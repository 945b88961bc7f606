use anyhow::anyhow;
use std::cmp::Reverse;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::error::UninstallError;
use crate::fs_utils::{remove_dir_if_exists, remove_file_if_exists};
use crate::journal::{read_journal, JournalEntry, SequencedEntry};
use crate::layout::is_uninstaller_copy;
use crate::lock::UninstallLock;
use crate::registry::{join_key, RegistryStore};
use crate::scope::InstallScope;
use crate::self_delete::schedule_self_delete;
use crate::types::{MutationFailure, Removal, UndoCounts, UninstallReport};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UninstallState {
    Loaded,
    ScopeKnown,
    Replaying,
    Finalizing,
    Done,
    Failed,
}

impl UninstallState {
    pub fn can_transition_to(self, next: Self) -> bool {
        match (self, next) {
            (Self::Loaded, Self::ScopeKnown)
            | (Self::ScopeKnown, Self::Replaying)
            | (Self::Replaying, Self::Finalizing)
            | (Self::Finalizing, Self::Done) => true,
            (Self::Done | Self::Failed, Self::Failed) => false,
            (_, Self::Failed) => true,
            _ => false,
        }
    }
}

#[derive(Debug)]
struct UninstallMachine {
    state: UninstallState,
}

impl UninstallMachine {
    fn new() -> Self {
        Self {
            state: UninstallState::Loaded,
        }
    }

    fn advance(&mut self, next: UninstallState) -> Result<(), UninstallError> {
        if !self.state.can_transition_to(next) {
            return Err(UninstallError::InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        debug!(from = ?self.state, to = ?next, "uninstall state transition");
        self.state = next;
        Ok(())
    }

    fn fail(&mut self) {
        if self.state.can_transition_to(UninstallState::Failed) {
            self.state = UninstallState::Failed;
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UndoPlan {
    pub scope: InstallScope,
    pub steps: Vec<SequencedEntry>,
}

impl UndoPlan {
    pub fn from_entries(
        journal: &Path,
        entries: Vec<SequencedEntry>,
    ) -> Result<Self, UninstallError> {
        let scope = match entries.first().map(|first| &first.entry) {
            Some(JournalEntry::ScopeMarker(scope)) => *scope,
            Some(_) => {
                return Err(UninstallError::corrupt(
                    journal,
                    "first entry must be a scope marker",
                ))
            }
            None => return Err(UninstallError::corrupt(journal, "journal contains no entries")),
        };
        Ok(Self {
            scope,
            steps: replay_order(entries),
        })
    }
}

pub fn replay_order(entries: Vec<SequencedEntry>) -> Vec<SequencedEntry> {
    let mut steps = entries
        .into_iter()
        .filter(|step| !matches!(step.entry, JournalEntry::ScopeMarker(_)))
        .collect::<Vec<_>>();
    steps.sort_by_key(|step| (Reverse(step.entry.priority_code()), Reverse(step.position)));
    steps
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UninstallOptions {
    pub self_exe: Option<PathBuf>,
    pub keep_self: bool,
}

pub fn uninstall(
    journal: &Path,
    store: &dyn RegistryStore,
    options: &UninstallOptions,
) -> Result<UninstallReport, UninstallError> {
    read_journal(journal)?;
    let lock = UninstallLock::acquire(journal)?;
    let mut machine = UninstallMachine::new();

    let plan = match read_journal(journal).and_then(|entries| UndoPlan::from_entries(journal, entries)) {
        Ok(plan) => plan,
        Err(err) => {
            machine.fail();
            return Err(err);
        }
    };
    machine.advance(UninstallState::ScopeKnown)?;
    info!(
        journal = %journal.display(),
        hive = plan.scope.hive_name(),
        steps = plan.steps.len(),
        "uninstalling"
    );

    machine.advance(UninstallState::Replaying)?;
    let mut undone = UndoCounts::default();
    let mut failures = Vec::new();
    for step in &plan.steps {
        replay_step(step, store, &mut undone, &mut failures);
    }

    machine.advance(UninstallState::Finalizing)?;
    let journal_removed = match remove_file_if_exists(journal) {
        Ok(_) => true,
        Err(err) => {
            let err = anyhow::Error::new(err)
                .context(format!("failed to delete journal: {}", journal.display()));
            record_failure(&mut failures, "delete journal", journal.display().to_string(), err);
            false
        }
    };
    drop(lock);

    let mut self_removal = None;
    if let Some(exe) = options
        .self_exe
        .as_deref()
        .filter(|exe| !options.keep_self && is_uninstaller_copy(exe, journal))
    {
        match schedule_self_delete(exe) {
            Ok(outcome) => self_removal = Some(outcome),
            Err(err) => {
                record_failure(&mut failures, "remove uninstaller", exe.display().to_string(), err)
            }
        }
    }
    machine.advance(UninstallState::Done)?;

    Ok(UninstallReport {
        journal_path: journal.to_path_buf(),
        scope: plan.scope,
        undone,
        failures,
        journal_removed,
        self_removal,
    })
}

fn record_failure(
    failures: &mut Vec<MutationFailure>,
    action: &str,
    target: String,
    err: anyhow::Error,
) {
    let failure = MutationFailure::new(action, target, &err);
    warn!(action, target = %failure.target, error = %failure.message, "undo step failed");
    failures.push(failure);
}

fn replay_step(
    step: &SequencedEntry,
    store: &dyn RegistryStore,
    undone: &mut UndoCounts,
    failures: &mut Vec<MutationFailure>,
) {
    let hive = step.scope.hive_name();
    let (action, target, outcome) = match &step.entry {
        JournalEntry::ScopeMarker(_) => return,
        JournalEntry::RegistryValueSet { key, name, .. } => (
            "delete registry value",
            format!("{hive}\\{key}\\{name}"),
            store.delete_value(step.scope, key, name),
        ),
        JournalEntry::RegistryKeyCreated { parent, subkey } => {
            let key = join_key(parent, subkey);
            let outcome = store.delete_key(step.scope, &key);
            ("delete registry key", format!("{hive}\\{key}"), outcome)
        }
        JournalEntry::FileCreated(path) | JournalEntry::FileOverwritten(path) => (
            "delete file",
            path.display().to_string(),
            remove_file_if_exists(path)
                .map_err(|err| anyhow!("failed to delete file {}: {err}", path.display())),
        ),
        JournalEntry::DirectoryCreated(path) => (
            "remove directory",
            path.display().to_string(),
            remove_dir_if_exists(path)
                .map_err(|err| anyhow!("failed to remove directory {}: {err}", path.display())),
        ),
    };

    match outcome {
        Ok(Removal::Removed) => {
            debug!(action, target = %target, "undone");
            match step.entry {
                JournalEntry::RegistryValueSet { .. } => undone.registry_values += 1,
                JournalEntry::RegistryKeyCreated { .. } => undone.registry_keys += 1,
                JournalEntry::FileCreated(_) | JournalEntry::FileOverwritten(_) => undone.files += 1,
                JournalEntry::DirectoryCreated(_) => undone.directories += 1,
                JournalEntry::ScopeMarker(_) => {}
            }
        }
        Ok(Removal::Missing) => {
            debug!(action, target = %target, "already gone");
            undone.already_missing += 1;
        }
        Err(err) => record_failure(failures, action, target, err),
    }
}
