use std::path::PathBuf;
use thiserror::Error;

use crate::uninstall::UninstallState;

#[derive(Debug, Error)]
pub enum UninstallError {
    #[error("journal {} is corrupt: {reason}", .path.display())]
    CorruptJournal { path: PathBuf, reason: String },

    #[error(
        "uninstall already in progress for {} (lock {} held by {holder}); delete the lock file if no uninstall is running",
        .journal.display(),
        .lock_path.display()
    )]
    Locked {
        journal: PathBuf,
        lock_path: PathBuf,
        holder: String,
    },

    #[error("illegal uninstall state transition: {from:?} -> {to:?}")]
    InvalidTransition {
        from: UninstallState,
        to: UninstallState,
    },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl UninstallError {
    pub(crate) fn corrupt(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::CorruptJournal {
            path: path.into(),
            reason: reason.into(),
        }
    }
}
