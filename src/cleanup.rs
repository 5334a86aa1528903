//! The cleanup journal that makes a multi-step install all-or-nothing.
//!
//! Every mutation an install makes is paired with a [`CleanupAction`] that undoes it, recorded
//! right after the mutation succeeds.  If a later step fails, [`CleanupJournal::run`] undoes
//! everything in reverse.  One action may be placed in the final slot with
//! [`CleanupJournal::prepend`]; it runs after every appended action, which is where the bundle
//! regeneration command belongs because it reads the directory the other actions restore.

use std::{fmt, path::PathBuf, time::SystemTime};

use anyhow::Context;
use log::{debug, warn};

use crate::{
    containerfs::ContainerFs, error::JournalError, exec::ContainerExec, util::NotFoundFilter,
};

/// One reversal step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CleanupAction {
    /// Remove a file, symlink or empty directory.  Already gone is fine.
    Remove(PathBuf),
    /// Remove a directory tree created by the install.  Already gone is fine.
    RemoveAll(PathBuf),
    /// Put a file's previous contents (and optionally mtime) back.
    RestoreFile {
        path: PathBuf,
        contents: Vec<u8>,
        mtime: Option<SystemTime>,
    },
    /// Run a command inside the container.
    RunCommand(Vec<String>),
}

impl fmt::Display for CleanupAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CleanupAction::Remove(path) => write!(f, "remove {path:?}"),
            CleanupAction::RemoveAll(path) => write!(f, "remove tree {path:?}"),
            CleanupAction::RestoreFile { path, contents, .. } => {
                write!(f, "restore {} bytes to {path:?}", contents.len())
            }
            CleanupAction::RunCommand(args) => write!(f, "run {args:?}"),
        }
    }
}

impl CleanupAction {
    async fn run(&self, ctr_fs: &ContainerFs, exec: &impl ContainerExec) -> anyhow::Result<()> {
        match self {
            CleanupAction::Remove(path) => {
                ctr_fs.remove(path).ignore_not_found()?;
            }
            CleanupAction::RemoveAll(path) => {
                ctr_fs.remove_all(path).ignore_not_found()?;
            }
            CleanupAction::RestoreFile {
                path,
                contents,
                mtime,
            } => {
                ctr_fs.write_file(path, contents, 0o644)?;
                if let Some(mtime) = mtime {
                    ctr_fs.set_mtime(path, *mtime)?;
                }
            }
            CleanupAction::RunCommand(args) => exec.exec(args).await?,
        }
        Ok(())
    }
}

/// An ordered list of reversal actions.
#[derive(Debug, Default)]
pub struct CleanupJournal {
    actions: Vec<CleanupAction>,
    last: Option<CleanupAction>,
}

impl CleanupJournal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records an action.  Later appends run earlier.
    pub fn append(&mut self, action: CleanupAction) {
        debug!("journal: {action}");
        self.actions.push(action);
    }

    /// Records the action that must run after all others.  There is only one such slot.
    pub fn prepend(&mut self, action: CleanupAction) {
        debug!("journal (last): {action}");
        debug_assert!(self.last.is_none(), "journal already has a final action");
        self.last = Some(action);
    }

    pub fn len(&self) -> usize {
        self.actions.len() + usize::from(self.last.is_some())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The actions in the order [`Self::run`] will execute them.
    pub fn iter(&self) -> impl Iterator<Item = &CleanupAction> {
        self.actions.iter().rev().chain(self.last.iter())
    }

    /// Runs every recorded action, continuing past failures, and empties the journal.
    ///
    /// All failures are returned together.
    pub async fn run(
        &mut self,
        ctr_fs: &ContainerFs,
        exec: &impl ContainerExec,
    ) -> Result<(), JournalError> {
        let mut errors = vec![];

        let actions = std::mem::take(&mut self.actions);
        let last = self.last.take();
        for action in actions.iter().rev().chain(last.iter()) {
            debug!("cleanup: {action}");
            if let Err(err) = action
                .run(ctr_fs, exec)
                .await
                .with_context(|| format!("Failed to {action}"))
            {
                warn!("{err:#}");
                errors.push(err);
            }
        }

        match errors.is_empty() {
            true => Ok(()),
            false => Err(JournalError(errors)),
        }
    }
}
