//! Error types for container filesystem access and CA certificate installation.
//!
//! Resolver and file operations return [`FsError`], which keeps "does not exist" distinguishable
//! from real failures.  Installer operations return [`anyhow::Result`]; the one failure callers
//! must treat specially is [`CleanupError`], which means a failed install could not be rolled
//! back and the container's filesystem is in an unknown state.

use std::{io, path::PathBuf};

/// Result type alias for container filesystem operations.
pub type Result<T> = std::result::Result<T, FsError>;

/// Errors from resolving or operating on a path inside a container.
#[derive(Debug, thiserror::Error)]
pub enum FsError {
    /// Container paths are always interpreted from the container root.
    #[error("path {0:?} is not absolute")]
    NotAbsolute(PathBuf),

    /// A symlink chain exceeded [`crate::MAX_SYMLINK_DEPTH`], usually a loop.
    #[error("too many levels of symbolic links resolving {0:?}")]
    TooManyLinks(PathBuf),

    /// The path lives under a pseudo-filesystem mount (proc, tmpfs, ...) which has no host
    /// directory backing it.
    #[error("path {0:?} is under a pseudo-filesystem mount and has no host path")]
    NoHostPath(PathBuf),

    /// A host syscall on the resolved path failed.
    #[error("{op} {path:?}")]
    Io {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl FsError {
    /// Whether this error means the path (or one of its parents) does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, FsError::Io { source, .. } if source.kind() == io::ErrorKind::NotFound)
    }
}

/// Every reversal step that failed, from a [`crate::cleanup::CleanupJournal`] rollback or an
/// uninstall.
#[derive(Debug, thiserror::Error)]
#[error("{} cleanup action(s) failed: {}", .0.len(), format_all(.0))]
pub struct JournalError(pub Vec<anyhow::Error>);

fn format_all(errors: &[anyhow::Error]) -> String {
    errors
        .iter()
        .map(|e| format!("{e:#}"))
        .collect::<Vec<_>>()
        .join("; ")
}

/// An install failed and rolling it back failed too.
///
/// Unlike a plain install failure, which leaves the container exactly as it was found, this one
/// leaves it half-modified; the workload must not run in it.
#[derive(Debug, thiserror::Error)]
#[error("installing CA certificates failed ({install:#}) and so did the rollback")]
pub struct CleanupError {
    pub install: anyhow::Error,
    #[source]
    pub cleanup: JournalError,
}
