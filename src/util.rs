use std::path::{Component, Path, PathBuf};

use rustix::io::{Errno, Result as ErrnoResult};

use crate::error::{FsError, Result};

/// Lexically cleans a path the way the kernel would see it: repeated and trailing separators
/// and `.` components are dropped, and `..` removes the preceding component.  `..` at the root
/// stays at the root.  Symlinks are not consulted.
///
/// An empty result is returned as `.`.
pub fn clean_path(path: impl AsRef<Path>) -> PathBuf {
    let mut cleaned = PathBuf::new();

    for component in path.as_ref().components() {
        match component {
            Component::RootDir => cleaned.push(Component::RootDir),
            Component::CurDir | Component::Prefix(_) => {}
            Component::ParentDir => match cleaned.components().next_back() {
                Some(Component::Normal(_)) => {
                    cleaned.pop();
                }
                Some(Component::RootDir) => {}
                _ => cleaned.push(".."),
            },
            Component::Normal(name) => cleaned.push(name),
        }
    }

    if cleaned.as_os_str().is_empty() {
        cleaned.push(".");
    }
    cleaned
}

pub(crate) trait ErrnoFilter<T> {
    fn filter_errno(self, ignored: Errno) -> ErrnoResult<Option<T>>;
}

impl<T> ErrnoFilter<T> for ErrnoResult<T> {
    fn filter_errno(self, ignored: Errno) -> ErrnoResult<Option<T>> {
        match self {
            Ok(result) => Ok(Some(result)),
            Err(err) if err == ignored => Ok(None),
            Err(err) => Err(err),
        }
    }
}

/// Turns a "does not exist" failure into `Ok(None)`.
pub trait NotFoundFilter<T> {
    fn ignore_not_found(self) -> Result<Option<T>>;
}

impl<T> NotFoundFilter<T> for Result<T> {
    fn ignore_not_found(self) -> Result<Option<T>> {
        match self {
            Ok(result) => Ok(Some(result)),
            Err(err) if err.is_not_found() => Ok(None),
            Err(err) => Err(err),
        }
    }
}

pub(crate) trait IoContext<T> {
    fn with_path(self, op: &'static str, path: &Path) -> Result<T>;
}

impl<T, E: Into<std::io::Error>> IoContext<T> for std::result::Result<T, E> {
    fn with_path(self, op: &'static str, path: &Path) -> Result<T> {
        self.map_err(|source| FsError::Io {
            op,
            path: path.to_path_buf(),
            source: source.into(),
        })
    }
}
