//! Host-side view of a container's filesystem.
//!
//! A container's filesystem is a composition of its rootfs and every mount declared in its OCI
//! runtime spec, none of which is visible in the engine's own mount namespace.  Rather than
//! setting up (and tearing down) all of those mounts, [`ContainerFs`] translates a path as the
//! container sees it into the path on the host that backs it, walking the path one component at
//! a time and following symlinks against whichever mount actually holds them.
//!
//! The file operations on [`ContainerFs`] are thin wrappers: resolve, then call into the host OS.
//! They are meant for a handful of small reads and writes per container, not for bulk I/O.

use std::{
    collections::BTreeSet,
    ffi::OsStr,
    fs::{self, DirBuilder, File, Metadata, OpenOptions},
    io::{BufReader, Write},
    os::unix::{
        ffi::OsStrExt,
        fs::{DirBuilderExt, OpenOptionsExt, PermissionsExt},
    },
    path::{Component, Path, PathBuf},
    time::SystemTime,
};

use anyhow::{bail, Context};
use log::{debug, trace};
use oci_spec::runtime::Spec;
use rustix::{fs::FileType, io::Errno};

use crate::{
    certs::{self, CaDirContents},
    error::{FsError, Result},
    os_release::os_release_matches,
    util::{clean_path, ErrnoFilter, IoContext, NotFoundFilter},
    MAX_SYMLINK_DEPTH,
};

/// Used by [`ContainerFs::look_path`] when the container's process environment has no `PATH`.
pub const DEFAULT_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// Mount types with no host directory behind them.  Nothing below one of these can be resolved.
pub fn is_pseudo_fs(mount_type: &str) -> bool {
    matches!(
        mount_type,
        "proc" | "sysfs" | "tmpfs" | "devpts" | "shm" | "mqueue" | "cgroup" | "cgroup2"
    )
}

/// One filesystem visible in the container.
#[derive(Debug, Clone)]
pub struct ContainerMount {
    /// The OCI mount type, if any.  The rootfs has none.
    pub typ: Option<String>,
    /// Host source of the mount, with symlinks resolved.  Meaningless for pseudo-filesystems.
    pub source: PathBuf,
    /// The declared mount destination.
    pub destination: PathBuf,
    /// The destination with any symlinks in its parent directories resolved.
    pub resolved_destination: PathBuf,
}

impl ContainerMount {
    fn is_pseudo_fs(&self) -> bool {
        self.typ.as_deref().is_some_and(is_pseudo_fs)
    }
}

/// The outcome of resolving a container path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedPath {
    /// The path inside the container with symlinks resolved.
    pub container: PathBuf,
    /// The path on the host backing it, or `None` under a pseudo-filesystem mount.
    pub host: Option<PathBuf>,
}

/// A read-mostly, vfs-like view of one container's filesystem from the host.
///
/// The mount table is computed once at construction and never changes, so a `ContainerFs` can
/// be shared between threads for concurrent read-only use.
#[derive(Debug)]
pub struct ContainerFs {
    mounts: Vec<ContainerMount>,
    env: Vec<String>,
}

impl ContainerFs {
    /// Builds the mount table for the container described by `spec`.
    ///
    /// The rootfs (`root.path`, which must be absolute here) becomes mount 0 at `/`.  Every other
    /// mount's host source is resolved through host symlinks once, and its destination is
    /// resolved through the container's own symlinks against the mounts declared before it.
    pub fn new(spec: &Spec) -> anyhow::Result<Self> {
        let Some(root) = spec.root() else {
            bail!("OCI spec has no root filesystem");
        };
        let root_path = root.path();
        if !root_path.is_absolute() {
            bail!("rootfs path {root_path:?} is not absolute");
        }

        let env = spec
            .process()
            .as_ref()
            .and_then(|process| process.env().clone())
            .unwrap_or_default();

        let mut ctr_fs = ContainerFs {
            mounts: vec![ContainerMount {
                typ: None,
                source: root_path.clone(),
                destination: PathBuf::from("/"),
                resolved_destination: PathBuf::from("/"),
            }],
            env,
        };

        for mount in spec.mounts().iter().flatten() {
            let typ = mount.typ().clone();
            let source = match (typ.as_deref().is_some_and(is_pseudo_fs), mount.source()) {
                (true, source) => source.clone().unwrap_or_default(),
                (false, Some(source)) => fs::canonicalize(source)
                    .with_context(|| format!("Resolving mount source {source:?}"))?,
                (false, None) => bail!("mount at {:?} has no source", mount.destination()),
            };
            let resolved_destination = ctr_fs
                .mount_point_path(mount.destination())
                .with_context(|| format!("Resolving mount destination {:?}", mount.destination()))?;
            trace!("mount {source:?} at {resolved_destination:?} ({typ:?})");

            ctr_fs.mounts.push(ContainerMount {
                typ,
                source,
                destination: mount.destination().clone(),
                resolved_destination,
            });
        }

        Ok(ctr_fs)
    }

    /// The mount table, rootfs first, in declaration order.
    pub fn mounts(&self) -> &[ContainerMount] {
        &self.mounts
    }

    /// Finds the mount holding `container_path` (which must be clean and free of symlinks) and
    /// the path relative to that mount's root.  Later mounts shadow earlier ones.
    fn mount_for<'a>(&self, container_path: &'a Path) -> (&ContainerMount, &'a Path) {
        self.mounts
            .iter()
            .rev()
            .find_map(|mount| {
                container_path
                    .strip_prefix(&mount.resolved_destination)
                    .ok()
                    .map(|rel| (mount, rel))
            })
            // mount 0 is at "/", which contains every absolute path
            .unwrap_or((&self.mounts[0], container_path))
    }

    /// Resolves `path` as the container would, returning both the container-side path with
    /// symlinks resolved and the host path backing it.
    ///
    /// If `resolve_base` is false a symlink in the final component is left alone, which is what
    /// lstat, readlink, symlink creation and removal want.  Missing components end resolution
    /// early: nothing past them can be a symlink.  `link_depth` counts the symlinks followed so
    /// far; more than [`MAX_SYMLINK_DEPTH`] fails with [`FsError::TooManyLinks`].
    pub fn resolve_path(
        &self,
        path: &Path,
        resolve_base: bool,
        link_depth: usize,
    ) -> Result<ResolvedPath> {
        if link_depth > MAX_SYMLINK_DEPTH {
            return Err(FsError::TooManyLinks(path.to_path_buf()));
        }
        if !path.is_absolute() {
            return Err(FsError::NotAbsolute(path.to_path_buf()));
        }

        let parts: Vec<Component> = path
            .components()
            .filter(|c| !matches!(c, Component::RootDir))
            .collect();

        // invariant: cur_path never contains symlinks at the start of an iteration
        let mut cur_path = PathBuf::from("/");
        let (root_mount, _) = self.mount_for(&cur_path);
        let mut host_path = match root_mount.is_pseudo_fs() {
            true => None,
            false => Some(root_mount.source.clone()),
        };

        for (i, part) in parts.iter().enumerate() {
            cur_path = clean_path(cur_path.join(part));
            let rest: PathBuf = parts[i + 1..].iter().collect();

            let (mount, rel_path) = self.mount_for(&cur_path);
            if mount.is_pseudo_fs() {
                return Ok(ResolvedPath {
                    container: clean_path(cur_path.join(&rest)),
                    host: None,
                });
            }

            let src_path = clean_path(mount.source.join(rel_path));
            if !resolve_base && rest.as_os_str().is_empty() {
                host_path = Some(src_path);
                break;
            }

            let Some(stat) = rustix::fs::lstat(&src_path)
                .filter_errno(Errno::NOENT)
                .with_path("lstat", &src_path)?
            else {
                // cannot be any symlinks to resolve anymore
                return Ok(ResolvedPath {
                    container: clean_path(cur_path.join(&rest)),
                    host: Some(clean_path(src_path.join(&rest))),
                });
            };

            if FileType::from_raw_mode(stat.st_mode) == FileType::Symlink {
                let target = rustix::fs::readlink(&src_path, Vec::new())
                    .with_path("readlink", &src_path)?;
                let target = Path::new(OsStr::from_bytes(target.as_bytes()));
                trace!("{cur_path:?} -> {target:?} (depth {link_depth})");

                let next = if target.is_absolute() {
                    target.join(&rest)
                } else {
                    let parent = cur_path.parent().unwrap_or(Path::new("/"));
                    parent.join(target).join(&rest)
                };
                return self.resolve_path(&clean_path(next), resolve_base, link_depth + 1);
            }

            host_path = Some(src_path);
        }

        Ok(ResolvedPath {
            container: cur_path,
            host: host_path,
        })
    }

    /// The container path for `path` with every symlink resolved, including the final component.
    pub fn evaluate_symlinks(&self, path: impl AsRef<Path>) -> Result<PathBuf> {
        Ok(self.resolve_path(path.as_ref(), true, 0)?.container)
    }

    /// The container path for `path` with symlinks resolved in its parent directories only.
    ///
    /// This is how mount destinations are interpreted: the mount covers the final component
    /// itself, so it is never followed.
    pub fn mount_point_path(&self, path: impl AsRef<Path>) -> Result<PathBuf> {
        Ok(self.resolve_path(path.as_ref(), false, 0)?.container)
    }

    /// The host path backing `path`, following a symlink in the final component too.
    pub fn host_path(&self, path: impl AsRef<Path>) -> Result<PathBuf> {
        self.host_path_impl(path.as_ref(), true)
    }

    /// The host path backing `path` itself, leaving a symlink in the final component alone.
    pub fn host_path_nofollow(&self, path: impl AsRef<Path>) -> Result<PathBuf> {
        self.host_path_impl(path.as_ref(), false)
    }

    fn host_path_impl(&self, path: &Path, resolve_base: bool) -> Result<PathBuf> {
        let resolved = self.resolve_path(path, resolve_base, 0)?;
        resolved
            .host
            .ok_or_else(|| FsError::NoHostPath(path.to_path_buf()))
    }

    pub fn open(&self, path: impl AsRef<Path>) -> Result<File> {
        let host = self.host_path(path)?;
        File::open(&host).with_path("open", &host)
    }

    /// Opens `path` for appending, creating it with `mode` if needed.
    pub fn open_append(&self, path: impl AsRef<Path>, mode: u32) -> Result<File> {
        let host = self.host_path(path)?;
        OpenOptions::new()
            .create(true)
            .append(true)
            .mode(mode)
            .open(&host)
            .with_path("open", &host)
    }

    pub fn read_file(&self, path: impl AsRef<Path>) -> Result<Vec<u8>> {
        let host = self.host_path(path)?;
        fs::read(&host).with_path("read", &host)
    }

    /// Replaces the contents of `path`, creating it with `mode` if it doesn't exist.
    pub fn write_file(&self, path: impl AsRef<Path>, data: &[u8], mode: u32) -> Result<()> {
        let host = self.host_path(path)?;
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(mode)
            .open(&host)
            .with_path("open", &host)?;
        file.write_all(data).with_path("write", &host)
    }

    pub fn stat(&self, path: impl AsRef<Path>) -> Result<Metadata> {
        let host = self.host_path(path)?;
        fs::metadata(&host).with_path("stat", &host)
    }

    pub fn lstat(&self, path: impl AsRef<Path>) -> Result<Metadata> {
        let host = self.host_path_nofollow(path)?;
        fs::symlink_metadata(&host).with_path("lstat", &host)
    }

    pub fn readlink(&self, path: impl AsRef<Path>) -> Result<PathBuf> {
        let host = self.host_path_nofollow(path)?;
        fs::read_link(&host).with_path("readlink", &host)
    }

    /// Creates a symlink at `link` pointing to `target`.  The target is stored verbatim and is
    /// interpreted inside the container.
    pub fn symlink(&self, target: impl AsRef<Path>, link: impl AsRef<Path>) -> Result<()> {
        let host = self.host_path_nofollow(link)?;
        std::os::unix::fs::symlink(target, &host).with_path("symlink", &host)
    }

    /// Removes a file, symlink or empty directory.
    pub fn remove(&self, path: impl AsRef<Path>) -> Result<()> {
        let host = self.host_path_nofollow(path)?;
        let meta = fs::symlink_metadata(&host).with_path("lstat", &host)?;
        if meta.is_dir() {
            fs::remove_dir(&host).with_path("rmdir", &host)
        } else {
            fs::remove_file(&host).with_path("unlink", &host)
        }
    }

    /// Removes `path` and, if it is a directory, everything below it.
    pub fn remove_all(&self, path: impl AsRef<Path>) -> Result<()> {
        let host = self.host_path_nofollow(path)?;
        let meta = fs::symlink_metadata(&host).with_path("lstat", &host)?;
        if meta.is_dir() {
            fs::remove_dir_all(&host).with_path("remove tree", &host)
        } else {
            fs::remove_file(&host).with_path("unlink", &host)
        }
    }

    /// Like `mkdir -p`, but returns the uppermost directory it had to create, if any.
    pub fn mkdir_all(&self, path: impl AsRef<Path>, mode: u32) -> Result<Option<PathBuf>> {
        let path = path.as_ref();
        let mut created = None;
        let mut cur_path = PathBuf::from("/");

        for part in path.components() {
            let Component::Normal(part) = part else {
                continue;
            };
            cur_path.push(part);

            let host = self.host_path(&cur_path)?;
            // purposely follow symlinks here
            match fs::metadata(&host) {
                Ok(meta) if meta.is_dir() => {}
                Ok(meta) => {
                    return Err(FsError::Io {
                        op: "mkdir",
                        path: cur_path,
                        source: std::io::Error::other(format!(
                            "non-directory ({:?}) in path",
                            meta.file_type()
                        )),
                    });
                }
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                    DirBuilder::new()
                        .mode(mode)
                        .create(&host)
                        .with_path("mkdir", &host)?;
                    if created.is_none() {
                        debug!("created directory {cur_path:?}");
                        created = Some(cur_path.clone());
                    }
                }
                Err(err) => return Err(err).with_path("stat", &host),
            }
        }

        Ok(created)
    }

    /// The names of the entries in a directory, sorted.
    pub fn read_dir(&self, path: impl AsRef<Path>) -> Result<Vec<fs::DirEntry>> {
        let host = self.host_path(path)?;
        let mut entries = fs::read_dir(&host)
            .with_path("readdir", &host)?
            .collect::<std::io::Result<Vec<_>>>()
            .with_path("readdir", &host)?;
        entries.sort_by_key(|entry| entry.file_name());
        Ok(entries)
    }

    /// The modification time of `path` itself (not of a symlink's target).
    pub fn mtime(&self, path: impl AsRef<Path>) -> Result<SystemTime> {
        let host = self.host_path_nofollow(path)?;
        fs::symlink_metadata(&host)
            .and_then(|meta| meta.modified())
            .with_path("lstat", &host)
    }

    pub fn set_mtime(&self, path: impl AsRef<Path>, mtime: SystemTime) -> Result<()> {
        let host = self.host_path(path)?;
        let file = OpenOptions::new()
            .write(true)
            .open(&host)
            .with_path("open", &host)?;
        file.set_modified(mtime).with_path("utimens", &host)
    }

    pub fn path_exists(&self, path: impl AsRef<Path>) -> Result<bool> {
        Ok(self.stat(path).ignore_not_found()?.is_some())
    }

    pub fn any_path_exists<P: AsRef<Path>>(&self, paths: &[P]) -> Result<bool> {
        for path in paths {
            if self.path_exists(path)? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// A directory that doesn't exist counts as empty.
    pub fn dir_is_empty(&self, path: impl AsRef<Path>) -> Result<bool> {
        Ok(self
            .read_dir(path)
            .ignore_not_found()?
            .map_or(true, |entries| entries.is_empty()))
    }

    /// Searches the container's `PATH` for an executable named `cmd`, like `which`.
    ///
    /// Returns `Ok(None)` when there is no such command; errors are reserved for failures to
    /// look.  Absolute commands are returned unchecked.
    pub fn look_path(&self, cmd: &str) -> Result<Option<PathBuf>> {
        if Path::new(cmd).is_absolute() {
            return Ok(Some(PathBuf::from(cmd)));
        }

        // TODO: non-root users may also need the sbin directories appended here
        let path_env = self
            .env
            .iter()
            .find_map(|var| var.strip_prefix("PATH="))
            .filter(|value| !value.is_empty())
            .unwrap_or(DEFAULT_PATH);

        for dir in path_env.split(':').filter(|dir| !dir.is_empty()) {
            let candidate = Path::new(dir).join(cmd);
            if !candidate.is_absolute() {
                continue;
            }
            let meta = match self.stat(&candidate) {
                Ok(meta) => meta,
                Err(err) if err.is_not_found() => continue,
                Err(FsError::NoHostPath(_)) => continue,
                Err(err) => return Err(err),
            };
            if meta.is_file() && meta.permissions().mode() & 0o111 != 0 {
                return Ok(Some(candidate));
            }
        }

        Ok(None)
    }

    /// Whether `/etc/os-release` has an `ID` in `ids` or an `ID_LIKE` word in `id_likes`.
    /// A missing file matches nothing.
    pub fn os_release_contains(&self, ids: &[&str], id_likes: &[&str]) -> Result<bool> {
        let path = Path::new("/etc/os-release");
        let Some(file) = self.open(path).ignore_not_found()? else {
            return Ok(false);
        };
        os_release_matches(BufReader::new(file), ids, id_likes).with_path("read", path)
    }

    /// The set of certificates in a CA bundle, as normalized PEM blocks.
    pub fn read_ca_bundle(&self, path: impl AsRef<Path>) -> Result<BTreeSet<String>> {
        let data = self.read_file(path)?;
        Ok(certs::parse_bundle(&data))
    }

    /// Reads a custom CA directory inside the container.
    pub fn read_custom_ca_dir(&self, path: impl AsRef<Path>) -> Result<CaDirContents> {
        let host = self.host_path(path)?;
        CaDirContents::read(&host).with_path("read CA dir", &host)
    }
}
