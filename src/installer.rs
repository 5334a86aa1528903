//! Installing host CA certificates into a container, and taking them out again.
//!
//! [`new_installer`] reads the engine's custom CA directory and, if there is anything to inject,
//! detects which [`Distro`] family the container belongs to.  The resulting [`Installer`] is used
//! as a bracket around the container's workload:
//!
//! ```text
//! install()   -> snapshot, write certificates, regenerate the bundle
//! (workload runs)
//! uninstall() -> remove what install() wrote, regenerate or strip the bundle
//! ```
//!
//! `install()` is all-or-nothing: every mutation is journaled and a failure rolls the container
//! back.  If the rollback fails too, the error is a [`CleanupError`].  `uninstall()` is
//! best-effort, since the workload may have changed anything in between.

use std::{
    collections::{BTreeMap, BTreeSet},
    io::Write,
    path::{Path, PathBuf},
    sync::Arc,
    time::SystemTime,
};

use anyhow::{bail, Context, Result};
use fn_error_context::context;
use log::{debug, info, warn};
use oci_spec::runtime::Spec;
use tokio::{sync::mpsc, task::JoinSet};

use crate::{
    certs::{self, CaDirContents},
    cleanup::{CleanupAction, CleanupJournal},
    containerfs::ContainerFs,
    distro::{Distro, DistroProfile},
    error::{CleanupError, JournalError},
    exec::ContainerExec,
    util::NotFoundFilter,
    ENGINE_CUSTOM_CA_CERTS_DIR,
};

/// Knobs for [`new_installer`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallerOptions {
    /// The host directory holding the certificates to inject.
    pub host_certs_dir: PathBuf,
}

impl Default for InstallerOptions {
    fn default() -> Self {
        InstallerOptions {
            host_certs_dir: PathBuf::from(ENGINE_CUSTOM_CA_CERTS_DIR),
        }
    }
}

/// Figures out which distro family the container belongs to.
///
/// Every profile's detector runs concurrently on the blocking pool.  The first one to match
/// wins; the others are left to finish in the background and their results are dropped.  Any
/// detector error fails the whole detection.
#[context("cannot determine CA install strategy")]
pub async fn detect(ctr_fs: &Arc<ContainerFs>) -> Result<Option<Distro>> {
    let (tx, mut rx) = mpsc::channel(1);
    let mut set = JoinSet::new();

    for distro in Distro::ALL {
        let ctr_fs = Arc::clone(ctr_fs);
        let tx = tx.clone();
        set.spawn_blocking(move || -> Result<()> {
            let matched = distro
                .profile()
                .detect(&ctr_fs)
                .with_context(|| format!("Detecting {distro}"))?;
            log::trace!("{distro}: matched={matched}");
            if matched {
                // a full slot means someone else already won
                let _ = tx.try_send(distro);
            }
            Ok(())
        });
    }
    drop(tx);

    while let Some(result) = set.join_next().await {
        result??;
        if let Ok(distro) = rx.try_recv() {
            set.detach_all();
            return Ok(Some(distro));
        }
    }

    // the last detector may have matched after our previous check
    Ok(rx.try_recv().ok())
}

/// Builds the installer for the container described by `spec`.
///
/// If the host directory is empty (or missing) this returns [`Installer::NoOp`] without looking
/// at the container at all.  The same happens when no distro family matches.
#[context("Preparing CA certificate installer")]
pub async fn new_installer<E: ContainerExec>(
    spec: &Spec,
    exec: E,
    opts: &InstallerOptions,
) -> Result<Installer<E>> {
    let host_certs = CaDirContents::read(&opts.host_certs_dir)
        .with_context(|| format!("Reading {:?}", opts.host_certs_dir))?;
    if host_certs.is_empty() {
        debug!("no custom CA certificates in {:?}", opts.host_certs_dir);
        return Ok(Installer::NoOp);
    }

    let ctr_fs = Arc::new(ContainerFs::new(spec)?);
    let Some(distro) = detect(&ctr_fs).await? else {
        info!("container has no known CA trust layout; not installing CA certificates");
        return Ok(Installer::NoOp);
    };
    debug!("detected {distro}");

    Ok(Installer::Distro(DistroInstaller::new(
        ctr_fs, distro, host_certs, exec,
    )?))
}

/// Installs and uninstalls CA certificates for one container.
#[derive(Debug)]
pub enum Installer<E> {
    /// Nothing to inject, or no way to do it.
    NoOp,
    Distro(DistroInstaller<E>),
}

impl<E: ContainerExec> Installer<E> {
    pub async fn install(&mut self) -> Result<()> {
        match self {
            Installer::NoOp => Ok(()),
            Installer::Distro(installer) => installer.install().await,
        }
    }

    pub async fn uninstall(&mut self) -> Result<()> {
        match self {
            Installer::NoOp => Ok(()),
            Installer::Distro(installer) => installer.uninstall().await,
        }
    }

    pub fn distro(&self) -> Option<Distro> {
        match self {
            Installer::NoOp => None,
            Installer::Distro(installer) => Some(installer.distro),
        }
    }

    pub fn is_noop(&self) -> bool {
        matches!(self, Installer::NoOp)
    }
}

/// Where a [`DistroInstaller`] is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallPhase {
    NotStarted,
    Snapshotting,
    Writing,
    BundleUpdating,
    /// Install succeeded; uninstall is possible.
    Done,
    /// Install failed and was rolled back (possibly only partly).
    RolledBack,
    Uninstalled,
}

// Everything install() learned or changed, kept for uninstall().
#[derive(Debug, Default)]
struct InstallState {
    update_command_existed: bool,

    bundle_existed: bool,
    original_bundle_mtime: Option<SystemTime>,
    // only set on the manual path
    original_bundle: Option<Vec<u8>>,
    installed_bundle: Option<Vec<u8>>,
    installed_bundle_mtime: Option<SystemTime>,
    created_bundle_parent: Option<PathBuf>,

    ca_dir_existed: bool,
    created_ca_dir: Option<PathBuf>,

    existing_bundle_certs: BTreeSet<String>,
    existing_ca_dir: CaDirContents,

    // name -> content
    installed_certs: BTreeMap<String, String>,
    installed_symlinks: Vec<String>,
    // blocks that were not in the bundle before, i.e. exactly what to strip again
    appended_bundle_certs: BTreeSet<String>,
}

/// The installer for a container whose distro family is known.
#[derive(Debug)]
pub struct DistroInstaller<E> {
    ctr_fs: Arc<ContainerFs>,
    distro: Distro,
    exec: E,
    host_certs: CaDirContents,
    /// The profile's bundle path with symlinks resolved.
    bundle_path: PathBuf,
    phase: InstallPhase,
    state: InstallState,
}

impl<E: ContainerExec> DistroInstaller<E> {
    pub fn new(
        ctr_fs: Arc<ContainerFs>,
        distro: Distro,
        host_certs: CaDirContents,
        exec: E,
    ) -> Result<Self> {
        let profile = distro.profile();
        let bundle_path = ctr_fs
            .evaluate_symlinks(profile.bundle_path)
            .with_context(|| format!("Resolving {}", profile.bundle_path))?;
        if bundle_path != Path::new(profile.bundle_path) {
            debug!("{} resolves to {bundle_path:?}", profile.bundle_path);
        }

        Ok(DistroInstaller {
            ctr_fs,
            distro,
            exec,
            host_certs,
            bundle_path,
            phase: InstallPhase::NotStarted,
            state: InstallState::default(),
        })
    }

    pub fn distro(&self) -> Distro {
        self.distro
    }

    pub fn phase(&self) -> InstallPhase {
        self.phase
    }

    pub fn bundle_path(&self) -> &Path {
        &self.bundle_path
    }

    fn profile(&self) -> &'static DistroProfile {
        self.distro.profile()
    }

    fn ca_dir(&self) -> &'static Path {
        Path::new(self.profile().custom_ca_cert_dir)
    }

    fn update_command_exists(&self) -> Result<bool> {
        let cmd = self.profile().update_command[0];
        let found = self
            .ctr_fs
            .look_path(cmd)
            .with_context(|| format!("Looking for {cmd}"))?;
        Ok(found.is_some())
    }

    /// Injects the host certificates.  Can only be called once.
    ///
    /// On failure the container is rolled back to how it was found; if that fails too the error
    /// is a [`CleanupError`].
    pub async fn install(&mut self) -> Result<()> {
        if self.phase != InstallPhase::NotStarted {
            bail!("CA certificate install already attempted ({:?})", self.phase);
        }

        let mut journal = CleanupJournal::new();
        match self.install_steps(&mut journal).await {
            Ok(()) => {
                self.phase = InstallPhase::Done;
                info!(
                    "installed {} CA certificate(s) and {} link(s) for {}",
                    self.state.installed_certs.len(),
                    self.state.installed_symlinks.len(),
                    self.distro
                );
                Ok(())
            }
            Err(err) => {
                warn!(
                    "installing CA certificates failed in phase {:?}, rolling back {} action(s): {err:#}",
                    self.phase,
                    journal.len()
                );
                let rollback = journal.run(&self.ctr_fs, &self.exec).await;
                self.phase = InstallPhase::RolledBack;
                match rollback {
                    Ok(()) => Err(err),
                    Err(cleanup) => Err(CleanupError {
                        install: err,
                        cleanup,
                    }
                    .into()),
                }
            }
        }
    }

    async fn install_steps(&mut self, journal: &mut CleanupJournal) -> Result<()> {
        self.phase = InstallPhase::Snapshotting;
        self.snapshot(journal)?;

        self.phase = InstallPhase::Writing;
        self.write_ca_dir(journal)?;

        self.phase = InstallPhase::BundleUpdating;
        if self.state.update_command_existed {
            let args = self.profile().update_args();
            journal.prepend(CleanupAction::RunCommand(args.clone()));
            self.exec
                .exec(&args)
                .await
                .with_context(|| format!("Running {args:?}"))?;
            self.state.installed_bundle_mtime =
                self.ctr_fs.mtime(&self.bundle_path).ignore_not_found()?;
        } else {
            self.append_to_bundle(journal)?;
        }

        Ok(())
    }

    fn snapshot(&mut self, journal: &mut CleanupJournal) -> Result<()> {
        let update_command_existed = self.update_command_exists()?;
        let ctr_fs = Arc::clone(&self.ctr_fs);
        let ca_dir = self.ca_dir();
        let state = &mut self.state;

        state.update_command_existed = update_command_existed;

        state.bundle_existed = ctr_fs.path_exists(&self.bundle_path)?;
        if state.bundle_existed {
            state.existing_bundle_certs = ctr_fs.read_ca_bundle(&self.bundle_path)?;
            state.original_bundle_mtime = Some(ctr_fs.mtime(&self.bundle_path)?);
        }

        state.ca_dir_existed = ctr_fs.path_exists(ca_dir)?;
        if state.ca_dir_existed {
            state.existing_ca_dir = ctr_fs.read_custom_ca_dir(ca_dir)?;
        } else {
            state.created_ca_dir = ctr_fs.mkdir_all(ca_dir, 0o755)?;
            if let Some(created) = &state.created_ca_dir {
                journal.append(CleanupAction::RemoveAll(created.clone()));
            }
        }

        debug!(
            "snapshot: bundle {} ({} certs), {ca_dir:?} {} ({} entries), {:?} {}",
            if state.bundle_existed { "exists" } else { "missing" },
            state.existing_bundle_certs.len(),
            if state.ca_dir_existed { "exists" } else { "created" },
            state.existing_ca_dir.certs.len() + state.existing_ca_dir.symlinks.len(),
            self.distro.profile().update_command,
            if state.update_command_existed { "found" } else { "missing" },
        );
        Ok(())
    }

    fn write_ca_dir(&mut self, journal: &mut CleanupJournal) -> Result<()> {
        let ctr_fs = &self.ctr_fs;
        let ca_dir = self.ca_dir();

        for (name, target) in &self.host_certs.symlinks {
            let path = ca_dir.join(name);
            if ctr_fs.lstat(&path).ignore_not_found()?.is_some() {
                debug!("{path:?} already exists, leaving it alone");
                continue;
            }
            ctr_fs.symlink(target, &path)?;
            journal.append(CleanupAction::Remove(path));
            self.state.installed_symlinks.push(name.clone());
        }

        for (content, name) in &self.host_certs.certs {
            let path = ca_dir.join(name);
            if ctr_fs.lstat(&path).ignore_not_found()?.is_some() {
                debug!("{path:?} already exists, leaving it alone");
                continue;
            }
            ctr_fs.write_file(&path, format!("{content}\n").as_bytes(), 0o644)?;
            journal.append(CleanupAction::Remove(path));
            self.state
                .installed_certs
                .insert(name.clone(), content.clone());
        }

        // what the bundle gains, whether the update command or we put it there
        self.state.appended_bundle_certs = self
            .state
            .installed_certs
            .values()
            .flat_map(|content| certs::pem_blocks(content.as_bytes()))
            .map(|block| block.body)
            .filter(|body| !self.state.existing_bundle_certs.contains(body))
            .collect();

        Ok(())
    }

    fn append_to_bundle(&mut self, journal: &mut CleanupJournal) -> Result<()> {
        let ctr_fs = &self.ctr_fs;
        let bundle = self.bundle_path.as_path();
        let state = &mut self.state;

        if let Some(parent) = bundle.parent() {
            state.created_bundle_parent = ctr_fs.mkdir_all(parent, 0o755)?;
            if let Some(created) = &state.created_bundle_parent {
                journal.append(CleanupAction::RemoveAll(created.clone()));
            }
        }

        let original = match state.bundle_existed {
            true => {
                let original = ctr_fs.read_file(bundle)?;
                journal.append(CleanupAction::RestoreFile {
                    path: bundle.to_path_buf(),
                    contents: original.clone(),
                    mtime: state.original_bundle_mtime,
                });
                original
            }
            false => {
                journal.append(CleanupAction::Remove(bundle.to_path_buf()));
                vec![]
            }
        };

        let mut updated = original.clone();
        for body in &state.appended_bundle_certs {
            let block = certs::append_block(&updated, body);
            updated.extend(block);
        }

        let mut file = ctr_fs.open_append(bundle, 0o644)?;
        file.write_all(&updated[original.len()..])
            .with_context(|| format!("Appending to {bundle:?}"))?;
        drop(file);

        debug!(
            "appended {} certificate(s) to {bundle:?}",
            state.appended_bundle_certs.len()
        );
        state.installed_bundle_mtime = Some(ctr_fs.mtime(bundle)?);
        state.original_bundle = Some(original);
        state.installed_bundle = Some(updated);
        Ok(())
    }

    /// Removes what a successful [`Self::install`] added.  Does nothing otherwise.
    ///
    /// Every step is attempted even if an earlier one fails; all failures are returned together.
    #[context("Uninstalling CA certificates")]
    pub async fn uninstall(&mut self) -> Result<()> {
        if self.phase != InstallPhase::Done {
            debug!("nothing to uninstall ({:?})", self.phase);
            return Ok(());
        }
        self.phase = InstallPhase::Uninstalled;

        let mut errors = vec![];
        let ctr_fs = Arc::clone(&self.ctr_fs);
        let ca_dir = self.ca_dir();

        // taken before anything changes, to tell whether the workload touched the bundle
        let bundle_mtime = match ctr_fs
            .mtime(&self.bundle_path)
            .ignore_not_found()
            .with_context(|| format!("Reading mtime of {:?}", self.bundle_path))
        {
            Ok(mtime) => mtime,
            Err(err) => {
                errors.push(err);
                None
            }
        };

        let installed = self
            .state
            .installed_symlinks
            .iter()
            .chain(self.state.installed_certs.keys());
        for name in installed {
            let path = ca_dir.join(name);
            if let Err(err) = ctr_fs
                .remove(&path)
                .ignore_not_found()
                .with_context(|| format!("Removing {path:?}"))
            {
                errors.push(err);
            }
        }

        let update_command_exists = match self.update_command_exists() {
            Ok(exists) => Some(exists),
            Err(err) => {
                errors.push(err);
                None
            }
        };

        match update_command_exists {
            Some(true) => {
                let args = self.profile().update_args();
                match self.exec.exec(&args).await {
                    Ok(()) => {
                        if let Err(err) = self.restore_bundle_mtime(bundle_mtime) {
                            errors.push(err);
                        }
                    }
                    Err(err) => errors.push(err.context(format!("Running {args:?}"))),
                }
            }
            Some(false) => {
                if let Err(err) = self.restore_bundle() {
                    errors.push(err);
                }
            }
            None => {}
        }

        if let Err(err) = self.remove_created_paths(update_command_exists) {
            errors.push(err);
        }

        match errors.is_empty() {
            true => Ok(()),
            false => Err(JournalError(errors).into()),
        }
    }

    fn restore_bundle(&self) -> Result<()> {
        let ctr_fs = &self.ctr_fs;
        let bundle = self.bundle_path.as_path();
        let state = &self.state;

        let Some(current) = ctr_fs.read_file(bundle).ignore_not_found()? else {
            debug!("{bundle:?} is gone, nothing to strip");
            return Ok(());
        };
        let current_mtime = ctr_fs.mtime(bundle)?;

        let restored = match (&state.installed_bundle, &state.original_bundle) {
            (Some(installed), Some(original)) if *installed == current => original.clone(),
            _ => certs::strip_certs(&current, &state.appended_bundle_certs),
        };
        if restored != current {
            ctr_fs.write_file(bundle, &restored, 0o644)?;
        }

        self.restore_bundle_mtime(Some(current_mtime))
    }

    /// Puts the bundle's pre-install mtime back if `current` (taken at the start of uninstall)
    /// shows nobody touched the bundle after install.
    fn restore_bundle_mtime(&self, current: Option<SystemTime>) -> Result<()> {
        let state = &self.state;
        if current.is_none() || current != state.installed_bundle_mtime {
            return Ok(());
        }
        if let Some(mtime) = state.original_bundle_mtime {
            self.ctr_fs
                .set_mtime(&self.bundle_path, mtime)
                .with_context(|| format!("Restoring mtime of {:?}", self.bundle_path))?;
        }
        Ok(())
    }

    fn remove_created_paths(&self, update_command_exists: Option<bool>) -> Result<()> {
        let ctr_fs = &self.ctr_fs;
        let state = &self.state;
        let bundle = self.bundle_path.as_path();

        if !state.bundle_existed {
            let empty = ctr_fs
                .stat(bundle)
                .ignore_not_found()?
                .is_some_and(|meta| meta.len() == 0);
            if empty {
                ctr_fs.remove(bundle)?;
            }
        }
        if let (Some(top), Some(parent)) = (&state.created_bundle_parent, bundle.parent()) {
            self.remove_empty_dirs(parent, top)?;
        }

        // a command that showed up during the workload came with a package owning the directory
        let update_command_appeared =
            !state.update_command_existed && update_command_exists == Some(true);
        if let (Some(top), false) = (&state.created_ca_dir, update_command_appeared) {
            self.remove_empty_dirs(self.ca_dir(), top)?;
        }
        Ok(())
    }

    /// Removes `leaf` and its parents up to and including `top` while they are empty.
    fn remove_empty_dirs(&self, leaf: &Path, top: &Path) -> Result<()> {
        let mut dir = leaf;
        while dir.starts_with(top) {
            if !self.ctr_fs.dir_is_empty(dir)? {
                break;
            }
            self.ctr_fs.remove(dir).ignore_not_found()?;
            debug!("removed {dir:?}");
            match dir.parent() {
                Some(parent) => dir = parent,
                None => break,
            }
        }
        Ok(())
    }
}
