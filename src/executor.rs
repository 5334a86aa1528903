//! The engine's policy for running a workload with CA certificates injected.

use std::future::Future;

use anyhow::{Context, Result};
use log::{error, warn};
use oci_spec::runtime::Spec;

use crate::{
    error::CleanupError,
    exec::ContainerExec,
    installer::{new_installer, InstallerOptions},
};

/// Runs `workload` bracketed by CA certificate install and uninstall.
///
/// CA injection is an optional nicety, so failing to set it up only logs and the workload runs
/// anyway.  The exception is a [`CleanupError`]: the container was left half-modified, so the
/// workload is not started.  Uninstall failures are logged and never change the workload's
/// result.
pub async fn with_ca_certs<E, F, Fut, T>(
    spec: &Spec,
    exec: E,
    opts: &InstallerOptions,
    workload: F,
) -> Result<T>
where
    E: ContainerExec,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut installer = match new_installer(spec, exec, opts).await {
        Ok(installer) => installer,
        Err(err) => {
            error!("Not installing CA certificates: {err:#}");
            return workload().await;
        }
    };

    if let Err(err) = installer.install().await {
        if err.downcast_ref::<CleanupError>().is_some() {
            return Err(err).context("Container filesystem left in an unknown state");
        }
        error!("Running without custom CA certificates: {err:#}");
        return workload().await;
    }

    let result = workload().await;

    if let Err(err) = installer.uninstall().await {
        warn!("{err:#}");
    }

    result
}
