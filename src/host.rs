//! Keeping the engine host's own trust store in sync with its custom CA directory.

use std::{fs, io, path::Path};

use anyhow::{bail, Context, Result};
use log::{debug, info, warn};
use tokio::process::Command;

use crate::ORBSTACK_CA_CERT_NAME;

/// Whether `dir` holds anything besides the OrbStack root CA.  A missing directory doesn't.
pub fn needs_refresh(dir: &Path) -> io::Result<bool> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(false),
        Err(err) => return Err(err),
    };
    for entry in entries {
        if entry?.file_name() != ORBSTACK_CA_CERT_NAME {
            return Ok(true);
        }
    }
    Ok(false)
}

async fn run(program: &str, args: &[&Path]) -> Result<()> {
    let output = Command::new(program)
        .args(args)
        .output()
        .await
        .with_context(|| format!("Spawning {program}"))?;
    if !output.status.success() {
        bail!(
            "{program} failed ({}): {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim_end()
        );
    }
    Ok(())
}

/// Regenerates the host's CA bundle and hash links if the custom CA directory has certificates
/// of its own.  Never fails; problems are logged.
pub async fn refresh_host_trust_store(dir: &Path) {
    match needs_refresh(dir) {
        Ok(true) => {}
        Ok(false) => {
            debug!("no custom CA certificates in {dir:?}, not refreshing");
            return;
        }
        Err(err) => {
            warn!("Reading {dir:?}: {err}");
            return;
        }
    }

    info!("refreshing host trust store from {dir:?}");
    if let Err(err) = run("update-ca-certificates", &[]).await {
        warn!("{err:#}");
    }
    if let Err(err) = run("c_rehash", &[dir]).await {
        warn!("{err:#}");
    }
}
