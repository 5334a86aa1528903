//! Running commands inside a running container.

use std::{future::Future, path::PathBuf, process::Stdio};

use anyhow::{bail, Context, Result};
use log::debug;
use tokio::process::Command;

/// Runs a command to completion inside the container being prepared, as root, in the same
/// namespaces as its workload.
///
/// A non-zero exit status is an error.
pub trait ContainerExec: Send + Sync {
    fn exec(&self, args: &[String]) -> impl Future<Output = Result<()>> + Send;
}

impl<T: ContainerExec + ?Sized> ContainerExec for &T {
    fn exec(&self, args: &[String]) -> impl Future<Output = Result<()>> + Send {
        (**self).exec(args)
    }
}

/// Executes commands with `runc exec`.
#[derive(Debug, Clone)]
pub struct RuncExec {
    /// The runc binary.
    pub runc: PathBuf,
    /// runc's `--root` state directory, if not the default.
    pub state_root: Option<PathBuf>,
    pub container_id: String,
    /// `KEY=VALUE` pairs for the new process.
    pub env: Vec<String>,
}

impl RuncExec {
    pub fn new(container_id: impl Into<String>) -> Self {
        RuncExec {
            runc: PathBuf::from("runc"),
            state_root: None,
            container_id: container_id.into(),
            env: vec![],
        }
    }

    fn command(&self, args: &[String]) -> Command {
        let mut cmd = Command::new(&self.runc);
        if let Some(root) = &self.state_root {
            cmd.arg("--root").arg(root);
        }
        cmd.args(["exec", "--user", "0:0", "--cwd", "/"]);
        for var in &self.env {
            cmd.arg("--env").arg(var);
        }
        cmd.arg(&self.container_id).args(args);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

impl ContainerExec for RuncExec {
    async fn exec(&self, args: &[String]) -> Result<()> {
        debug!("runc exec {} {args:?}", self.container_id);
        let output = self
            .command(args)
            .output()
            .await
            .with_context(|| format!("Spawning {:?}", self.runc))?;

        if !output.status.success() {
            bail!(
                "{args:?} in container {} failed ({}): {}{}",
                self.container_id,
                output.status,
                String::from_utf8_lossy(&output.stdout).trim_end(),
                String::from_utf8_lossy(&output.stderr).trim_end(),
            );
        }
        Ok(())
    }
}
