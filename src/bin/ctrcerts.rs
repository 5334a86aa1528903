use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use oci_spec::runtime::Spec;

use ctrcerts::{
    containerfs::ContainerFs,
    exec::{ContainerExec, RuncExec},
    executor::with_ca_certs,
    host::refresh_host_trust_store,
    installer::{detect, InstallerOptions},
    ENGINE_CUSTOM_CA_CERTS_DIR,
};

/// ctrcerts
#[derive(Debug, Parser)]
#[clap(name = "ctrcerts", version)]
pub struct App {
    /// the OCI bundle directory holding config.json
    #[clap(long, default_value = ".")]
    bundle: PathBuf,
    /// the host directory of custom CA certificates to inject
    #[clap(long, default_value = ENGINE_CUSTOM_CA_CERTS_DIR)]
    host_certs_dir: PathBuf,
    #[clap(long, default_value = "runc")]
    runc: PathBuf,
    /// runc's state directory
    #[clap(long)]
    runc_root: Option<PathBuf>,

    #[clap(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Prints the container path and host path a container path resolves to
    Resolve {
        path: PathBuf,
        /// leave a symlink in the final component alone
        #[clap(long)]
        nofollow: bool,
    },
    /// Prints the detected distro family
    Detect,
    /// Runs a command in a running container with the host CA certificates installed
    Exec {
        /// the container id known to runc
        #[clap(long)]
        id: String,
        #[clap(last = true, required = true)]
        args: Vec<String>,
    },
    /// Regenerates the host trust store from the custom CA directory
    RefreshHost,
}

fn load_spec(bundle: &Path) -> Result<Spec> {
    let bundle = fs::canonicalize(bundle).with_context(|| format!("Opening bundle {bundle:?}"))?;
    let config = bundle.join("config.json");
    let mut spec = Spec::load(&config).with_context(|| format!("Loading {config:?}"))?;

    if let Some(root) = spec.root() {
        if root.path().is_relative() {
            let mut root = root.clone();
            root.set_path(bundle.join(root.path()));
            spec.set_root(Some(root));
        }
    }
    Ok(spec)
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let args = App::parse();

    match args.cmd {
        Command::Resolve { ref path, nofollow } => {
            let ctr_fs = ContainerFs::new(&load_spec(&args.bundle)?)?;
            let resolved = ctr_fs.resolve_path(path, !nofollow, 0)?;
            println!("{}", resolved.container.display());
            match resolved.host {
                Some(host) => println!("{}", host.display()),
                None => println!("(no host path)"),
            }
        }
        Command::Detect => {
            let ctr_fs = Arc::new(ContainerFs::new(&load_spec(&args.bundle)?)?);
            match detect(&ctr_fs).await? {
                Some(distro) => println!("{distro}"),
                None => println!("none"),
            }
        }
        Command::Exec { id, args: cmd_args } => {
            let spec = load_spec(&args.bundle)?;
            let runc = RuncExec {
                runc: args.runc,
                state_root: args.runc_root,
                container_id: id,
                env: spec
                    .process()
                    .as_ref()
                    .and_then(|process| process.env().clone())
                    .unwrap_or_default(),
            };
            let opts = InstallerOptions {
                host_certs_dir: args.host_certs_dir,
            };
            with_ca_certs(&spec, &runc, &opts, || runc.exec(&cmd_args)).await?;
        }
        Command::RefreshHost => {
            refresh_host_trust_store(&args.host_certs_dir).await;
        }
    }

    Ok(())
}
