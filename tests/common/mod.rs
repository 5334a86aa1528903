//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use std::{
    collections::BTreeSet,
    fs,
    os::unix::fs::{symlink, PermissionsExt},
    path::{Path, PathBuf},
    sync::Mutex,
};

use anyhow::Result;
use oci_spec::runtime::{MountBuilder, ProcessBuilder, RootBuilder, Spec, SpecBuilder};
use tempfile::TempDir;

use ctrcerts::{certs, containerfs::ContainerFs, exec::ContainerExec};

pub const CERT_A: &str = "-----BEGIN CERTIFICATE-----\nQUFBQQ==\n-----END CERTIFICATE-----";
pub const CERT_B: &str = "-----BEGIN CERTIFICATE-----\nQkJCQg==\n-----END CERTIFICATE-----";
pub const CERT_SYSTEM: &str = "-----BEGIN CERTIFICATE-----\nU1lTVEVN\n-----END CERTIFICATE-----";

/// A container rootfs, room for mount sources, and a host custom CA directory.
pub struct Fixture {
    dir: TempDir,
}

impl Fixture {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("rootfs")).unwrap();
        fs::create_dir(dir.path().join("host-certs")).unwrap();
        Fixture { dir }
    }

    pub fn rootfs(&self) -> PathBuf {
        self.dir.path().join("rootfs")
    }

    pub fn host_certs_dir(&self) -> PathBuf {
        self.dir.path().join("host-certs")
    }

    /// A directory next to the rootfs, for use as a bind mount source.
    pub fn mount_source(&self, name: &str) -> PathBuf {
        let path = self.dir.path().join(name);
        fs::create_dir_all(&path).unwrap();
        path
    }

    pub fn host(&self, container_path: &str) -> PathBuf {
        self.rootfs().join(container_path.trim_start_matches('/'))
    }

    pub fn write(&self, container_path: &str, contents: impl AsRef<[u8]>) {
        write_file(&self.host(container_path), contents.as_ref(), 0o644);
    }

    pub fn write_exe(&self, container_path: &str) {
        write_file(&self.host(container_path), b"#!/bin/sh\n", 0o755);
    }

    pub fn mkdir(&self, container_path: &str) {
        fs::create_dir_all(self.host(container_path)).unwrap();
    }

    pub fn symlink(&self, target: &str, container_path: &str) {
        let link = self.host(container_path);
        if let Some(parent) = link.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        symlink(target, link).unwrap();
    }

    pub fn host_cert(&self, name: &str, contents: &str) {
        fs::write(self.host_certs_dir().join(name), contents).unwrap();
    }

    pub fn host_cert_link(&self, name: &str, target: &str) {
        symlink(target, self.host_certs_dir().join(name)).unwrap();
    }

    /// A spec for this rootfs with `(destination, source)` bind mounts.
    pub fn spec(&self, binds: &[(&str, &Path)]) -> Spec {
        spec_for(&self.rootfs(), binds)
    }

    pub fn container_fs(&self, binds: &[(&str, &Path)]) -> ContainerFs {
        ContainerFs::new(&self.spec(binds)).unwrap()
    }

    /// Every path under the rootfs with its contents (or link target), for before/after checks.
    pub fn tree(&self) -> BTreeSet<(PathBuf, String)> {
        let mut tree = BTreeSet::new();
        walk(&self.rootfs(), &self.rootfs(), &mut tree);
        tree
    }
}

fn write_file(path: &Path, contents: &[u8], mode: u32) {
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, contents).unwrap();
    fs::set_permissions(path, fs::Permissions::from_mode(mode)).unwrap();
}

fn walk(root: &Path, dir: &Path, tree: &mut BTreeSet<(PathBuf, String)>) {
    for entry in fs::read_dir(dir).unwrap() {
        let path = entry.unwrap().path();
        let rel = path.strip_prefix(root).unwrap().to_path_buf();
        let meta = fs::symlink_metadata(&path).unwrap();
        if meta.is_symlink() {
            let target = fs::read_link(&path).unwrap();
            tree.insert((rel, format!("-> {}", target.display())));
        } else if meta.is_dir() {
            tree.insert((rel, "/".to_string()));
            walk(root, &path, tree);
        } else {
            tree.insert((rel, fs::read_to_string(&path).unwrap()));
        }
    }
}

pub fn spec_for(rootfs: &Path, binds: &[(&str, &Path)]) -> Spec {
    let mounts = binds
        .iter()
        .map(|(destination, source)| {
            MountBuilder::default()
                .typ("bind")
                .source(*source)
                .destination(*destination)
                .options(vec!["rbind".to_string()])
                .build()
                .unwrap()
        })
        .collect::<Vec<_>>();

    SpecBuilder::default()
        .root(RootBuilder::default().path(rootfs).build().unwrap())
        .mounts(mounts)
        .process(
            ProcessBuilder::default()
                .env(vec!["PATH=/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin".to_string()])
                .build()
                .unwrap(),
        )
        .build()
        .unwrap()
}

/// Stands in for `update-ca-certificates` running inside the container: the bundle becomes the
/// system certificates plus every certificate in the custom CA directory.
pub struct FakeUpdateCommand {
    ctr_fs: ContainerFs,
    bundle: PathBuf,
    ca_dir: PathBuf,
    system: Vec<String>,
    pub calls: Mutex<Vec<Vec<String>>>,
}

impl FakeUpdateCommand {
    pub fn debian(spec: &Spec, system: &[&str]) -> Self {
        FakeUpdateCommand {
            ctr_fs: ContainerFs::new(spec).unwrap(),
            bundle: "/etc/ssl/certs/ca-certificates.crt".into(),
            ca_dir: "/usr/local/share/ca-certificates".into(),
            system: system.iter().map(|cert| cert.to_string()).collect(),
            calls: Mutex::new(vec![]),
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    fn regenerate(&self) -> Result<()> {
        let mut certs = self.system.clone();
        if let Ok(entries) = self.ctr_fs.read_dir(&self.ca_dir) {
            for entry in entries {
                let path = self.ca_dir.join(entry.file_name());
                let data = self.ctr_fs.read_file(&path)?;
                for cert in certs::parse_bundle(&data) {
                    // links show the same certificate twice
                    if !certs.contains(&cert) {
                        certs.push(cert);
                    }
                }
            }
        }

        let mut bundle = certs.join("\n");
        bundle.push('\n');
        self.ctr_fs.mkdir_all(self.bundle.parent().unwrap(), 0o755)?;
        self.ctr_fs.write_file(&self.bundle, bundle.as_bytes(), 0o644)?;
        Ok(())
    }
}

impl ContainerExec for FakeUpdateCommand {
    async fn exec(&self, args: &[String]) -> Result<()> {
        self.calls.lock().unwrap().push(args.to_vec());
        assert_eq!(args, ["update-ca-certificates"]);
        self.regenerate()
    }
}

/// Fails every command, and counts them.
#[derive(Default)]
pub struct FailingExec {
    pub calls: Mutex<usize>,
}

impl ContainerExec for FailingExec {
    async fn exec(&self, args: &[String]) -> Result<()> {
        *self.calls.lock().unwrap() += 1;
        anyhow::bail!("{args:?}: exit status 1")
    }
}
