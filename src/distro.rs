//! Distro families and how each one manages trusted CA certificates.

use std::fmt;

use crate::{containerfs::ContainerFs, error::Result};

/// One distro family's CA trust convention and the markers that identify it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DistroProfile {
    pub name: &'static str,
    /// The generated bundle that TLS libraries read.
    pub bundle_path: &'static str,
    /// The directory of individual certificates the update command scans.
    pub custom_ca_cert_dir: &'static str,
    /// Regenerates the bundle from the custom CA directory.
    pub update_command: &'static [&'static str],
    /// Files whose presence alone identifies the family.
    pub release_files: &'static [&'static str],
    /// Accepted `ID` values in os-release.
    pub ids: &'static [&'static str],
    /// Accepted `ID_LIKE` words in os-release.
    pub id_likes: &'static [&'static str],
}

impl DistroProfile {
    /// Whether the container looks like this family.  Side-effect free.
    pub fn detect(&self, ctr_fs: &ContainerFs) -> Result<bool> {
        if ctr_fs.any_path_exists(self.release_files)? {
            return Ok(true);
        }
        ctr_fs.os_release_contains(self.ids, self.id_likes)
    }

    /// The update command as owned arguments, ready for [`crate::exec::ContainerExec`].
    pub fn update_args(&self) -> Vec<String> {
        self.update_command.iter().map(|arg| arg.to_string()).collect()
    }
}

pub const DEBIAN_LIKE: DistroProfile = DistroProfile {
    name: "debianLike",
    bundle_path: "/etc/ssl/certs/ca-certificates.crt",
    custom_ca_cert_dir: "/usr/local/share/ca-certificates",
    update_command: &["update-ca-certificates"],
    release_files: &[
        "/etc/debian_version",
        "/etc/alpine-release",
        "/etc/gentoo-release",
    ],
    ids: &["debian", "ubuntu", "alpine", "gentoo"],
    id_likes: &["debian", "ubuntu", "alpine", "gentoo"],
};

pub const RHEL_LIKE: DistroProfile = DistroProfile {
    name: "rhelLike",
    bundle_path: "/etc/pki/tls/certs/ca-bundle.crt",
    custom_ca_cert_dir: "/etc/pki/ca-trust/source/anchors",
    update_command: &["update-ca-trust"],
    release_files: &[
        "/etc/redhat-release",
        "/etc/redhat-version",
        "/etc/centos-release",
    ],
    ids: &["rhel", "fedora", "centos", "amzn"],
    id_likes: &["rhel", "centos", "fedora"],
};

/// The supported distro families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Distro {
    DebianLike,
    RhelLike,
}

impl Distro {
    pub const ALL: [Distro; 2] = [Distro::DebianLike, Distro::RhelLike];

    pub fn profile(self) -> &'static DistroProfile {
        match self {
            Distro::DebianLike => &DEBIAN_LIKE,
            Distro::RhelLike => &RHEL_LIKE,
        }
    }
}

impl fmt::Display for Distro {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.profile().name)
    }
}
