//! Transactional injection of host-trusted CA certificates into OCI containers.
//!
//! Before a build step runs inside a container, the engine copies the certificates found in its
//! own custom CA directory into the container and regenerates the container's CA bundle, and
//! after the step it reverses exactly what it added.  The container's filesystem is never
//! mounted for this: [`containerfs::ContainerFs`] resolves container paths to host paths from the
//! OCI runtime spec's root and mount list, following symlinks the way the kernel would.
//!
//! The entry point is [`installer::new_installer`], which detects the container's distro family
//! and returns an [`installer::Installer`] whose `install()`/`uninstall()` bracket the workload.
//! [`executor::with_ca_certs`] wraps that bracket with the engine's failure policy.

pub mod certs;
pub mod cleanup;
pub mod containerfs;
pub mod distro;
pub mod error;
pub mod exec;
pub mod executor;
pub mod host;
pub mod installer;
pub mod os_release;
pub mod util;


/// The engine host's directory of custom CA certificates to inject into containers.
pub const ENGINE_CUSTOM_CA_CERTS_DIR: &str = "/usr/local/share/ca-certificates";

/// OrbStack installs its own root CA into the engine's custom CA directory; on its own it is not
/// a reason to refresh the host trust store.
pub const ORBSTACK_CA_CERT_NAME: &str = "orbstack-root.crt";

/// Symlink chains longer than this fail resolution with [`error::FsError::TooManyLinks`].
pub const MAX_SYMLINK_DEPTH: usize = 255;
