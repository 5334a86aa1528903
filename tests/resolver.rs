//! Path resolution across mounts

use std::{fs, path::PathBuf};

use similar_asserts::assert_eq;

use ctrcerts::{containerfs::ContainerFs, error::FsError};

mod common;
use common::{spec_for, Fixture};

#[test]
fn test_symlink_into_bind_mount() {
    let fixture = Fixture::new();
    let data = fixture.mount_source("data");
    fs::write(data.join("target"), "in the mount").unwrap();
    fixture.mkdir("/data");
    fixture.symlink("/data/target", "/link");
    let ctr_fs = fixture.container_fs(&[("/data", &data)]);

    let host = ctr_fs.host_path("/link").unwrap();
    assert_eq!(host, fs::canonicalize(&data).unwrap().join("target"));
    assert_eq!(ctr_fs.read_file("/link").unwrap(), b"in the mount");
}

#[test]
fn test_relative_symlink_out_of_bind_mount() {
    let fixture = Fixture::new();
    let data = fixture.mount_source("data");
    fixture.write("/etc/hosts", "127.0.0.1 localhost\n");
    std::os::unix::fs::symlink("../etc/hosts", data.join("hosts")).unwrap();
    let ctr_fs = fixture.container_fs(&[("/data", &data)]);

    // the link lives in the mount, its target in the rootfs
    assert_eq!(
        ctr_fs.evaluate_symlinks("/data/hosts").unwrap(),
        PathBuf::from("/etc/hosts")
    );
    assert_eq!(ctr_fs.host_path("/data/hosts").unwrap(), fixture.host("/etc/hosts"));
}

#[test]
fn test_dotdot_stays_in_container() {
    let fixture = Fixture::new();
    fixture.symlink("../outside", "/link");
    fixture.symlink("../../../../../../etc/passwd", "/deep");
    let ctr_fs = fixture.container_fs(&[]);

    assert_eq!(ctr_fs.host_path("/link").unwrap(), fixture.host("/outside"));
    assert_eq!(ctr_fs.host_path("/deep").unwrap(), fixture.host("/etc/passwd"));
    assert_eq!(
        ctr_fs.host_path("/../../etc/passwd").unwrap(),
        fixture.host("/etc/passwd")
    );
}

#[test]
fn test_later_mount_shadows_earlier() {
    let fixture = Fixture::new();
    let outer = fixture.mount_source("outer");
    let inner = fixture.mount_source("inner");
    fs::write(outer.join("file"), "outer").unwrap();
    fs::create_dir(outer.join("sub")).unwrap();
    fs::write(outer.join("sub/file"), "shadowed").unwrap();
    fs::write(inner.join("file"), "inner").unwrap();
    let ctr_fs = fixture.container_fs(&[("/mnt", &outer), ("/mnt/sub", &inner)]);

    assert_eq!(ctr_fs.read_file("/mnt/file").unwrap(), b"outer");
    assert_eq!(ctr_fs.read_file("/mnt/sub/file").unwrap(), b"inner");
}

#[test]
fn test_mount_destination_through_symlinked_parent() {
    let fixture = Fixture::new();
    let certs = fixture.mount_source("certs");
    fs::write(certs.join("bundle.crt"), "bundle").unwrap();
    // /etc/ssl -> /usr/lib/ssl, so a mount at /etc/ssl/certs really covers /usr/lib/ssl/certs
    fixture.mkdir("/usr/lib/ssl/certs");
    fixture.symlink("/usr/lib/ssl", "/etc/ssl");
    let ctr_fs = fixture.container_fs(&[("/etc/ssl/certs", &certs)]);

    assert_eq!(
        ctr_fs.mounts()[1].resolved_destination,
        PathBuf::from("/usr/lib/ssl/certs")
    );
    assert_eq!(ctr_fs.read_file("/usr/lib/ssl/certs/bundle.crt").unwrap(), b"bundle");
    assert_eq!(ctr_fs.read_file("/etc/ssl/certs/bundle.crt").unwrap(), b"bundle");
}

#[test]
fn test_mount_destination_symlink_is_not_followed() {
    let fixture = Fixture::new();
    let src = fixture.mount_source("src");
    fs::write(src.join("file"), "mounted").unwrap();
    fixture.mkdir("/elsewhere");
    fixture.symlink("/elsewhere", "/mnt");
    let ctr_fs = fixture.container_fs(&[("/mnt", &src)]);

    assert_eq!(ctr_fs.mounts()[1].resolved_destination, PathBuf::from("/mnt"));
    assert!(!ctr_fs.path_exists("/elsewhere/file").unwrap());
}

#[test]
fn test_loop_across_mounts() {
    let fixture = Fixture::new();
    let data = fixture.mount_source("data");
    std::os::unix::fs::symlink("/ping", data.join("pong")).unwrap();
    fixture.symlink("/data/pong", "/ping");
    let ctr_fs = fixture.container_fs(&[("/data", &data)]);

    assert!(matches!(
        ctr_fs.stat("/ping").unwrap_err(),
        FsError::TooManyLinks(_)
    ));
}

#[test]
fn test_relative_rootfs_rejected() {
    let spec = spec_for("relative/rootfs".as_ref(), &[]);
    assert!(ContainerFs::new(&spec).is_err());
}

#[test]
fn test_write_through_symlink_lands_in_mount() {
    let fixture = Fixture::new();
    let data = fixture.mount_source("data");
    fixture.mkdir("/etc/ssl/certs");
    fixture.symlink("/data/ca.crt", "/etc/ssl/certs/ca.crt");
    let ctr_fs = fixture.container_fs(&[("/data", &data)]);

    ctr_fs.write_file("/etc/ssl/certs/ca.crt", b"pem", 0o644).unwrap();
    assert_eq!(fs::read(data.join("ca.crt")).unwrap(), b"pem");
    // the link itself is untouched
    assert!(fs::symlink_metadata(fixture.host("/etc/ssl/certs/ca.crt"))
        .unwrap()
        .is_symlink());

    ctr_fs.remove("/etc/ssl/certs/ca.crt").unwrap();
    assert!(data.join("ca.crt").exists());
    assert!(!fixture.host("/etc/ssl/certs/ca.crt").exists());
}
