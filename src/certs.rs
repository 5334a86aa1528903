//! CA bundles and custom CA directories.
//!
//! A bundle is one file with many PEM certificates concatenated, possibly with comments between
//! them.  Certificates are identified by content, never by file name: a PEM block's identity is
//! its lines from `-----BEGIN` to `-----END` with surrounding whitespace trimmed, joined by `\n`.

use std::{
    collections::{BTreeMap, BTreeSet},
    fs,
    io::{ErrorKind, Result},
    ops::Range,
    path::{Path, PathBuf},
};

/// One PEM block found in a bundle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PemBlock {
    /// Normalized block text, see the module docs.
    pub body: String,
    /// Byte range of the block's lines (including their line terminators) in the source.
    pub range: Range<usize>,
}

/// Finds every complete PEM block in `data`.  Text outside of blocks is ignored and an
/// unterminated block at the end is dropped.
pub fn pem_blocks(data: &[u8]) -> Vec<PemBlock> {
    let mut blocks = vec![];
    let mut current: Option<(usize, Vec<String>)> = None;
    let mut offset = 0;

    for line in data.split_inclusive(|b| *b == b'\n') {
        let start = offset;
        offset += line.len();
        let text = String::from_utf8_lossy(line);
        let text = text.trim();

        if let Some((_, lines)) = current.as_mut() {
            lines.push(text.to_string());
        } else {
            if text.starts_with("-----BEGIN ") {
                current = Some((start, vec![text.to_string()]));
            }
            continue;
        }

        if text.starts_with("-----END ") {
            if let Some((block_start, lines)) = current.take() {
                blocks.push(PemBlock {
                    body: lines.join("\n"),
                    range: block_start..offset,
                });
            }
        }
    }

    blocks
}

/// The set of certificates in a bundle.
pub fn parse_bundle(data: &[u8]) -> BTreeSet<String> {
    pem_blocks(data).into_iter().map(|block| block.body).collect()
}

/// Returns `data` with every PEM block whose body is in `certs` cut out.  All other bytes,
/// including comments and blocks not in `certs`, are preserved exactly.
pub fn strip_certs(data: &[u8], certs: &BTreeSet<String>) -> Vec<u8> {
    let mut result = Vec::with_capacity(data.len());
    let mut copied_to = 0;

    for block in pem_blocks(data) {
        if certs.contains(&block.body) {
            result.extend_from_slice(&data[copied_to..block.range.start]);
            copied_to = block.range.end;
        }
    }
    result.extend_from_slice(&data[copied_to..]);

    result
}

/// The bytes to append to a bundle ending in `existing` so that `body` becomes its own block.
pub fn append_block(existing: &[u8], body: &str) -> Vec<u8> {
    let mut appended = vec![];
    if existing.last().is_some_and(|b| *b != b'\n') {
        appended.push(b'\n');
    }
    appended.extend_from_slice(body.as_bytes());
    appended.push(b'\n');
    appended
}

/// The entries of a directory of individual CA certificates.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CaDirContents {
    /// Regular files: trimmed file content to file name.
    pub certs: BTreeMap<String, String>,
    /// Symlinks: link name to (unresolved) target.
    pub symlinks: BTreeMap<String, PathBuf>,
}

impl CaDirContents {
    /// Reads the directory at `path` on the host.  A missing directory reads as empty.
    ///
    /// Subdirectories are skipped.
    pub fn read(path: &Path) -> Result<Self> {
        let mut contents = CaDirContents::default();

        let entries = match fs::read_dir(path) {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(contents),
            Err(err) => return Err(err),
        };

        for entry in entries {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            let file_type = entry.file_type()?;

            if file_type.is_symlink() {
                contents
                    .symlinks
                    .insert(name, fs::read_link(entry.path())?);
            } else if file_type.is_dir() {
                // TODO: update-ca-certificates also scans subdirectories
                continue;
            } else {
                let data = fs::read(entry.path())?;
                let cert = String::from_utf8_lossy(&data).trim().to_string();
                contents.certs.insert(cert, name);
            }
        }

        Ok(contents)
    }

    pub fn is_empty(&self) -> bool {
        self.certs.is_empty() && self.symlinks.is_empty()
    }
}

#[cfg(test)]
mod test {
    use std::os::unix::fs::symlink;

    use similar_asserts::assert_eq;

    use super::*;

    const CERT_A: &str = "-----BEGIN CERTIFICATE-----\nAAAA\nAAAA\n-----END CERTIFICATE-----";
    const CERT_B: &str = "-----BEGIN CERTIFICATE-----\nBBBB\n-----END CERTIFICATE-----";

    #[test]
    fn test_parse_bundle() {
        let bundle = format!("# ACME root\n{CERT_A}\n\n# other\n{CERT_B}\n");
        let certs = parse_bundle(bundle.as_bytes());
        assert_eq!(
            certs,
            BTreeSet::from([CERT_A.to_string(), CERT_B.to_string()])
        );
    }

    #[test]
    fn test_parse_bundle_normalizes_whitespace() {
        let bundle = "-----BEGIN CERTIFICATE-----  \r\nBBBB\r\n-----END CERTIFICATE-----\r\n";
        assert_eq!(parse_bundle(bundle.as_bytes()), BTreeSet::from([CERT_B.to_string()]));
    }

    #[test]
    fn test_parse_bundle_without_separators() {
        // Debian's generated bundle has no blank lines between certificates
        let bundle = format!("{CERT_A}\n{CERT_B}\n");
        assert_eq!(parse_bundle(bundle.as_bytes()).len(), 2);
    }

    #[test]
    fn test_unterminated_block_dropped() {
        let bundle = format!("{CERT_A}\n-----BEGIN CERTIFICATE-----\nCCCC\n");
        assert_eq!(parse_bundle(bundle.as_bytes()), BTreeSet::from([CERT_A.to_string()]));
    }

    #[test]
    fn test_strip_certs() {
        let bundle = format!("# ACME root\n{CERT_A}\n\n# other\n{CERT_B}\n");
        let stripped = strip_certs(bundle.as_bytes(), &BTreeSet::from([CERT_A.to_string()]));
        assert_eq!(
            String::from_utf8(stripped).unwrap(),
            format!("# ACME root\n\n# other\n{CERT_B}\n")
        );

        let untouched = strip_certs(bundle.as_bytes(), &BTreeSet::new());
        assert_eq!(untouched, bundle.as_bytes());
    }

    #[test]
    fn test_append_then_strip_restores_bytes() {
        for original in [format!("{CERT_A}\n"), CERT_A.to_string(), String::new()] {
            let mut bundle = original.clone().into_bytes();
            bundle.extend(append_block(&bundle, CERT_B));
            assert_eq!(parse_bundle(&bundle).len(), if original.is_empty() { 1 } else { 2 });

            let stripped = strip_certs(&bundle, &BTreeSet::from([CERT_B.to_string()]));
            let expected = match original.ends_with('\n') || original.is_empty() {
                true => original.clone(),
                // the separator newline stays behind
                false => format!("{original}\n"),
            };
            assert_eq!(String::from_utf8(stripped).unwrap(), expected);
        }
    }

    #[test]
    fn test_read_ca_dir() {
        let td = tempfile::tempdir().unwrap();
        fs::write(td.path().join("a.crt"), format!("\n{CERT_A}\n\n")).unwrap();
        symlink("a.crt", td.path().join("b.pem")).unwrap();
        fs::create_dir(td.path().join("subdir")).unwrap();

        let contents = CaDirContents::read(td.path()).unwrap();
        assert_eq!(
            contents.certs,
            BTreeMap::from([(CERT_A.to_string(), "a.crt".to_string())])
        );
        assert_eq!(
            contents.symlinks,
            BTreeMap::from([("b.pem".to_string(), PathBuf::from("a.crt"))])
        );
    }

    #[test]
    fn test_read_missing_ca_dir() {
        let td = tempfile::tempdir().unwrap();
        let contents = CaDirContents::read(&td.path().join("missing")).unwrap();
        assert!(contents.is_empty());
    }
}
