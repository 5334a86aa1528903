//! Matching distro identifiers in os-release files.
//!
//! Only the `ID` and `ID_LIKE` fields matter here.  Values follow the freedesktop.org format:
//! shell-style assignments whose values may be single- or double-quoted, with `ID_LIKE` holding a
//! space-separated list.

use std::io::{BufRead, Result};

// Only a subset of shell quoting is needed: the os-release spec restricts unquoted values to
// A-Za-z0-9 and friends, so escapes outside of double quotes are taken literally.
fn dequote(value: &str) -> Option<String> {
    let mut result = String::new();
    let mut chars = value.trim().chars();

    while let Some(c) = chars.next() {
        match c {
            '"' => loop {
                match chars.next()? {
                    '\\' => result.push(chars.next()?),
                    '"' => break,
                    other => result.push(other),
                }
            },
            '\'' => loop {
                match chars.next()? {
                    '\'' => break,
                    other => result.push(other),
                }
            },
            other => result.push(other),
        }
    }

    Some(result)
}

/// Scans os-release content line by line for an `ID` equal to one of `ids` or an `ID_LIKE` word
/// equal to one of `id_likes`.
///
/// Only the first `ID=` and the first `ID_LIKE=` line count, and scanning stops as soon as both
/// have been seen.  An empty list means that field is not consulted at all.
pub fn os_release_matches(reader: impl BufRead, ids: &[&str], id_likes: &[&str]) -> Result<bool> {
    let mut id_done = ids.is_empty();
    let mut id_like_done = id_likes.is_empty();

    for line in reader.lines() {
        if id_done && id_like_done {
            break;
        }
        let line = line?;
        let line = line.trim_start();
        if line.starts_with('#') {
            continue;
        }

        if let Some(value) = line.strip_prefix("ID=").filter(|_| !id_done) {
            id_done = true;
            if dequote(value).is_some_and(|id| ids.contains(&id.as_str())) {
                return Ok(true);
            }
        } else if let Some(value) = line.strip_prefix("ID_LIKE=").filter(|_| !id_like_done) {
            id_like_done = true;
            let Some(value) = dequote(value) else {
                continue;
            };
            if value.split_whitespace().any(|like| id_likes.contains(&like)) {
                return Ok(true);
            }
        }
    }

    Ok(false)
}
