//! Normalization of package-relative paths.
//!
//! The payload archive, the package header and the file database all name
//! files differently (`./usr/bin/foo`, `/usr/bin/foo`, `usr//bin/foo`).
//! Every lookup keyed by path goes through [`normalize`] so that they agree.

use camino::{Utf8Component, Utf8Path};

use crate::{Error, Result};

/// Convert a path as found in an archive or header into the canonical
/// relative form: no leading `./` or `/`, no empty or `.` components.
///
/// The root itself normalizes to the empty string.  Paths containing `..`
/// or an embedded NUL are rejected with [`Error::InvalidPath`].
pub fn normalize(path: &str) -> Result<String> {
    if path.contains('\0') {
        return Err(Error::InvalidPath(path.escape_debug().to_string()));
    }
    let mut r = String::with_capacity(path.len());
    for component in Utf8Path::new(path).components() {
        match component {
            Utf8Component::RootDir | Utf8Component::CurDir => {}
            Utf8Component::Normal(name) => {
                if !r.is_empty() {
                    r.push('/');
                }
                r.push_str(name);
            }
            Utf8Component::ParentDir | Utf8Component::Prefix(_) => {
                return Err(Error::InvalidPath(path.to_string()))
            }
        }
    }
    Ok(r)
}

/// Like [`normalize`], but for raw bytes read from an archive.
pub fn normalize_bytes(path: &[u8]) -> Result<String> {
    let path = std::str::from_utf8(path)
        .map_err(|_| Error::InvalidPath(String::from_utf8_lossy(path).into_owned()))?;
    normalize(path)
}

/// Split a normalized path into its parent and final component.  The
/// parent of a top-level name is the empty string.
pub fn split_parent(path: &str) -> (&str, &str) {
    match path.rsplit_once('/') {
        Some((parent, name)) => (parent, name),
        None => ("", path),
    }
}

/// Join a normalized parent with a child name.
pub fn join(parent: &str, name: &str) -> String {
    if parent.is_empty() {
        name.to_string()
    } else {
        format!("{parent}/{name}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize() {
        let cases = [
            ("./usr/bin/foo", "usr/bin/foo"),
            ("/usr/bin/foo", "usr/bin/foo"),
            ("usr//bin///foo", "usr/bin/foo"),
            ("usr/./bin/foo/", "usr/bin/foo"),
            (".", ""),
            ("/", ""),
            ("./", ""),
            ("", ""),
        ];
        for (input, expected) in cases {
            assert_eq!(normalize(input).unwrap(), expected, "{input}");
        }
    }

    #[test]
    fn test_normalize_invalid() {
        for input in ["../etc/shadow", "usr/../../etc", "usr/b\0in"] {
            let e = normalize(input).unwrap_err();
            assert!(matches!(e, Error::InvalidPath(_)), "{input}");
        }
        let e = normalize_bytes(b"usr/\xff").unwrap_err();
        assert!(matches!(e, Error::InvalidPath(_)));
    }

    #[test]
    fn test_split_join() {
        assert_eq!(split_parent("usr/bin/foo"), ("usr/bin", "foo"));
        assert_eq!(split_parent("usr"), ("", "usr"));
        assert_eq!(join("", "usr"), "usr");
        assert_eq!(join("usr", "bin"), "usr/bin");
    }
}
