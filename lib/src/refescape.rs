//! Escape strings for use in branch names.
//!
//! Branch names have a restricted set of valid characters.  This scheme
//! passes ASCII alphanumerics, `.` and `-` through unchanged; `_` quotes
//! itself as `__`; every other byte of the UTF-8 encoding becomes `_`
//! followed by exactly two uppercase hexadecimal digits.  For example,
//! `:` is `_3A`.
//!
//! Since each escape has a fixed width the mapping is injective, and
//! [`unprefix_unescape_ref`] reverses it.

use anyhow::{anyhow, Result};
use std::fmt::Write;

fn passthrough(b: u8) -> bool {
    b.is_ascii_alphanumeric() || matches!(b, b'.' | b'-')
}

/// Escape a single string; this is a backend of [`prefix_escape_for_ref`].
fn escape_for_ref(s: &str) -> Result<String> {
    if s.is_empty() {
        return Err(anyhow!("Invalid empty string for ref"));
    }
    let mut r = String::with_capacity(s.len());
    for b in s.bytes() {
        match b {
            b'\0' => return Err(anyhow!("Invalid embedded NUL in string for ref")),
            b if passthrough(b) => r.push(b as char),
            b'_' => r.push_str("__"),
            o => {
                // Writing to a String cannot fail
                let _ = write!(r, "_{:02X}", o);
            }
        }
    }
    Ok(r)
}

/// Compute a string suitable for use as a branch name, where `s` can be a
/// (nearly) arbitrary UTF-8 string.  The prefix is prepended verbatim.
///
/// The restrictions on `s` are:
/// - The empty string is not supported
/// - There may not be embedded `NUL` (`\0`) characters.
///
/// # Examples:
///
/// ```rust
/// # fn test() -> anyhow::Result<()> {
/// use rpmcache_lib::refescape;
/// assert_eq!(refescape::prefix_escape_for_ref("rpmcache-", "foo-2:1.0-1.x86_64")?,
///            "rpmcache-foo-2_3A1.0-1.x86__64");
/// # Ok(())
/// # }
/// ```
pub fn prefix_escape_for_ref(prefix: &str, s: &str) -> Result<String> {
    Ok(format!("{}{}", prefix, escape_for_ref(s)?))
}

/// Reverse the effect of [`escape_for_ref()`].
fn unescape_for_ref(s: &str) -> Result<String> {
    let mut r = Vec::with_capacity(s.len());
    let mut it = s.bytes();
    while let Some(b) = it.next() {
        match b {
            b if passthrough(b) => r.push(b),
            b'_' => match it.next() {
                Some(b'_') => r.push(b'_'),
                Some(hi) => {
                    let lo = it
                        .next()
                        .ok_or_else(|| anyhow!("Truncated escape in {s}"))?;
                    let digits = [hi, lo];
                    let digits = std::str::from_utf8(&digits)?;
                    if !digits.bytes().all(|c| matches!(c, b'0'..=b'9' | b'A'..=b'F')) {
                        anyhow::bail!("Invalid escape _{digits} in {s}");
                    }
                    r.push(u8::from_str_radix(digits, 16)?);
                }
                None => anyhow::bail!("Truncated escape in {s}"),
            },
            o => anyhow::bail!("Invalid character {}", o as char),
        }
    }
    Ok(String::from_utf8(r)?)
}

/// Remove a prefix from a branch name, and return the unescaped remainder.
///
/// # Examples:
///
/// ```rust
/// # fn test() -> anyhow::Result<()> {
/// use rpmcache_lib::refescape;
/// assert_eq!(refescape::unprefix_unescape_ref("rpmcache-", "rpmcache-foo-2_3A1.0-1.x86__64")?,
///            "foo-2:1.0-1.x86_64");
/// # Ok(())
/// # }
/// ```
pub fn unprefix_unescape_ref(prefix: &str, name: &str) -> Result<String> {
    let rest = name
        .strip_prefix(prefix)
        .ok_or_else(|| anyhow!("ref does not match expected prefix {prefix}: {name}"))?;
    unescape_for_ref(rest)
}
