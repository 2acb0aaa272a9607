use camino::Utf8Path;
use std::fmt::Display;

/// Helper to format a path in error messages and logs.
#[derive(Debug)]
pub struct PathQuotedDisplay<'a> {
    path: &'a str,
}

impl Display for PathQuotedDisplay<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // The archive root is normalized to the empty string; show it as `.`
        if self.path.is_empty() {
            return f.write_str(".");
        }
        if self
            .path
            .chars()
            .all(|c| matches!(c, '/' | '.' | '-' | '_' | '+') || c.is_alphanumeric())
        {
            return f.write_str(self.path);
        }
        match shlex::try_quote(self.path) {
            Ok(r) => f.write_str(&r),
            // Embedded NUL; fall back to debug escaping
            Err(_) => write!(f, "{:?}", self.path),
        }
    }
}

impl<'a> PathQuotedDisplay<'a> {
    /// Given a path, quote it in a way that it would be parsed by a default
    /// POSIX shell. If the path has no spaces or shell meta-characters,
    /// it will be exactly the same as the input.
    pub fn new<P: AsRef<Utf8Path> + ?Sized>(path: &'a P) -> PathQuotedDisplay<'a> {
        PathQuotedDisplay {
            path: path.as_ref().as_str(),
        }
    }
}
