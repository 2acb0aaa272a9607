//! Package identity: name, epoch, version, release, architecture.

use std::fmt;
use std::str::FromStr;

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

/// The identity of a package build.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Nevra {
    /// Package name
    pub name: String,
    /// Epoch; zero when the package has none.
    pub epoch: u64,
    /// Upstream version
    pub version: String,
    /// Release
    pub release: String,
    /// Architecture, e.g. `x86_64` or `noarch`
    pub arch: String,
}

impl Nevra {
    /// Create a new identity.
    pub fn new(
        name: impl Into<String>,
        epoch: u64,
        version: impl Into<String>,
        release: impl Into<String>,
        arch: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            epoch,
            version: version.into(),
            release: release.into(),
            arch: arch.into(),
        }
    }

    /// The canonical string form, `name-version-release.arch`.  If
    /// `with_epoch` is set and the epoch is non-zero, it is included
    /// as `name-epoch:version-release.arch`.
    pub fn to_string_with_epoch(&self, with_epoch: bool) -> String {
        if with_epoch && self.epoch != 0 {
            format!(
                "{}-{}:{}-{}.{}",
                self.name, self.epoch, self.version, self.release, self.arch
            )
        } else {
            format!(
                "{}-{}-{}.{}",
                self.name, self.version, self.release, self.arch
            )
        }
    }
}

impl fmt::Display for Nevra {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_string_with_epoch(false))
    }
}

impl FromStr for Nevra {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || anyhow!("Invalid package identity: {s}");
        let (rest, arch) = s.rsplit_once('.').ok_or_else(invalid)?;
        let (rest, release) = rest.rsplit_once('-').ok_or_else(invalid)?;
        let (name, evr) = rest.rsplit_once('-').ok_or_else(invalid)?;
        let (epoch, version) = match evr.split_once(':') {
            Some((e, v)) => {
                let e = e
                    .parse::<u64>()
                    .map_err(|e| anyhow!("Invalid epoch in {s}: {e}"))?;
                (e, v)
            }
            None => (0, evr),
        };
        if [name, version, release, arch].iter().any(|v| v.is_empty()) {
            return Err(invalid());
        }
        Ok(Self::new(name, epoch, version, release, arch))
    }
}
