//! Facts about a package derived from its header.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::rpm::header::{tag, Header};
use crate::Result;

/// Queryable metadata of an imported package.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PackageMeta {
    /// Size of the uncompressed payload
    pub size: u64,
    /// Build time, in seconds since the epoch
    pub buildtime: u64,
    /// Changelog entry times, in seconds since the epoch
    pub changelogs: Vec<u64>,
    /// Source package name
    pub src_pkg: Option<String>,
}

impl PackageMeta {
    /// Derive from a package header.  The size comes from the 64 bit
    /// archive size when present.
    pub fn from_header(header: &Header) -> Result<Self> {
        let size = match header.get_u64(tag::LONGARCHIVESIZE)? {
            Some(v) => v,
            None => header.get_u64(tag::ARCHIVESIZE)?.unwrap_or_default(),
        };
        Ok(Self {
            size,
            buildtime: header.get_u64(tag::BUILDTIME)?.unwrap_or_default(),
            changelogs: header
                .get_u64_array(tag::CHANGELOGTIME)?
                .unwrap_or_default(),
            src_pkg: header.get_string(tag::SOURCERPM)?.map(ToOwned::to_owned),
        })
    }

    /// The build time as a timestamp.
    pub fn buildtime_utc(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp(i64::try_from(self.buildtime).ok()?, 0)
    }
}
