//! Per-path ownership and capability overrides taken from the header.
//!
//! The payload only carries numeric ownership (in practice always 0:0)
//! and no capabilities; the header carries user and group names and
//! capability sets as arrays parallel to the file path arrays.  This
//! joins the two by index into a table keyed by normalized path, keeping
//! only the entries that differ from root:root without capabilities.

use std::collections::HashMap;

use crate::rpm::header::{tag, Header};
use crate::{relpath, Error, Result};

/// Metadata for one path which the archive does not carry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderOverride {
    /// Owning user name
    pub user: String,
    /// Owning group name
    pub group: String,
    /// Textual capability set, e.g. `cap_net_bind_service=ep`
    pub capabilities: Option<String>,
}

impl HeaderOverride {
    fn is_default(&self) -> bool {
        self.user == "root" && self.group == "root" && self.capabilities.is_none()
    }
}

/// Path-keyed table of [`HeaderOverride`].
#[derive(Debug, Default)]
pub struct HeaderIndex {
    entries: HashMap<String, HeaderOverride>,
}

fn check_len(name: &str, found: usize, expected: usize) -> Result<()> {
    if found != expected {
        return Err(Error::MalformedHeader(format!(
            "{name} has {found} entries, expected {expected}"
        )));
    }
    Ok(())
}

fn nth<'a>(v: &Option<Vec<&'a str>>, i: usize) -> Option<&'a str> {
    v.as_ref().and_then(|v| v.get(i).copied())
}

impl HeaderIndex {
    /// Build the table from a package header.
    #[tracing::instrument(level = "debug", skip_all)]
    pub fn build(header: &Header) -> Result<Self> {
        let paths = header.file_paths()?;
        let n = paths.len();
        let users = header.get_string_array(tag::FILEUSERNAME)?;
        let groups = header.get_string_array(tag::FILEGROUPNAME)?;
        let caps = header.get_string_array(tag::FILECAPS)?;
        for (name, v) in [("FILEUSERNAME", &users), ("FILEGROUPNAME", &groups), ("FILECAPS", &caps)] {
            if let Some(v) = v {
                check_len(name, v.len(), n)?;
            }
        }
        let mut entries = HashMap::new();
        for (i, path) in paths.iter().enumerate() {
            let o = HeaderOverride {
                user: nth(&users, i).unwrap_or("root").to_string(),
                group: nth(&groups, i).unwrap_or("root").to_string(),
                capabilities: nth(&caps, i)
                    .filter(|c| !c.is_empty())
                    .map(ToOwned::to_owned),
            };
            if o.is_default() {
                continue;
            }
            entries.insert(relpath::normalize(path)?, o);
        }
        tracing::debug!("{} of {n} files have header overrides", entries.len());
        Ok(Self { entries })
    }

    /// Find the override for a normalized path.
    pub fn lookup(&self, path: &str) -> Option<&HeaderOverride> {
        self.entries.get(path)
    }

    /// Number of stored overrides.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether there are no overrides at all.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
