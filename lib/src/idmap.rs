//! Resolution of user and group names from package headers to numeric ids.

use std::collections::HashMap;
use std::io::Read;

use anyhow::Result;
use cap_std::fs::Dir;
use cap_std_ext::cap_std;
use cap_std_ext::dirext::CapStdExtDirExt;
use fn_error_context::context;

use crate::Error;

/// Files consulted for users and groups, in priority order, relative to a root.
const PASSWD_PATHS: &[&str] = &["etc/passwd", "usr/lib/passwd"];
const GROUP_PATHS: &[&str] = &["etc/group", "usr/lib/group"];

/// Maps user and group names to ids.
#[derive(Debug, Clone, Default)]
pub enum IdMap {
    /// Use the name service database of the running host.
    #[default]
    Host,
    /// Use fixed tables, e.g. loaded from a target root.
    Table {
        /// User name to uid
        users: HashMap<String, u32>,
        /// Group name to gid
        groups: HashMap<String, u32>,
    },
}

/// Parse `/etc/passwd` or `/etc/group` style content into name → id.
/// The id is the third field in both formats.
fn parse_db(buf: &str, into: &mut HashMap<String, u32>) {
    for line in buf.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut fields = line.split(':');
        let (Some(name), Some(_), Some(id)) = (fields.next(), fields.next(), fields.next()) else {
            tracing::debug!("Ignoring malformed entry: {line}");
            continue;
        };
        let Ok(id) = id.parse::<u32>() else {
            tracing::debug!("Ignoring entry with invalid id: {line}");
            continue;
        };
        into.entry(name.to_string()).or_insert(id);
    }
}

fn load_db(root: &Dir, paths: &[&str]) -> Result<HashMap<String, u32>> {
    let mut r = HashMap::new();
    for path in paths {
        let Some(mut f) = root.open_optional(path)? else {
            continue;
        };
        let mut buf = String::new();
        f.read_to_string(&mut buf)?;
        parse_db(&buf, &mut r);
    }
    Ok(r)
}

impl IdMap {
    /// Load tables from the passwd and group files of a root filesystem.
    #[context("Loading users and groups")]
    pub fn from_root(root: &Dir) -> Result<Self> {
        Ok(Self::Table {
            users: load_db(root, PASSWD_PATHS)?,
            groups: load_db(root, GROUP_PATHS)?,
        })
    }

    /// Build tables from `passwd` and `group` formatted text.
    pub fn from_contents(passwd: &str, group: &str) -> Self {
        let mut users = HashMap::new();
        let mut groups = HashMap::new();
        parse_db(passwd, &mut users);
        parse_db(group, &mut groups);
        Self::Table { users, groups }
    }

    /// Find the uid for a user name.
    pub fn uid(&self, name: &str) -> crate::Result<u32> {
        if name == "root" {
            return Ok(0);
        }
        let r = match self {
            IdMap::Host => uzers::get_user_by_name(name).map(|u| u.uid()),
            IdMap::Table { users, .. } => users.get(name).copied(),
        };
        r.ok_or_else(|| Error::UnknownUser(name.to_string()))
    }

    /// Find the gid for a group name.
    pub fn gid(&self, name: &str) -> crate::Result<u32> {
        if name == "root" {
            return Ok(0);
        }
        let r = match self {
            IdMap::Host => uzers::get_group_by_name(name).map(|g| g.gid()),
            IdMap::Table { groups, .. } => groups.get(name).copied(),
        };
        r.ok_or_else(|| Error::UnknownGroup(name.to_string()))
    }
}
