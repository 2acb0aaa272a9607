//! Which installed packages own a path.
//!
//! Entries are indexed by basename; each records the owning package and
//! the directory it was declared in.  A query matches an entry when the
//! directories are equal, or when the entry's directory resolves (through
//! symlinks on the live filesystem) to the queried one.  This covers
//! packages that ship files under e.g. `/lib` on a system where `/lib` is a
//! symlink to `usr/lib`.

use std::cell::RefCell;
use std::collections::{BTreeSet, HashMap, VecDeque};

use anyhow::Result;
use camino::{Utf8Component, Utf8Path};
use cap_std::fs::Dir;
use cap_std_ext::cap_std;
use cap_std_ext::dirext::CapStdExtDirExt;
use fn_error_context::context;

use crate::cache;
use crate::relpath;
use crate::repo::Repo;
use crate::rpm::header::{tag, FILESTATE_NOTINSTALLED};
use crate::rpm::Header;
use crate::Error;

/// Maximum number of symlinks followed while resolving one directory.
pub const MAX_SYMLINKS: u32 = 40;

#[derive(Debug, Clone)]
struct Entry {
    pkg: String,
    dirname: String,
}

/// An index from file paths to owning packages.
#[derive(Debug)]
pub struct FileDb {
    root: Dir,
    entries: HashMap<String, Vec<Entry>>,
    /// Directory → its real path below `root`, or `None` if missing.
    resolved: RefCell<HashMap<String, Option<String>>>,
}

impl FileDb {
    /// An empty database; symlinks are resolved relative to `root`.
    pub fn new(root: Dir) -> Self {
        Self {
            root,
            entries: Default::default(),
            resolved: Default::default(),
        }
    }

    /// Record that `pkg` owns `path`.
    pub fn insert_entry(&mut self, pkg: &str, path: &str) -> crate::Result<()> {
        let path = relpath::normalize(path)?;
        if path.is_empty() {
            return Ok(());
        }
        let (dirname, basename) = relpath::split_parent(&path);
        self.entries
            .entry(basename.to_string())
            .or_default()
            .push(Entry {
                pkg: pkg.to_string(),
                dirname: dirname.to_string(),
            });
        Ok(())
    }

    /// Record every installed file of a package.
    pub fn add_header(&mut self, header: &Header) -> Result<()> {
        let pkg = cache::cache_key(&header.nevra()?);
        let paths = header.file_paths()?;
        let states = header.get_u64_array(tag::FILESTATES)?;
        if let Some(states) = states.as_ref() {
            if states.len() != paths.len() {
                return Err(Error::MalformedHeader(format!(
                    "{pkg}: {} file states for {} files",
                    states.len(),
                    paths.len()
                ))
                .into());
            }
        }
        let mut n = 0;
        for (i, path) in paths.iter().enumerate() {
            let state = states.as_ref().map(|s| s[i]).unwrap_or_default();
            if state == FILESTATE_NOTINSTALLED {
                continue;
            }
            self.insert_entry(&pkg, path)?;
            n += 1;
        }
        tracing::trace!("{pkg}: {n} files");
        Ok(())
    }

    /// Build from package headers.
    pub fn from_headers<'h>(
        root: Dir,
        headers: impl IntoIterator<Item = &'h Header>,
    ) -> Result<Self> {
        let mut db = Self::new(root);
        for header in headers {
            db.add_header(header)?;
        }
        Ok(db)
    }

    /// Build from every package recorded in the cache.
    #[context("Loading file database from cache")]
    pub fn from_cache(root: Dir, repo: &dyn Repo) -> Result<Self> {
        let mut db = Self::new(root);
        for (_, commit) in cache::list_cached(repo)? {
            let header = cache::header_from_commit(repo, &commit)?;
            db.add_header(&header)?;
        }
        tracing::debug!("Loaded {} basenames", db.entries.len());
        Ok(db)
    }

    /// Packages owning `path`, sorted.  The directory of `path` is taken
    /// as a real path on the filesystem.
    pub fn find_pkgs_for_file(&self, path: &str) -> crate::Result<Vec<String>> {
        let path = relpath::normalize(path)?;
        let (dirname, basename) = relpath::split_parent(&path);
        let Some(entries) = self.entries.get(basename) else {
            return Ok(Vec::new());
        };
        let mut r = BTreeSet::new();
        for e in entries {
            if r.contains(&e.pkg) {
                continue;
            }
            if self.paths_are_equivalent(&e.dirname, dirname)? {
                r.insert(e.pkg.clone());
            }
        }
        Ok(r.into_iter().collect())
    }

    fn paths_are_equivalent(&self, entry: &str, real: &str) -> crate::Result<bool> {
        if entry == real {
            return Ok(true);
        }
        Ok(self.resolve(entry)?.as_deref() == Some(real))
    }

    /// Resolve the symlinks in a directory path, memoized.
    fn resolve(&self, dir: &str) -> crate::Result<Option<String>> {
        if let Some(r) = self.resolved.borrow().get(dir) {
            return Ok(r.clone());
        }
        let r = self.resolve_uncached(dir)?;
        self.resolved
            .borrow_mut()
            .insert(dir.to_string(), r.clone());
        Ok(r)
    }

    fn resolve_uncached(&self, dir: &str) -> crate::Result<Option<String>> {
        let invalid = |_| Error::InvalidPath(dir.to_string());
        let mut resolved: Vec<String> = Vec::new();
        let mut pending: VecDeque<String> = dir
            .split('/')
            .filter(|c| !c.is_empty())
            .map(ToOwned::to_owned)
            .collect();
        let mut links = 0;
        while let Some(name) = pending.pop_front() {
            match name.as_str() {
                "." => continue,
                ".." => {
                    resolved.pop();
                    continue;
                }
                _ => {}
            }
            let candidate = relpath::join(&resolved.join("/"), &name);
            let Some(meta) = self
                .root
                .symlink_metadata_optional(&candidate)
                .map_err(invalid)?
            else {
                return Ok(None);
            };
            if !meta.file_type().is_symlink() {
                resolved.push(name);
                continue;
            }
            links += 1;
            if links > MAX_SYMLINKS {
                return Err(Error::SymlinkLoop(dir.to_string()));
            }
            let target = self.root.read_link_contents(&candidate).map_err(invalid)?;
            let target = Utf8Path::from_path(&target)
                .ok_or_else(|| Error::InvalidPath(candidate.clone()))?;
            if target.is_absolute() {
                resolved.clear();
            }
            for c in target.components().rev() {
                match c {
                    Utf8Component::Normal(c) => pending.push_front(c.to_string()),
                    Utf8Component::ParentDir => pending.push_front("..".to_string()),
                    _ => {}
                }
            }
        }
        Ok(Some(resolved.join("/")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cap_std_ext::cap_tempfile;

    fn db() -> Result<(cap_tempfile::TempDir, FileDb)> {
        let td = cap_tempfile::TempDir::new(cap_std::ambient_authority())?;
        td.create_dir_all("usr/lib")?;
        td.create_dir_all("usr/bin")?;
        td.symlink_contents("usr/lib", "lib")?;
        td.symlink_contents("/usr/bin", "bin")?;
        td.symlink_contents("loop2", "loop1")?;
        td.symlink_contents("loop1", "loop2")?;
        let mut db = FileDb::new(td.try_clone()?);
        db.insert_entry("glibc-2.39-1.x86_64", "/lib/libc.so.6")?;
        db.insert_entry("bash-5.2-1.x86_64", "/bin/sh")?;
        db.insert_entry("dash-0.5-1.x86_64", "/usr/bin/sh")?;
        db.insert_entry("bash-5.2-1.x86_64", "/usr/bin/bash")?;
        db.insert_entry("bad-1-1.noarch", "/loop1/x")?;
        db.insert_entry("gone-1-1.noarch", "/opt/gone/libc.so.6")?;
        Ok((td, db))
    }

    #[test]
    fn test_find_pkgs() -> Result<()> {
        let (_td, db) = db()?;
        assert_eq!(
            db.find_pkgs_for_file("/usr/lib/libc.so.6")?,
            ["glibc-2.39-1.x86_64"]
        );
        assert_eq!(
            db.find_pkgs_for_file("/usr/bin/sh")?,
            ["bash-5.2-1.x86_64", "dash-0.5-1.x86_64"]
        );
        assert_eq!(db.find_pkgs_for_file("usr/bin/bash")?, ["bash-5.2-1.x86_64"]);
        assert!(db.find_pkgs_for_file("/usr/bin/zsh")?.is_empty());
        assert!(db.find_pkgs_for_file("/etc/libc.so.6")?.is_empty());
        // Memoized
        assert_eq!(db.resolved.borrow().get("lib"), Some(&Some("usr/lib".into())));
        assert_eq!(db.resolved.borrow().get("opt/gone"), Some(&None));
        Ok(())
    }

    #[test]
    fn test_symlink_loop() -> Result<()> {
        let (_td, db) = db()?;
        assert!(matches!(
            db.find_pkgs_for_file("/x"),
            Err(Error::SymlinkLoop(p)) if p == "loop1"
        ));
        Ok(())
    }
}
