//! In-memory mutable tree, built up while unpacking and then written to
//! the store bottom-up as dirtree objects.
//!
//! Directories live in an arena and refer to their children by index.
//! Leaves are content checksums, tagged as regular files or symlinks.

use std::collections::BTreeMap;

use anyhow::Result;

use crate::relpath;
use crate::repo::{DirMeta, DirTree, FileMeta, Repo};
use crate::Error;

/// Full mode of directories created implicitly.
pub const DEFAULT_DIRMODE: u32 = libc::S_IFDIR | 0o755;

/// A reference to a directory in a [`PathTree`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirHandle(usize);

/// The kind of a leaf in a [`PathTree`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeafKind {
    /// A regular file
    Regular,
    /// A symbolic link
    Symlink,
}

/// Result of [`PathTree::lookup`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathLookup {
    /// A leaf with this content checksum
    File(String, LeafKind),
    /// A directory
    Directory(DirHandle),
    /// Nothing at this path
    Absent,
}

/// The store checksums for a sealed tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealedTree {
    /// Root dirtree
    pub tree: String,
    /// Root dirmeta
    pub meta: String,
}

#[derive(Debug)]
struct DirNode {
    path: String,
    meta: String,
    dirs: BTreeMap<String, usize>,
    files: BTreeMap<String, (String, LeafKind)>,
}

/// A mutable directory tree.
#[derive(Debug)]
pub struct PathTree {
    nodes: Vec<DirNode>,
    default_dirmeta: String,
}

/// The metadata used for directories the archive does not describe.
pub fn default_dirmeta() -> DirMeta {
    DirMeta::new(0, 0, DEFAULT_DIRMODE)
}

impl PathTree {
    /// Create an empty tree; this writes the default directory metadata
    /// object, so a transaction must be active.
    pub fn new(repo: &dyn Repo) -> Result<Self> {
        let default_dirmeta = repo.write_dirmeta(&default_dirmeta())?;
        let mut r = Self {
            nodes: Vec::new(),
            default_dirmeta,
        };
        r.new_node(String::new());
        Ok(r)
    }

    fn new_node(&mut self, path: String) -> usize {
        self.nodes.push(DirNode {
            path,
            meta: self.default_dirmeta.clone(),
            dirs: Default::default(),
            files: Default::default(),
        });
        self.nodes.len() - 1
    }

    /// The root directory.
    pub fn root(&self) -> DirHandle {
        DirHandle(0)
    }

    /// Number of directories.
    pub fn n_dirs(&self) -> usize {
        self.nodes.len()
    }

    /// Ensure every ancestor of the normalized `path` exists as a
    /// directory, creating missing ones with the default metadata.
    /// Returns the immediate parent.
    pub fn ensure_parents(&mut self, path: &str) -> crate::Result<DirHandle> {
        let (parent, _) = relpath::split_parent(path);
        let mut cur = self.root();
        if parent.is_empty() {
            return Ok(cur);
        }
        for name in parent.split('/') {
            if self.nodes[cur.0].files.contains_key(name) {
                return Err(Error::InvalidParent(path.to_string()));
            }
            cur = self.ensure_dir(cur, name)?;
        }
        Ok(cur)
    }

    /// Find or create the subdirectory `name` of `parent`.
    pub fn ensure_dir(&mut self, parent: DirHandle, name: &str) -> crate::Result<DirHandle> {
        let node = &self.nodes[parent.0];
        if node.files.contains_key(name) {
            return Err(Error::AlreadyExists(relpath::join(&node.path, name)));
        }
        if let Some(&idx) = node.dirs.get(name) {
            return Ok(DirHandle(idx));
        }
        let path = relpath::join(&node.path, name);
        let idx = self.new_node(path);
        self.nodes[parent.0].dirs.insert(name.to_string(), idx);
        Ok(DirHandle(idx))
    }

    /// Replace the metadata of a directory; its children are kept.
    pub fn set_dir_metadata(&mut self, dir: DirHandle, checksum: &str) {
        let node = &mut self.nodes[dir.0];
        if node.meta != checksum {
            node.meta = checksum.to_string();
        }
    }

    fn put_leaf(
        &mut self,
        parent: DirHandle,
        name: &str,
        checksum: &str,
        kind: LeafKind,
    ) -> crate::Result<()> {
        let node = &mut self.nodes[parent.0];
        if node.dirs.contains_key(name) || node.files.contains_key(name) {
            return Err(Error::AlreadyExists(relpath::join(&node.path, name)));
        }
        node.files
            .insert(name.to_string(), (checksum.to_string(), kind));
        Ok(())
    }

    /// Add a regular file leaf.  Fails if `name` already exists.
    pub fn put_file(&mut self, parent: DirHandle, name: &str, checksum: &str) -> crate::Result<()> {
        self.put_leaf(parent, name, checksum, LeafKind::Regular)
    }

    /// Write a symlink object and add it as a leaf.
    pub fn put_symlink(
        &mut self,
        repo: &dyn Repo,
        parent: DirHandle,
        name: &str,
        target: &str,
        meta: &FileMeta,
    ) -> Result<String> {
        let checksum = repo.write_symlink(meta, target)?;
        self.put_leaf(parent, name, &checksum, LeafKind::Symlink)?;
        Ok(checksum)
    }

    /// Look up a normalized path.
    pub fn lookup(&self, path: &str) -> PathLookup {
        let mut cur = 0;
        if path.is_empty() {
            return PathLookup::Directory(DirHandle(cur));
        }
        let mut components = path.split('/').peekable();
        while let Some(name) = components.next() {
            let node = &self.nodes[cur];
            if let Some(&idx) = node.dirs.get(name) {
                cur = idx;
                continue;
            }
            return match node.files.get(name) {
                Some((checksum, kind)) if components.peek().is_none() => {
                    PathLookup::File(checksum.clone(), *kind)
                }
                _ => PathLookup::Absent,
            };
        }
        PathLookup::Directory(DirHandle(cur))
    }

    /// Find the content checksum that a hardlink to `target` should share;
    /// `target` must be a regular file.
    pub fn resolve_hardlink_source(&self, target: &str) -> crate::Result<String> {
        match self.lookup(target) {
            PathLookup::File(checksum, LeafKind::Regular) => Ok(checksum),
            PathLookup::File(_, LeafKind::Symlink) => {
                Err(Error::HardlinkTargetNotRegular(target.to_string()))
            }
            PathLookup::Directory(_) => Err(Error::HardlinkTargetIsDirectory(target.to_string())),
            PathLookup::Absent => Err(Error::HardlinkTargetMissing(target.to_string())),
        }
    }

    /// Write all directories to the store, leaves first.
    #[tracing::instrument(level = "debug", skip_all)]
    pub fn seal(&self, repo: &dyn Repo) -> Result<SealedTree> {
        // Children are always created after their parent, so walking the
        // arena backwards visits them first.
        let mut sealed: Vec<Option<String>> = vec![None; self.nodes.len()];
        for (idx, node) in self.nodes.iter().enumerate().rev() {
            let mut tree = DirTree {
                files: node
                    .files
                    .iter()
                    .map(|(name, (checksum, _))| (name.clone(), checksum.clone()))
                    .collect(),
                dirs: BTreeMap::new(),
            };
            for (name, &child) in node.dirs.iter() {
                let checksum = sealed[child]
                    .take()
                    .ok_or_else(|| anyhow::anyhow!("Directory {name} sealed out of order"))?;
                tree.dirs
                    .insert(name.clone(), (checksum, self.nodes[child].meta.clone()));
            }
            sealed[idx] = Some(repo.write_dirtree(&tree)?);
        }
        let tree = sealed[0]
            .take()
            .ok_or_else(|| anyhow::anyhow!("Empty tree"))?;
        tracing::debug!("Sealed {} directories", self.nodes.len());
        Ok(SealedTree {
            tree,
            meta: self.nodes[0].meta.clone(),
        })
    }
}
