//! The content-addressed object store that imported packages are written to.
//!
//! The store holds four kinds of objects, all addressed by the SHA-256 of
//! their serialized form: file content (with ownership, mode and extended
//! attributes), directory metadata, directory trees and commits.  Named
//! refs point at commits.
//!
//! Writes happen inside a transaction; objects staged by a transaction that
//! is aborted (or never committed) are discarded.

use std::collections::BTreeMap;
use std::fmt;
use std::io::Read;

use anyhow::{anyhow, Result};
use cap_std::fs::Dir;
use cap_std_ext::cap_std;
use fn_error_context::context;
use serde::{Deserialize, Serialize};

mod fsrepo;
pub use fsrepo::*;

/// Object kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectType {
    /// File content and metadata
    File,
    /// Directory metadata
    DirMeta,
    /// Directory listing
    DirTree,
    /// A commit
    Commit,
}

impl ObjectType {
    /// Filename extension for objects of this type.
    pub fn extension(&self) -> &'static str {
        match self {
            ObjectType::File => "file",
            ObjectType::DirMeta => "dirmeta",
            ObjectType::DirTree => "dirtree",
            ObjectType::Commit => "commit",
        }
    }
}

/// Extended attributes, with hex encoded values.
pub type Xattrs = BTreeMap<String, String>;

/// Ownership, mode and extended attributes of a file.  The mode includes
/// the file type bits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMeta {
    /// Owner
    pub uid: u32,
    /// Group
    pub gid: u32,
    /// Full mode, including `S_IFMT` bits
    pub mode: u32,
    /// Extended attributes
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub xattrs: Xattrs,
}

/// Directory metadata; same shape as [`FileMeta`].
pub type DirMeta = FileMeta;

impl FileMeta {
    /// Metadata without extended attributes.
    pub fn new(uid: u32, gid: u32, mode: u32) -> Self {
        Self {
            uid,
            gid,
            mode,
            xattrs: Default::default(),
        }
    }

    /// Set an extended attribute.
    pub fn set_xattr(&mut self, name: &str, value: &[u8]) {
        self.xattrs.insert(name.to_string(), hex::encode(value));
    }

    /// Get a decoded extended attribute.
    pub fn xattr(&self, name: &str) -> Result<Option<Vec<u8>>> {
        self.xattrs
            .get(name)
            .map(|v| hex::decode(v).map_err(|e| anyhow!("Invalid xattr {name}: {e}")))
            .transpose()
    }
}

/// The entries of one directory.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirTree {
    /// Non-directories: name → content checksum
    pub files: BTreeMap<String, String>,
    /// Subdirectories: name → (dirtree checksum, dirmeta checksum)
    pub dirs: BTreeMap<String, (String, String)>,
}

/// A commit: a root tree plus metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commit {
    /// Parent commit, if any
    pub parent: Option<String>,
    /// Subject line
    pub subject: String,
    /// Body text
    pub body: String,
    /// Seconds since the epoch
    pub timestamp: u64,
    /// Checksum of the root dirtree
    pub root_tree: String,
    /// Checksum of the root dirmeta
    pub root_meta: String,
    /// Arbitrary string metadata
    pub metadata: BTreeMap<String, String>,
}

/// The content of a file object.
pub enum Content {
    /// Regular file data
    Regular(Box<dyn Read + Send>),
    /// Symbolic link target
    Symlink(String),
}

impl fmt::Debug for Content {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Content::Regular(_) => f.write_str("Regular"),
            Content::Symlink(t) => f.debug_tuple("Symlink").field(t).finish(),
        }
    }
}

/// Interface to an object store.
pub trait Repo: Send + Sync + fmt::Debug {
    /// Begin a transaction for the calling thread; object writes require
    /// one.  Transactions of different threads are independent.
    fn prepare_transaction(&self) -> Result<()>;
    /// Make staged objects and ref updates visible.
    fn commit_transaction(&self) -> Result<()>;
    /// Discard staged objects and ref updates.
    fn abort_transaction(&self) -> Result<()>;
    /// Store directory metadata, returning its checksum.
    fn write_dirmeta(&self, meta: &DirMeta) -> Result<String>;
    /// Store a regular file of `size` bytes read from `content`.
    fn write_content(&self, meta: &FileMeta, content: &mut dyn Read, size: u64)
        -> Result<String>;
    /// Store a symbolic link.
    fn write_symlink(&self, meta: &FileMeta, target: &str) -> Result<String>;
    /// Store a directory listing.
    fn write_dirtree(&self, tree: &DirTree) -> Result<String>;
    /// Store a commit.
    fn write_commit(&self, commit: &Commit) -> Result<String>;
    /// Point a ref at a commit, or delete it.  Inside a transaction the
    /// update is applied when the transaction commits.
    fn set_ref(&self, name: &str, commit: Option<&str>) -> Result<()>;
    /// Find the commit a ref points to.
    fn resolve_ref(&self, name: &str) -> Result<Option<String>>;
    /// All refs whose name starts with `prefix`.
    fn list_refs(&self, prefix: &str) -> Result<BTreeMap<String, String>>;
    /// Whether an object exists (including staged objects of the current
    /// transaction).
    fn has_object(&self, kind: ObjectType, checksum: &str) -> Result<bool>;
    /// Load a commit.
    fn read_commit(&self, checksum: &str) -> Result<Commit>;
    /// Load a directory listing.
    fn read_dirtree(&self, checksum: &str) -> Result<DirTree>;
    /// Load directory metadata.
    fn read_dirmeta(&self, checksum: &str) -> Result<DirMeta>;
    /// Load a file object.
    fn read_content(&self, checksum: &str) -> Result<(FileMeta, Content)>;
}

/// A transaction that is aborted when dropped, unless committed.
#[derive(Debug)]
pub struct AutoTransaction<'a> {
    repo: Option<&'a dyn Repo>,
}

impl<'a> AutoTransaction<'a> {
    /// Begin a transaction.
    pub fn new(repo: &'a dyn Repo) -> Result<Self> {
        repo.prepare_transaction()?;
        Ok(Self { repo: Some(repo) })
    }

    /// Commit the transaction.
    pub fn commit(mut self) -> Result<()> {
        if let Some(repo) = self.repo.take() {
            repo.commit_transaction()?;
        }
        Ok(())
    }
}

impl Drop for AutoTransaction<'_> {
    fn drop(&mut self) {
        if let Some(repo) = self.repo.take() {
            if let Err(e) = repo.abort_transaction() {
                tracing::warn!("Failed to abort transaction: {e:#}");
            }
        }
    }
}

/// Check that `input` is a SHA-256 checksum in lowercase hex.
pub fn validate_sha256(input: &str) -> Result<()> {
    if input.len() != 64 {
        return Err(anyhow!("Invalid sha256 checksum (len) {}", input));
    }
    if !input.chars().all(|c| matches!(c, '0'..='9' | 'a'..='f')) {
        return Err(anyhow!("Invalid sha256 checksum {}", input));
    }
    Ok(())
}

pub(crate) fn permissions(mode: u32) -> cap_std::fs::Permissions {
    use std::os::unix::prelude::PermissionsExt;
    cap_std::fs::Permissions::from_std(std::fs::Permissions::from_mode(mode & 0o7777))
}

fn checkout_tree(repo: &dyn Repo, tree: &DirTree, dest: &Dir) -> Result<()> {
    for (name, checksum) in tree.files.iter() {
        let (meta, content) = repo.read_content(checksum)?;
        match content {
            Content::Symlink(target) => dest.symlink_contents(target, name)?,
            Content::Regular(mut r) => {
                let mut f = dest.create(name)?;
                std::io::copy(&mut r, &mut f)?;
                f.set_permissions(permissions(meta.mode))?;
            }
        }
    }
    for (name, (tree, meta)) in tree.dirs.iter() {
        let meta = repo.read_dirmeta(meta)?;
        let tree = repo.read_dirtree(tree)?;
        dest.create_dir(name)?;
        let subdir = dest.open_dir(name)?;
        checkout_tree(repo, &tree, &subdir)?;
        dest.set_permissions(name, permissions(meta.mode))?;
    }
    Ok(())
}

/// Write the tree of a commit into an empty directory.  Ownership is not
/// applied; modes are.
#[context("Checking out {commit}")]
pub fn checkout(repo: &dyn Repo, commit: &str, dest: &Dir) -> Result<()> {
    let commit = repo.read_commit(commit)?;
    let tree = repo.read_dirtree(&commit.root_tree)?;
    checkout_tree(repo, &tree, dest)
}
