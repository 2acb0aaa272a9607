//! Unpack a package payload, either into a directory or into the store.
//!
//! Both modes share one pass over the archive (see [`unpack_entries`]):
//! every entry is checked for cancellation, rejected if it is not a
//! directory, regular file, symlink or hardlink, and combined with the
//! header override for its path.  Hardlinks are collected and created in a
//! second pass, once every possible target has been seen.

use std::io::{self, Read};
use std::os::fd::AsRawFd;

use anyhow::{Context, Result};
use cap_std::fs::{Dir, OpenOptions};
use cap_std_ext::cap_primitives::fs::OpenOptionsExt;
use cap_std_ext::cap_std;
use cap_std_ext::dirext::CapStdExtDirExt;
use fn_error_context::context;
use tokio_util::sync::CancellationToken;

use crate::fscaps::{self, FileCaps};
use crate::idmap::IdMap;
use crate::mtree::{PathTree, SealedTree};
use crate::overrides::{HeaderIndex, HeaderOverride};
use crate::relpath;
use crate::repo::{permissions, DirMeta, FileMeta, Repo};
use crate::rpm::cpio::{S_IFDIR, S_IFLNK, S_IFREG};
use crate::rpm::{self, ArchiveEntry, CpioReader, EntryKind};
use crate::Error;

/// An ordered stream of archive entries.
pub trait EntrySource {
    /// Advance to the next entry.
    fn next_entry(&mut self) -> crate::Result<Option<ArchiveEntry>>;
    /// Content of the current regular file entry.
    fn content(&mut self) -> &mut dyn Read;
}

impl<R: Read> EntrySource for CpioReader<R> {
    fn next_entry(&mut self) -> crate::Result<Option<ArchiveEntry>> {
        CpioReader::next_entry(self)
    }

    fn content(&mut self) -> &mut dyn Read {
        self
    }
}

/// Options for unpacking.
#[derive(Debug, Default, Clone)]
#[non_exhaustive]
pub struct UnpackOptions {
    /// Apply header ownership when unpacking to a directory.  Ownership
    /// is always recorded when unpacking to the store.
    pub owner: bool,
    /// Keep set-id and sticky bits and apply file capabilities when
    /// unpacking to a directory.
    pub suid_fscaps: bool,
    /// Resolution of user and group names.
    pub idmap: IdMap,
    /// Checked before every entry and between content chunks.
    pub cancellable: Option<CancellationToken>,
}

/// Counters for one unpack.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct UnpackStats {
    /// Directories
    pub dirs: u32,
    /// Regular files
    pub regfiles: u32,
    /// Symbolic links
    pub symlinks: u32,
    /// Hardlinks
    pub hardlinks: u32,
    /// Bytes of regular file content
    pub bytes: u64,
}

/// Where unpacked entries go.
pub trait UnpackTarget {
    /// Create or update a directory.
    fn directory(&mut self, entry: &ArchiveEntry, ovr: Option<&HeaderOverride>) -> Result<()>;
    /// Create a regular file with content read from `content`.
    fn regular(
        &mut self,
        entry: &ArchiveEntry,
        ovr: Option<&HeaderOverride>,
        content: &mut dyn Read,
    ) -> Result<()>;
    /// Create a symbolic link.
    fn symlink(
        &mut self,
        entry: &ArchiveEntry,
        target: &str,
        ovr: Option<&HeaderOverride>,
    ) -> Result<()>;
    /// Create `path` as another name for the regular file at `target`.
    fn hardlink(&mut self, path: &str, target: &str) -> Result<()>;
}

fn check_cancelled(c: Option<&CancellationToken>) -> crate::Result<()> {
    match c {
        Some(c) if c.is_cancelled() => Err(Error::Cancelled),
        _ => Ok(()),
    }
}

/// Fails reads once the token is cancelled.
struct CancellableReader<'a> {
    inner: &'a mut dyn Read,
    cancellable: Option<&'a CancellationToken>,
    bytes: u64,
}

impl Read for CancellableReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        check_cancelled(self.cancellable).map_err(Error::into_io)?;
        let n = self.inner.read(buf)?;
        self.bytes += n as u64;
        Ok(n)
    }
}

/// Resolve the owner of an entry: names from the header override if any,
/// otherwise the numeric ids recorded in the archive.
fn resolve_owner(
    idmap: &IdMap,
    entry: &ArchiveEntry,
    ovr: Option<&HeaderOverride>,
) -> crate::Result<(u32, u32)> {
    match ovr {
        Some(o) => Ok((idmap.uid(&o.user)?, idmap.gid(&o.group)?)),
        None => Ok((entry.uid, entry.gid)),
    }
}

fn capabilities(ovr: Option<&HeaderOverride>) -> crate::Result<Option<FileCaps>> {
    ovr.and_then(|o| o.capabilities.as_deref())
        .map(|c| c.parse::<FileCaps>())
        .transpose()
        .map(|c| c.filter(|c| !c.is_empty()))
}

/// The shared unpack loop.
#[tracing::instrument(level = "debug", skip_all)]
pub fn unpack_entries(
    src: &mut dyn EntrySource,
    index: &HeaderIndex,
    cancellable: Option<&CancellationToken>,
    target: &mut dyn UnpackTarget,
) -> Result<UnpackStats> {
    let mut stats = UnpackStats::default();
    let mut hardlinks = Vec::new();
    loop {
        check_cancelled(cancellable)?;
        let Some(entry) = src.next_entry()? else {
            break;
        };
        tracing::trace!("{} {:?} {:o}", entry.path, entry.kind, entry.mode);
        if entry.path.is_empty() && entry.kind != EntryKind::Directory {
            return Err(Error::InvalidParent(".".into()).into());
        }
        let ovr = index.lookup(&entry.path);
        match &entry.kind {
            EntryKind::Other(_) => return Err(Error::UnsupportedFileType(entry.path).into()),
            EntryKind::Hardlink(t) => {
                hardlinks.push((entry.path.clone(), t.clone()));
                continue;
            }
            EntryKind::Directory => {
                target.directory(&entry, ovr)?;
                stats.dirs += 1;
            }
            EntryKind::Regular => {
                let mut content = CancellableReader {
                    inner: src.content(),
                    cancellable,
                    bytes: 0,
                };
                target
                    .regular(&entry, ovr, &mut content)
                    .with_context(|| format!("Processing {}", entry.path))?;
                stats.regfiles += 1;
                stats.bytes += content.bytes;
            }
            EntryKind::Symlink(t) => {
                target.symlink(&entry, t, ovr)?;
                stats.symlinks += 1;
            }
        }
    }
    for (path, t) in hardlinks {
        check_cancelled(cancellable)?;
        target.hardlink(&path, &t)?;
        stats.hardlinks += 1;
    }
    tracing::debug!("Unpacked: {stats:?}");
    Ok(stats)
}

/// Unpacks into a directory on the local filesystem.
#[derive(Debug)]
pub struct DirTarget<'a> {
    dir: &'a Dir,
    opts: &'a UnpackOptions,
}

impl<'a> DirTarget<'a> {
    /// Unpack into `dir`.
    pub fn new(dir: &'a Dir, opts: &'a UnpackOptions) -> Self {
        Self { dir, opts }
    }

    fn ensure_parent(&self, path: &str) -> Result<()> {
        let (parent, _) = relpath::split_parent(path);
        if !parent.is_empty() {
            self.dir.create_dir_all(parent).map_err(|e| {
                if e.kind() == io::ErrorKind::AlreadyExists
                    || e.raw_os_error() == Some(libc::ENOTDIR)
                {
                    anyhow::Error::new(Error::InvalidParent(path.to_string()))
                } else {
                    anyhow::Error::new(e).context(format!("Creating {parent}"))
                }
            })?;
        }
        Ok(())
    }

    fn chown(&self, path: &str, entry: &ArchiveEntry, ovr: Option<&HeaderOverride>) -> Result<()> {
        if !self.opts.owner {
            return Ok(());
        }
        let (uid, gid) = resolve_owner(&self.opts.idmap, entry, ovr)?;
        nix::unistd::fchownat(
            Some(self.dir.as_raw_fd()),
            path,
            Some(nix::unistd::Uid::from_raw(uid)),
            Some(nix::unistd::Gid::from_raw(gid)),
            nix::unistd::FchownatFlags::NoFollowSymlink,
        )
        .with_context(|| format!("Setting owner of {path}"))?;
        Ok(())
    }

    fn mode(&self, mode: u32) -> u32 {
        if self.opts.suid_fscaps {
            mode
        } else {
            mode & 0o777
        }
    }
}

fn exists_error(path: &str) -> impl FnOnce(io::Error) -> anyhow::Error + '_ {
    move |e| {
        if e.kind() == io::ErrorKind::AlreadyExists {
            Error::AlreadyExists(path.to_string()).into()
        } else {
            anyhow::Error::new(e).context(format!("Creating {path}"))
        }
    }
}

impl UnpackTarget for DirTarget<'_> {
    fn directory(&mut self, entry: &ArchiveEntry, ovr: Option<&HeaderOverride>) -> Result<()> {
        let path = entry.path.as_str();
        // The root is the caller's directory
        if path.is_empty() {
            return Ok(());
        }
        self.ensure_parent(path)?;
        match self.dir.create_dir(path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                if !self.dir.symlink_metadata(path)?.is_dir() {
                    return Err(Error::AlreadyExists(path.to_string()).into());
                }
            }
            Err(e) => return Err(anyhow::Error::new(e).context(format!("Creating {path}"))),
        }
        self.chown(path, entry, ovr)?;
        self.dir
            .set_permissions(path, permissions(self.mode(entry.mode) | 0o700))?;
        Ok(())
    }

    fn regular(
        &mut self,
        entry: &ArchiveEntry,
        ovr: Option<&HeaderOverride>,
        content: &mut dyn Read,
    ) -> Result<()> {
        let path = entry.path.as_str();
        self.ensure_parent(path)?;
        let mut opts = OpenOptions::new();
        opts.write(true);
        opts.create_new(true);
        opts.mode(0o600);
        opts.custom_flags(libc::O_NOFOLLOW);
        let mut f = self
            .dir
            .open_with(path, &opts)
            .map_err(exists_error(path))?;
        io::copy(content, &mut f)?;
        self.chown(path, entry, ovr)?;
        f.set_permissions(permissions(self.mode(entry.mode)))?;
        if self.opts.suid_fscaps {
            if let Some(caps) = capabilities(ovr)? {
                rustix::fs::fsetxattr(
                    &f,
                    fscaps::XATTR_NAME,
                    &caps.to_xattr(),
                    rustix::fs::XattrFlags::empty(),
                )
                .with_context(|| format!("Setting capabilities on {path}"))?;
            }
        }
        Ok(())
    }

    fn symlink(
        &mut self,
        entry: &ArchiveEntry,
        target: &str,
        ovr: Option<&HeaderOverride>,
    ) -> Result<()> {
        let path = entry.path.as_str();
        self.ensure_parent(path)?;
        self.dir
            .symlink_contents(target, path)
            .map_err(exists_error(path))?;
        self.chown(path, entry, ovr)
    }

    fn hardlink(&mut self, path: &str, target: &str) -> Result<()> {
        let meta = self
            .dir
            .symlink_metadata_optional(target)?
            .ok_or_else(|| Error::HardlinkTargetMissing(target.to_string()))?;
        if meta.is_dir() {
            return Err(Error::HardlinkTargetIsDirectory(target.to_string()).into());
        }
        if !meta.is_file() {
            return Err(Error::HardlinkTargetNotRegular(target.to_string()).into());
        }
        self.ensure_parent(path)?;
        self.dir
            .hard_link(target, self.dir, path)
            .map_err(exists_error(path))?;
        Ok(())
    }
}

/// Unpacks into the object store, building a [`PathTree`].
#[derive(Debug)]
pub struct RepoTarget<'a> {
    repo: &'a dyn Repo,
    tree: PathTree,
    opts: &'a UnpackOptions,
    /// Directory metadata already written, keyed by (uid, gid, mode).
    dirmeta_cache: std::collections::HashMap<(u32, u32, u32), String>,
}

impl<'a> RepoTarget<'a> {
    /// Create a target with an empty tree; a transaction must be active.
    pub fn new(repo: &'a dyn Repo, opts: &'a UnpackOptions) -> Result<Self> {
        Ok(Self {
            repo,
            tree: PathTree::new(repo)?,
            opts,
            dirmeta_cache: Default::default(),
        })
    }

    /// Write the finished tree to the store.
    pub fn seal(self) -> Result<SealedTree> {
        self.tree.seal(self.repo)
    }

    fn dirmeta(&mut self, meta: DirMeta) -> Result<String> {
        let key = (meta.uid, meta.gid, meta.mode);
        if let Some(c) = self.dirmeta_cache.get(&key) {
            return Ok(c.clone());
        }
        let c = self.repo.write_dirmeta(&meta)?;
        self.dirmeta_cache.insert(key, c.clone());
        Ok(c)
    }
}

impl UnpackTarget for RepoTarget<'_> {
    fn directory(&mut self, entry: &ArchiveEntry, ovr: Option<&HeaderOverride>) -> Result<()> {
        let (uid, gid) = resolve_owner(&self.opts.idmap, entry, ovr)?;
        let checksum = self.dirmeta(DirMeta::new(uid, gid, S_IFDIR | entry.mode))?;
        let dir = if entry.path.is_empty() {
            self.tree.root()
        } else {
            let parent = self.tree.ensure_parents(&entry.path)?;
            let (_, name) = relpath::split_parent(&entry.path);
            self.tree.ensure_dir(parent, name)?
        };
        self.tree.set_dir_metadata(dir, &checksum);
        Ok(())
    }

    fn regular(
        &mut self,
        entry: &ArchiveEntry,
        ovr: Option<&HeaderOverride>,
        content: &mut dyn Read,
    ) -> Result<()> {
        let parent = self.tree.ensure_parents(&entry.path)?;
        let (uid, gid) = resolve_owner(&self.opts.idmap, entry, ovr)?;
        let mut meta = FileMeta::new(uid, gid, S_IFREG | entry.mode);
        if let Some(caps) = capabilities(ovr)? {
            meta.set_xattr(fscaps::XATTR_NAME, &caps.to_xattr());
        }
        let checksum = self.repo.write_content(&meta, content, entry.size)?;
        let (_, name) = relpath::split_parent(&entry.path);
        self.tree.put_file(parent, name, &checksum)?;
        Ok(())
    }

    fn symlink(
        &mut self,
        entry: &ArchiveEntry,
        target: &str,
        ovr: Option<&HeaderOverride>,
    ) -> Result<()> {
        let parent = self.tree.ensure_parents(&entry.path)?;
        let (uid, gid) = resolve_owner(&self.opts.idmap, entry, ovr)?;
        let meta = FileMeta::new(uid, gid, S_IFLNK | entry.mode);
        let (_, name) = relpath::split_parent(&entry.path);
        self.tree.put_symlink(self.repo, parent, name, target, &meta)?;
        Ok(())
    }

    fn hardlink(&mut self, path: &str, target: &str) -> Result<()> {
        let checksum = self.tree.resolve_hardlink_source(target)?;
        let parent = self.tree.ensure_parents(path)?;
        let (_, name) = relpath::split_parent(path);
        self.tree.put_file(parent, name, &checksum)?;
        Ok(())
    }
}

/// Unpack an entry stream into a directory.
pub fn unpack_to_dir(
    src: &mut dyn EntrySource,
    index: &HeaderIndex,
    dir: &Dir,
    opts: &UnpackOptions,
) -> Result<UnpackStats> {
    let mut target = DirTarget::new(dir, opts);
    unpack_entries(src, index, opts.cancellable.as_ref(), &mut target)
}

/// Unpack an entry stream into the store, returning the sealed tree.  A
/// transaction must be active.
pub fn unpack_to_tree(
    src: &mut dyn EntrySource,
    index: &HeaderIndex,
    repo: &dyn Repo,
    opts: &UnpackOptions,
) -> Result<(SealedTree, UnpackStats)> {
    let mut target = RepoTarget::new(repo, opts)?;
    let stats = unpack_entries(src, index, opts.cancellable.as_ref(), &mut target)?;
    let sealed = target.seal()?;
    Ok((sealed, stats))
}

/// Unpack a complete package file into a directory.  On failure, whatever
/// was already written is left in place.
#[context("Unpacking package")]
pub fn unpack_package_to_dir(
    src: impl Read + Send,
    dir: &Dir,
    opts: &UnpackOptions,
) -> Result<UnpackStats> {
    let mut pkg = rpm::open(src)?;
    let index = HeaderIndex::build(&pkg.header)?;
    tracing::debug!("Unpacking {}", pkg.header.nevra()?);
    unpack_to_dir(&mut pkg.archive, &index, dir, opts)
}
