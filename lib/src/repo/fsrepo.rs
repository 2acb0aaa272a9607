//! A simple on-disk object store.
//!
//! Layout:
//!
//! - `config`: TOML, `[core] repo_version = 1`
//! - `objects/xx/<rest>.{file,dirmeta,dirtree,commit}`: objects, named by
//!   their SHA-256
//! - `refs/heads/<name>`: one commit checksum per ref
//! - `tmp/`: one staging directory per open transaction
//!
//! A transaction belongs to the thread which prepared it, so imports on
//! different threads stage and commit independently, through one handle
//! or several.  Identical objects committed twice are the same file.
//!
//! File objects are an 8 byte big endian length, a JSON header carrying the
//! metadata (and symlink target), then the file content.  The other object
//! kinds are plain JSON.

use std::collections::{BTreeMap, HashMap};
use std::io::{self, Read, Write};
use std::sync::{Mutex, MutexGuard};
use std::thread::{self, ThreadId};

use anyhow::{anyhow, Context, Result};
use camino::Utf8Path;
use cap_std::fs::Dir;
use cap_std_ext::cap_std;
use cap_std_ext::cap_tempfile::{self, TempFile};
use cap_std_ext::dirext::CapStdExtDirExt;
use fn_error_context::context;
use openssl::hash::{Hasher, MessageDigest};
use serde::{Deserialize, Serialize};

use super::*;

const CONFIG: &str = "config";
const OBJECTS: &str = "objects";
const REFS: &str = "refs/heads";
const TMP: &str = "tmp";
const REPO_VERSION: u32 = 1;
/// Limit on metadata objects and file object headers.
const MAX_METADATA_SIZE: u64 = 10 * 1024 * 1024;

#[derive(Debug, Serialize, Deserialize)]
struct RepoConfig {
    core: CoreConfig,
}

#[derive(Debug, Serialize, Deserialize)]
struct CoreConfig {
    repo_version: u32,
}

#[derive(Debug, Serialize, Deserialize)]
struct ContentHeader {
    #[serde(flatten)]
    meta: FileMeta,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    symlink: Option<String>,
}

#[derive(Debug)]
struct Transaction {
    staging: cap_tempfile::TempDir,
    staged: Vec<(ObjectType, String)>,
    refs: BTreeMap<String, Option<String>>,
}

/// An object store in a local directory.
#[derive(Debug)]
pub struct FsRepo {
    dir: Dir,
    /// Open transactions, keyed by the thread that prepared them.
    txns: Mutex<HashMap<ThreadId, Transaction>>,
}

fn object_path(kind: ObjectType, checksum: &str) -> String {
    format!(
        "{OBJECTS}/{}/{}.{}",
        &checksum[..2],
        &checksum[2..],
        kind.extension()
    )
}

fn staged_name(kind: ObjectType, checksum: &str) -> String {
    format!("{checksum}.{}", kind.extension())
}

fn ref_path(name: &str) -> Result<String> {
    if name.is_empty()
        || name.starts_with('.')
        || name.contains(['/', '\0'])
        || name.chars().any(|c| c.is_ascii_whitespace())
    {
        return Err(anyhow!("Invalid ref name {name:?}"));
    }
    Ok(format!("{REFS}/{name}"))
}

fn sha256_hex(hasher: &mut Hasher) -> Result<String> {
    Ok(hex::encode(&*hasher.finish()?))
}

impl FsRepo {
    /// Open an existing repository.
    #[context("Opening repository {path}")]
    pub fn open(path: &Utf8Path) -> Result<Self> {
        let dir = Dir::open_ambient_dir(path, cap_std::ambient_authority())?;
        Self::open_at(dir)
    }

    /// Open a repository, initializing it first if `path` does not
    /// contain one.
    #[context("Creating repository {path}")]
    pub fn open_or_create(path: &Utf8Path) -> Result<Self> {
        std::fs::create_dir_all(path)?;
        let dir = Dir::open_ambient_dir(path, cap_std::ambient_authority())?;
        Self::create_at(dir)
    }

    /// Open the repository in a directory.
    pub fn open_at(dir: Dir) -> Result<Self> {
        let config = dir
            .read_to_string(CONFIG)
            .context("Reading repository config")?;
        let config: RepoConfig = toml::from_str(&config).context("Parsing repository config")?;
        if config.core.repo_version != REPO_VERSION {
            anyhow::bail!(
                "Unsupported repository version {}",
                config.core.repo_version
            );
        }
        Ok(Self {
            dir,
            txns: Default::default(),
        })
    }

    /// Initialize a repository in a directory; an existing one is opened.
    pub fn create_at(dir: Dir) -> Result<Self> {
        if dir.try_exists(CONFIG)? {
            return Self::open_at(dir);
        }
        for d in [OBJECTS, REFS, TMP] {
            dir.create_dir_all(d)?;
        }
        let config = RepoConfig {
            core: CoreConfig {
                repo_version: REPO_VERSION,
            },
        };
        dir.atomic_write(CONFIG, toml::to_string(&config)?)?;
        tracing::debug!("Initialized repository");
        Self::open_at(dir)
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ThreadId, Transaction>> {
        self.txns.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// The staging directory of the calling thread's transaction.
    fn current_staging(&self) -> Result<Option<Dir>> {
        let txns = self.lock();
        let Some(txn) = txns.get(&thread::current().id()) else {
            return Ok(None);
        };
        Ok(Some(txn.staging.try_clone()?))
    }

    fn staging_dir(&self) -> Result<Dir> {
        self.current_staging()?
            .ok_or_else(|| anyhow!("No transaction is active"))
    }

    /// Whether an object is committed, or staged by the calling thread.
    fn object_exists(&self, kind: ObjectType, checksum: &str) -> Result<bool> {
        validate_sha256(checksum)?;
        if self.dir.try_exists(object_path(kind, checksum))? {
            return Ok(true);
        }
        match self.current_staging()? {
            Some(staging) => Ok(staging.try_exists(staged_name(kind, checksum))?),
            None => Ok(false),
        }
    }

    fn open_object(&self, kind: ObjectType, checksum: &str) -> Result<cap_std::fs::File> {
        validate_sha256(checksum)?;
        if let Some(f) = self.dir.open_optional(object_path(kind, checksum))? {
            return Ok(f);
        }
        if let Some(staging) = self.current_staging()? {
            if let Some(f) = staging.open_optional(staged_name(kind, checksum))? {
                return Ok(f);
            }
        }
        Err(anyhow!("No such {} object: {checksum}", kind.extension()))
    }

    /// Move a finished temporary file into the staging area under its
    /// checksum, unless an identical object already exists.
    fn finish_object(&self, kind: ObjectType, checksum: &str, tf: TempFile) -> Result<()> {
        if self.object_exists(kind, checksum)? {
            tracing::trace!("Object {checksum}.{} exists", kind.extension());
            return Ok(());
        }
        tf.replace(staged_name(kind, checksum))?;
        let mut txns = self.lock();
        let txn = txns
            .get_mut(&thread::current().id())
            .ok_or_else(|| anyhow!("Transaction ended during write"))?;
        txn.staged.push((kind, checksum.to_string()));
        Ok(())
    }

    fn write_metadata<T: Serialize>(&self, kind: ObjectType, v: &T) -> Result<String> {
        let buf = serde_json::to_vec(v)?;
        let checksum = hex::encode(&*openssl::hash::hash(MessageDigest::sha256(), &buf)?);
        let staging = self.staging_dir()?;
        let mut tf = TempFile::new(&staging)?;
        tf.as_file_mut().write_all(&buf)?;
        self.finish_object(kind, &checksum, tf)?;
        Ok(checksum)
    }

    fn read_metadata<T: for<'de> Deserialize<'de>>(
        &self,
        kind: ObjectType,
        checksum: &str,
    ) -> Result<T> {
        let f = self.open_object(kind, checksum)?;
        let mut buf = Vec::new();
        f.take(MAX_METADATA_SIZE).read_to_end(&mut buf)?;
        serde_json::from_slice(&buf)
            .with_context(|| format!("Parsing {} object {checksum}", kind.extension()))
    }

    fn write_file_object(
        &self,
        header: &ContentHeader,
        content: &mut dyn Read,
        size: u64,
    ) -> Result<String> {
        let header = serde_json::to_vec(header)?;
        let staging = self.staging_dir()?;
        let mut tf = TempFile::new(&staging)?;
        let mut hasher = Hasher::new(MessageDigest::sha256())?;
        let prefix = (header.len() as u64).to_be_bytes();
        for chunk in [prefix.as_slice(), header.as_slice()] {
            hasher.update(chunk)?;
            tf.as_file_mut().write_all(chunk)?;
        }
        let mut content = content.take(size);
        let mut buf = vec![0u8; 128 * 1024];
        let mut total = 0u64;
        loop {
            let n = match content.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            };
            hasher.update(&buf[..n])?;
            tf.as_file_mut().write_all(&buf[..n])?;
            total += n as u64;
        }
        if total != size {
            anyhow::bail!("Short content: expected {size} bytes, found {total}");
        }
        let checksum = sha256_hex(&mut hasher)?;
        self.finish_object(ObjectType::File, &checksum, tf)?;
        Ok(checksum)
    }

    fn write_ref(&self, name: &str, commit: Option<&str>) -> Result<()> {
        let path = ref_path(name)?;
        match commit {
            Some(commit) => {
                validate_sha256(commit)?;
                self.dir.atomic_write(&path, format!("{commit}\n"))?;
            }
            None => {
                self.dir.remove_file_optional(&path)?;
            }
        }
        tracing::debug!("Updated ref {name} => {commit:?}");
        Ok(())
    }

    /// Count the committed objects of all kinds.
    pub fn count_objects(&self) -> Result<usize> {
        let mut n = 0;
        for ent in self.dir.read_dir(OBJECTS)? {
            let ent = ent?;
            if ent.file_type()?.is_dir() {
                n += ent.open_dir()?.entries()?.count();
            }
        }
        Ok(n)
    }
}

impl Repo for FsRepo {
    fn prepare_transaction(&self) -> Result<()> {
        let id = thread::current().id();
        let mut txns = self.lock();
        if txns.contains_key(&id) {
            anyhow::bail!("A transaction is already active");
        }
        self.dir.create_dir_all(TMP)?;
        let staging = cap_tempfile::TempDir::new_in(&self.dir.open_dir(TMP)?)?;
        txns.insert(
            id,
            Transaction {
                staging,
                staged: Vec::new(),
                refs: BTreeMap::new(),
            },
        );
        Ok(())
    }

    #[context("Committing transaction")]
    fn commit_transaction(&self) -> Result<()> {
        let txn = self.lock().remove(&thread::current().id());
        let Transaction {
            staging,
            staged,
            refs,
        } = txn.ok_or_else(|| anyhow!("No transaction is active"))?;
        let n_objects = staged.len();
        for (kind, checksum) in staged {
            let dest = object_path(kind, &checksum);
            if self.dir.try_exists(&dest)? {
                continue;
            }
            self.dir.create_dir_all(format!("{OBJECTS}/{}", &checksum[..2]))?;
            staging
                .rename(staged_name(kind, &checksum), &self.dir, &dest)
                .with_context(|| format!("Moving {dest} into place"))?;
        }
        for (name, commit) in refs.iter() {
            self.write_ref(name, commit.as_deref())?;
        }
        staging.close()?;
        tracing::debug!(
            "Committed transaction: {n_objects} objects, {} refs",
            refs.len()
        );
        Ok(())
    }

    fn abort_transaction(&self) -> Result<()> {
        let txn = self.lock().remove(&thread::current().id());
        if let Some(txn) = txn {
            tracing::debug!("Aborting transaction with {} objects", txn.staged.len());
            txn.staging.close()?;
        }
        Ok(())
    }

    fn write_dirmeta(&self, meta: &DirMeta) -> Result<String> {
        self.write_metadata(ObjectType::DirMeta, meta)
    }

    fn write_content(
        &self,
        meta: &FileMeta,
        content: &mut dyn Read,
        size: u64,
    ) -> Result<String> {
        let header = ContentHeader {
            meta: meta.clone(),
            symlink: None,
        };
        self.write_file_object(&header, content, size)
    }

    fn write_symlink(&self, meta: &FileMeta, target: &str) -> Result<String> {
        let header = ContentHeader {
            meta: meta.clone(),
            symlink: Some(target.to_string()),
        };
        self.write_file_object(&header, &mut io::empty(), 0)
    }

    fn write_dirtree(&self, tree: &DirTree) -> Result<String> {
        self.write_metadata(ObjectType::DirTree, tree)
    }

    fn write_commit(&self, commit: &Commit) -> Result<String> {
        self.write_metadata(ObjectType::Commit, commit)
    }

    fn set_ref(&self, name: &str, commit: Option<&str>) -> Result<()> {
        ref_path(name)?;
        if let Some(txn) = self.lock().get_mut(&thread::current().id()) {
            txn.refs
                .insert(name.to_string(), commit.map(ToOwned::to_owned));
            return Ok(());
        }
        self.write_ref(name, commit)
    }

    fn resolve_ref(&self, name: &str) -> Result<Option<String>> {
        let Some(mut f) = self.dir.open_optional(ref_path(name)?)? else {
            return Ok(None);
        };
        let mut buf = String::new();
        f.read_to_string(&mut buf)?;
        let commit = buf.trim();
        validate_sha256(commit).with_context(|| format!("Reading ref {name}"))?;
        Ok(Some(commit.to_string()))
    }

    fn list_refs(&self, prefix: &str) -> Result<BTreeMap<String, String>> {
        let mut r = BTreeMap::new();
        for ent in self.dir.read_dir(REFS)? {
            let ent = ent?;
            let name = ent.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if !name.starts_with(prefix) {
                continue;
            }
            if let Some(commit) = self.resolve_ref(name)? {
                r.insert(name.to_string(), commit);
            }
        }
        Ok(r)
    }

    fn has_object(&self, kind: ObjectType, checksum: &str) -> Result<bool> {
        self.object_exists(kind, checksum)
    }

    fn read_commit(&self, checksum: &str) -> Result<Commit> {
        self.read_metadata(ObjectType::Commit, checksum)
    }

    fn read_dirtree(&self, checksum: &str) -> Result<DirTree> {
        self.read_metadata(ObjectType::DirTree, checksum)
    }

    fn read_dirmeta(&self, checksum: &str) -> Result<DirMeta> {
        self.read_metadata(ObjectType::DirMeta, checksum)
    }

    fn read_content(&self, checksum: &str) -> Result<(FileMeta, Content)> {
        let mut f = self.open_object(ObjectType::File, checksum)?;
        let mut len = [0u8; 8];
        f.read_exact(&mut len)?;
        let len = u64::from_be_bytes(len);
        if len > MAX_METADATA_SIZE {
            anyhow::bail!("Invalid header length {len} in file object {checksum}");
        }
        let mut header = vec![0u8; len as usize];
        f.read_exact(&mut header)?;
        let header: ContentHeader = serde_json::from_slice(&header)
            .with_context(|| format!("Parsing file object {checksum}"))?;
        let content = match header.symlink {
            Some(target) => Content::Symlink(target),
            None => Content::Regular(Box::new(f)),
        };
        Ok((header.meta, content))
    }
}
