//! Import packages into the store, one commit per package.
//!
//! Each package goes through a small state machine:
//!
//! ```text
//! Pending ─┬─> CacheHit ───────────────────────────────> Done
//!          └─> CacheMiss ─> Unpacking ─> Committing ───> Done
//! ```
//!
//! and ends in `Failed` from any state on the first error.  An import is
//! bracketed by one store transaction; nothing it wrote is visible unless
//! it reaches `Done`.

use std::collections::BTreeMap;
use std::fmt;
use std::io::Read;
use std::sync::Arc;

use anyhow::Result;
use fn_error_context::context;
use tokio_util::sync::CancellationToken;

use crate::cache;
use crate::idmap::IdMap;
use crate::nevra::Nevra;
use crate::overrides::HeaderIndex;
use crate::pkgmeta::PackageMeta;
use crate::repo::{AutoTransaction, Commit, Repo};
use crate::rpm::{self, Header, Package};
use crate::unpack::{self, UnpackOptions, UnpackStats};
use crate::Error;

/// Options for importing.
#[derive(Debug, Default, Clone)]
#[non_exhaustive]
pub struct ImportOptions {
    /// Resolution of the user and group names in package headers.
    pub idmap: IdMap,
    /// Checked before every archive entry and before committing.
    pub cancellable: Option<CancellationToken>,
}

/// Where a package import is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum ImportState {
    Pending,
    CacheHit,
    CacheMiss,
    Unpacking,
    Committing,
    Done,
    Failed,
}

impl fmt::Display for ImportState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Tracks and traces the state of one import.
#[derive(Debug)]
struct Tracker<'a> {
    pkg: &'a str,
    state: ImportState,
}

impl<'a> Tracker<'a> {
    fn new(pkg: &'a str) -> Self {
        Self {
            pkg,
            state: ImportState::Pending,
        }
    }

    fn transition(&mut self, to: ImportState) {
        tracing::debug!("{}: {} -> {}", self.pkg, self.state, to);
        self.state = to;
    }
}

/// The result of importing one package.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Imported {
    /// The package
    pub nevra: Nevra,
    /// The commit on the package's cache branch
    pub commit: String,
    /// Unpack counters; `None` if the package was already cached.
    pub stats: Option<UnpackStats>,
}

fn check_cancelled(opts: &ImportOptions) -> crate::Result<()> {
    match opts.cancellable.as_ref() {
        Some(c) if c.is_cancelled() => Err(Error::Cancelled),
        _ => Ok(()),
    }
}

fn write_package(
    repo: &dyn Repo,
    pkg: &mut Package<'_>,
    nevra: &Nevra,
    opts: &ImportOptions,
    tracker: &mut Tracker<'_>,
) -> Result<(String, UnpackStats)> {
    let index = HeaderIndex::build(&pkg.header)?;
    let meta = PackageMeta::from_header(&pkg.header)?;
    let txn = AutoTransaction::new(repo)?;

    tracker.transition(ImportState::Unpacking);
    let unpack_opts = UnpackOptions {
        idmap: opts.idmap.clone(),
        cancellable: opts.cancellable.clone(),
        ..Default::default()
    };
    let (tree, stats) = unpack::unpack_to_tree(&mut pkg.archive, &index, repo, &unpack_opts)?;

    tracker.transition(ImportState::Committing);
    check_cancelled(opts)?;
    let key = cache::cache_key(nevra);
    let mut metadata = BTreeMap::new();
    cache::record_header(&mut metadata, pkg.header.as_bytes());
    metadata.insert(cache::NEVRA_KEY.to_string(), key.clone());
    let commit = Commit {
        parent: None,
        subject: key,
        body: String::new(),
        // The build time, so importing the same package twice yields the
        // same commit.
        timestamp: meta.buildtime,
        root_tree: tree.tree,
        root_meta: tree.meta,
        metadata,
    };
    let commit = repo.write_commit(&commit)?;
    repo.set_ref(&cache::branch_for(nevra)?, Some(&commit))?;
    txn.commit()?;
    Ok((commit, stats))
}

/// Import an opened package, unless it is already cached.
#[tracing::instrument(level = "debug", skip_all)]
pub fn import_opened(
    repo: &dyn Repo,
    mut pkg: Package<'_>,
    opts: &ImportOptions,
) -> Result<Imported> {
    let nevra = pkg.header.nevra()?;
    let key = cache::cache_key(&nevra);
    let mut tracker = Tracker::new(&key);
    if let Some(commit) = cache::lookup(repo, &nevra)? {
        tracker.transition(ImportState::CacheHit);
        tracker.transition(ImportState::Done);
        return Ok(Imported {
            nevra,
            commit,
            stats: None,
        });
    }
    tracker.transition(ImportState::CacheMiss);
    match write_package(repo, &mut pkg, &nevra, opts, &mut tracker) {
        Ok((commit, stats)) => {
            tracker.transition(ImportState::Done);
            tracing::debug!("Wrote {} => {}", key, commit);
            Ok(Imported {
                nevra,
                commit,
                stats: Some(stats),
            })
        }
        Err(e) => {
            tracker.transition(ImportState::Failed);
            Err(e)
        }
    }
}

/// Import a complete package file.
pub fn import_package(
    repo: &dyn Repo,
    src: impl Read + Send,
    opts: &ImportOptions,
) -> Result<Imported> {
    import_opened(repo, rpm::open(src)?, opts)
}

/// Import a complete package file on the blocking thread pool.  The
/// import is cancelled if the returned future is dropped, or if the token
/// in `opts` is cancelled.
pub async fn import_package_async(
    repo: Arc<dyn Repo>,
    src: impl Read + Send + 'static,
    mut opts: ImportOptions,
) -> Result<Imported> {
    let token = opts
        .cancellable
        .take()
        .map(|c| c.child_token())
        .unwrap_or_default();
    crate::tokio_util::spawn_blocking_with_token_flatten(token, move |token| {
        opts.cancellable = Some(token.clone());
        import_package(repo.as_ref(), src, &opts)
    })
    .await
}

/// Import a package given as a serialized header and its raw
/// (still compressed) payload.
pub fn import_header_and_payload(
    repo: &dyn Repo,
    header: Vec<u8>,
    payload: impl Read + Send,
    opts: &ImportOptions,
) -> Result<Imported> {
    let header = Header::parse(header)?;
    import_opened(repo, rpm::from_parts(header, payload)?, opts)
}

/// Import a package by identity.  The cache is consulted first; on a miss
/// `fetch` provides the package file, whose identity must match.
#[context("Importing {nevra}")]
pub fn import_nevra<R, F>(
    repo: &dyn Repo,
    nevra: &Nevra,
    fetch: F,
    opts: &ImportOptions,
) -> Result<Imported>
where
    R: Read + Send,
    F: FnOnce(&Nevra) -> Result<R>,
{
    if let Some(commit) = cache::lookup(repo, nevra)? {
        tracing::debug!("{}: cached as {commit}", cache::cache_key(nevra));
        return Ok(Imported {
            nevra: nevra.clone(),
            commit,
            stats: None,
        });
    }
    let pkg = rpm::open(fetch(nevra)?)?;
    let found = pkg.header.nevra()?;
    if found != *nevra {
        return Err(Error::NevraMismatch {
            expected: cache::cache_key(nevra),
            found: cache::cache_key(&found),
        }
        .into());
    }
    import_opened(repo, pkg, opts)
}

#[derive(Debug, Default)]
struct BatchStats {
    cached: u32,
    imported: u32,
    regfiles: u32,
    bytes: u64,
}

/// Import a list of packages.  Each package is its own transaction; on
/// error, packages imported before the failing one stay committed.
#[tracing::instrument(level = "debug", skip_all, fields(n = nevras.len()))]
pub fn import_packages<R, F>(
    repo: &dyn Repo,
    nevras: &[Nevra],
    mut fetch: F,
    opts: &ImportOptions,
) -> Result<Vec<Imported>>
where
    R: Read + Send,
    F: FnMut(&Nevra) -> Result<R>,
{
    let mut stats = BatchStats::default();
    let mut r = Vec::with_capacity(nevras.len());
    for nevra in nevras {
        let imported = import_nevra(repo, nevra, &mut fetch, opts)?;
        match imported.stats.as_ref() {
            Some(s) => {
                stats.imported += 1;
                stats.regfiles += s.regfiles;
                stats.bytes += s.bytes;
            }
            None => stats.cached += 1,
        }
        r.push(imported);
    }
    tracing::debug!(
        "Imported {} packages ({} cached): {} files, {} bytes",
        stats.imported,
        stats.cached,
        stats.regfiles,
        stats.bytes
    );
    Ok(r)
}
