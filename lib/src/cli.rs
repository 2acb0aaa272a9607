//! # Package cache CLI
//!
//! Command line entry points to import packages into a cache repository,
//! unpack them to a directory and query what was imported.

use std::ffi::OsString;
use std::io::Write;
use std::sync::Arc;

use anyhow::{Context, Result};
use camino::Utf8PathBuf;
use cap_std::fs::Dir;
use cap_std_ext::cap_std;
use clap::Parser;
use fn_error_context::context;
use rpmcache_utils::PathQuotedDisplay;

use crate::filedb::FileDb;
use crate::idmap::IdMap;
use crate::importer::{self, ImportOptions};
use crate::nevra::Nevra;
use crate::repo::{FsRepo, Repo};
use crate::unpack::{self, UnpackOptions};
use crate::{cache, tokio_util};

/// Options shared by commands operating on a cache repository.
#[derive(Debug, Parser)]
pub(crate) struct RepoOpts {
    /// Path to the cache repository
    #[clap(long)]
    pub(crate) repo: Utf8PathBuf,
}

/// Import package files into the cache
#[derive(Debug, Parser)]
pub(crate) struct ImportOpts {
    #[clap(flatten)]
    pub(crate) repo: RepoOpts,

    /// Resolve user and group names from the passwd and group files of
    /// this root instead of the host.
    #[clap(long)]
    pub(crate) idmap_root: Option<Utf8PathBuf>,

    /// Package files
    #[clap(required = true)]
    pub(crate) rpms: Vec<Utf8PathBuf>,
}

/// Unpack a package file into a directory
#[derive(Debug, Parser)]
pub(crate) struct UnpackOpts {
    /// Apply file ownership from the package header
    #[clap(long)]
    pub(crate) owner: bool,

    /// Keep set-id bits and apply file capabilities
    #[clap(long)]
    pub(crate) suid_fscaps: bool,

    /// Resolve user and group names from the passwd and group files of
    /// this root instead of the host.
    #[clap(long)]
    pub(crate) idmap_root: Option<Utf8PathBuf>,

    /// Package file
    pub(crate) rpm: Utf8PathBuf,

    /// Existing destination directory
    pub(crate) dest: Utf8PathBuf,
}

/// Find the packages owning paths
#[derive(Debug, Parser)]
pub(crate) struct OwnerOpts {
    #[clap(flatten)]
    pub(crate) repo: RepoOpts,

    /// Root of the filesystem used to resolve symbolic links
    #[clap(long, default_value = "/")]
    pub(crate) root: Utf8PathBuf,

    /// Absolute paths
    #[clap(required = true)]
    pub(crate) paths: Vec<String>,
}

/// Manage a cache of unpacked RPM packages.
#[derive(Debug, Parser)]
#[clap(name = "rpmcache")]
#[clap(rename_all = "kebab-case")]
pub(crate) enum Opt {
    /// Import package files into the cache repository.
    ///
    /// Packages that are already cached are not unpacked again; the
    /// existing commit is printed.
    Import(ImportOpts),
    /// Unpack a package file into an existing directory.
    ///
    /// Without `--owner` files are owned by the invoking user.  On
    /// failure, whatever was already written is left in place.
    Unpack(UnpackOpts),
    /// Print the cache branch name for a package.
    Branch {
        /// Package identity, e.g. `foo-1:2.0-3.x86_64`
        nevra: String,
    },
    /// Print metadata of a cached package as JSON.
    Meta {
        #[clap(flatten)]
        repo: RepoOpts,
        /// Package identity
        nevra: Nevra,
    },
    /// Print the cached packages owning paths.
    Owner(OwnerOpts),
    /// List cached packages.
    List(RepoOpts),
}

fn load_idmap(root: Option<&Utf8PathBuf>) -> Result<IdMap> {
    let Some(root) = root else {
        return Ok(IdMap::Host);
    };
    let root = Dir::open_ambient_dir(root, cap_std::ambient_authority())
        .with_context(|| format!("Opening {root}"))?;
    IdMap::from_root(&root)
}

#[context("Importing packages")]
async fn import(opts: ImportOpts) -> Result<()> {
    let repo: Arc<dyn Repo> = Arc::new(FsRepo::open_or_create(&opts.repo.repo)?);
    let mut import_opts = ImportOptions::default();
    import_opts.idmap = load_idmap(opts.idmap_root.as_ref())?;
    for path in opts.rpms {
        let f = std::fs::File::open(&path).with_context(|| format!("Opening {path}"))?;
        let r = importer::import_package_async(Arc::clone(&repo), f, import_opts.clone())
            .await
            .with_context(|| format!("Importing {path}"))?;
        let state = if r.stats.is_some() {
            "imported"
        } else {
            "cached"
        };
        println!("{} {} ({state})", cache::cache_key(&r.nevra), r.commit);
    }
    Ok(())
}

async fn unpack(opts: UnpackOpts) -> Result<()> {
    let f = std::fs::File::open(&opts.rpm)
        .with_context(|| format!("Opening {}", PathQuotedDisplay::new(&opts.rpm)))?;
    let dest = Dir::open_ambient_dir(&opts.dest, cap_std::ambient_authority())
        .with_context(|| format!("Opening {}", PathQuotedDisplay::new(&opts.dest)))?;
    let idmap = load_idmap(opts.idmap_root.as_ref())?;
    let (owner, suid_fscaps) = (opts.owner, opts.suid_fscaps);
    let stats = tokio_util::spawn_blocking_cancellable_flatten(move |cancellable| {
        let opts = UnpackOptions {
            owner,
            suid_fscaps,
            idmap,
            cancellable: Some(cancellable.clone()),
        };
        unpack::unpack_package_to_dir(f, &dest, &opts)
    })
    .await
    .with_context(|| format!("Unpacking {}", PathQuotedDisplay::new(&opts.rpm)))?;
    tracing::debug!("{stats:?}");
    Ok(())
}

fn meta(repo: &RepoOpts, nevra: &Nevra) -> Result<()> {
    let repo = FsRepo::open(&repo.repo)?;
    let meta = cache::package_meta(&repo, nevra)?
        .ok_or_else(|| anyhow::anyhow!("Package {nevra} is not cached"))?;
    let mut stdout = std::io::stdout().lock();
    serde_json::to_writer_pretty(&mut stdout, &meta)?;
    writeln!(stdout)?;
    Ok(())
}

fn owner(opts: &OwnerOpts) -> Result<()> {
    let repo = FsRepo::open(&opts.repo.repo)?;
    let root = Dir::open_ambient_dir(&opts.root, cap_std::ambient_authority())
        .with_context(|| format!("Opening {}", opts.root))?;
    let db = FileDb::from_cache(root, &repo)?;
    let mut stdout = std::io::stdout().lock();
    for path in opts.paths.iter() {
        let pkgs = db
            .find_pkgs_for_file(path)
            .with_context(|| format!("Querying {path}"))?;
        writeln!(stdout, "{path}: {}", pkgs.join(" "))?;
    }
    Ok(())
}

fn list(opts: &RepoOpts) -> Result<()> {
    let repo = FsRepo::open(&opts.repo)?;
    let mut stdout = std::io::stdout().lock();
    for (nevra, commit) in cache::list_cached(&repo)? {
        writeln!(stdout, "{nevra} {commit}")?;
    }
    Ok(())
}

/// Parse the provided arguments and execute.
/// Calls [`clap::Error::exit`] on failure, printing the error message and aborting the program.
pub async fn run_from_iter<I>(args: I) -> Result<()>
where
    I: IntoIterator,
    I::Item: Into<OsString> + Clone,
{
    run_from_opt(Opt::parse_from(args)).await
}

/// Internal (non-generic/monomorphized) primary CLI entrypoint
async fn run_from_opt(opt: Opt) -> Result<()> {
    match opt {
        Opt::Import(opts) => import(opts).await,
        Opt::Unpack(opts) => unpack(opts).await,
        Opt::Branch { nevra } => {
            println!("{}", cache::branch_name_for(&nevra)?);
            Ok(())
        }
        Opt::Meta { repo, nevra } => meta(&repo, &nevra),
        Opt::Owner(opts) => owner(&opts),
        Opt::List(opts) => list(&opts),
    }
}

#[test]
fn test_parse_args() {
    let o = Opt::try_parse_from([
        "rpmcache",
        "import",
        "--repo",
        "/var/cache/rpmcache",
        "a.rpm",
        "b.rpm",
    ])
    .unwrap();
    let o = match o {
        Opt::Import(o) => o,
        o => panic!("Expected import opts, not {o:?}"),
    };
    assert_eq!(o.repo.repo.as_str(), "/var/cache/rpmcache");
    assert_eq!(o.rpms.len(), 2);
    assert!(o.idmap_root.is_none());

    let o = Opt::try_parse_from(["rpmcache", "meta", "--repo", "r", "foo-2:1.0-1.x86_64"]).unwrap();
    match o {
        Opt::Meta { nevra, .. } => assert_eq!(nevra.epoch, 2),
        o => panic!("Expected meta opts, not {o:?}"),
    }

    assert!(Opt::try_parse_from(["rpmcache", "import", "--repo", "r"]).is_err());
    assert!(Opt::try_parse_from(["rpmcache", "meta", "--repo", "r", "notanevra"]).is_err());
}
